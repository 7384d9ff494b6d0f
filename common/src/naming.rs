//! Name validation shared by every ingress point: the HTTP handlers,
//! the scheduler's spec checks, and the cleanup matcher. Names follow
//! the cluster's own object-name rule: lowercase alphanumeric plus `-`,
//! alphanumeric at both ends, at most 63 characters.

pub const MAX_NAME_LEN: usize = 63;

pub fn is_valid_name(name: &str) -> bool {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.len() > MAX_NAME_LEN {
        return false;
    }
    if !bytes[0].is_ascii_alphanumeric() || !bytes[bytes.len() - 1].is_ascii_alphanumeric() {
        return false;
    }
    bytes
        .iter()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-')
}

/// Same predicate with a caller-facing message.
pub fn validate_name(kind: &str, name: &str) -> anyhow::Result<()> {
    if is_valid_name(name) {
        return Ok(());
    }
    anyhow::bail!(
        "invalid {} name '{}': must be 1-63 lowercase alphanumeric or '-' characters, starting and ending alphanumeric",
        kind,
        name
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn accepts_ordinary_names() {
        for name in ["fix-typo-1", "a", "team-a", "x0", "abc-def-ghi"] {
            assert!(is_valid_name(name), "{name}");
        }
    }

    #[test]
    fn rejects_malformed_names() {
        for name in [
            "",
            "-leading",
            "trailing-",
            "UPPER",
            "under_score",
            "dot.name",
            "spa ce",
            "émoji",
            "a--b-", // trailing dash, internal doubles are fine
        ] {
            assert!(!is_valid_name(name), "{name}");
        }
        assert!(is_valid_name("a--b"));
    }

    #[test]
    fn rejects_names_over_63_chars() {
        let long = "a".repeat(64);
        assert!(!is_valid_name(&long));
        let max = "a".repeat(63);
        assert!(is_valid_name(&max));
    }

    #[test]
    fn validate_name_names_the_kind() {
        let err = validate_name("tenant", "Bad-Name").unwrap_err();
        assert!(err.to_string().contains("tenant"));
        assert!(err.to_string().contains("Bad-Name"));
    }

    proptest! {
        // Membership in the language is exactly: ^[a-z0-9]([a-z0-9-]*[a-z0-9])?$ up to 63 chars.
        #[test]
        fn accepts_exactly_the_naming_language(name in "[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?") {
            prop_assert!(is_valid_name(&name));
        }

        #[test]
        fn never_accepts_invalid_characters(name in ".*") {
            if is_valid_name(&name) {
                prop_assert!(name.len() <= MAX_NAME_LEN);
                prop_assert!(name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));
                prop_assert!(!name.starts_with('-') && !name.ends_with('-'));
            }
        }
    }
}
