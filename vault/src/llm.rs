//! LLM API keys are fully opaque: we bound length and charset, pick
//! the endpoint the worker should talk to, and nothing else.

use corral_common::args::ProviderArgs;

use crate::error::VaultError;

const KEY_MIN_LEN: usize = 8;
const KEY_MAX_LEN: usize = 512;

pub fn validate_key(key: &str) -> Result<(), VaultError> {
    if key.len() < KEY_MIN_LEN || key.len() > KEY_MAX_LEN {
        return Err(VaultError::BadInput(format!(
            "LLM key length must be between {} and {} characters",
            KEY_MIN_LEN, KEY_MAX_LEN
        )));
    }
    if !key
        .chars()
        .all(|c| c.is_ascii_graphic())
    {
        return Err(VaultError::BadInput(
            "LLM key must be printable ASCII without whitespace".to_string(),
        ));
    }
    Ok(())
}

/// Routing knob: a configured gateway URL wins over the direct
/// provider endpoint.
pub fn llm_endpoint(args: &ProviderArgs) -> &str {
    args.llm_gateway_url
        .as_deref()
        .unwrap_or(&args.llm_base_url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_opaque_keys() {
        assert!(validate_key("sk-ant-REDACTED").is_ok());
        assert!(validate_key("any-opaque-value-1").is_ok());
    }

    #[test]
    fn rejects_whitespace_and_extremes() {
        assert!(validate_key("short").is_err());
        assert!(validate_key("has space in key").is_err());
        assert!(validate_key(&"x".repeat(600)).is_err());
    }

    #[test]
    fn gateway_url_wins_over_direct() {
        let mut args = ProviderArgs {
            llm_base_url: "https://api.anthropic.com".to_string(),
            ..Default::default()
        };
        assert_eq!(llm_endpoint(&args), "https://api.anthropic.com");
        args.llm_gateway_url = Some("https://llm-gw.internal".to_string());
        assert_eq!(llm_endpoint(&args), "https://llm-gw.internal");
    }
}
