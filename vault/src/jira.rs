//! Jira basic credentials: account email + API token against a cloud
//! or self-hosted instance URL.

use serde::Deserialize;

use crate::error::VaultError;

const TOKEN_MIN_LEN: usize = 8;
const TOKEN_MAX_LEN: usize = 512;

pub fn validate(email: &str, token: &str, instance_url: &str) -> Result<(), VaultError> {
    if !email.contains('@') || email.len() < 3 {
        return Err(VaultError::BadInput(
            "Jira account email looks malformed".to_string(),
        ));
    }
    if token.len() < TOKEN_MIN_LEN || token.len() > TOKEN_MAX_LEN {
        return Err(VaultError::BadInput(format!(
            "Jira API token length must be between {} and {} characters",
            TOKEN_MIN_LEN, TOKEN_MAX_LEN
        )));
    }
    if token.chars().any(|c| c.is_whitespace()) {
        return Err(VaultError::BadInput(
            "Jira API token must not contain whitespace".to_string(),
        ));
    }
    crate::gitlab::validate_instance_url(instance_url)
}

#[derive(Deserialize, Default)]
pub struct JiraUser {
    #[serde(default, rename = "displayName")]
    pub display_name: Option<String>,
    #[serde(default, rename = "emailAddress")]
    pub email: Option<String>,
}

pub async fn fetch_identity(
    http: &reqwest::Client,
    instance: &str,
    email: &str,
    token: &str,
) -> Option<JiraUser> {
    let base = instance.trim_end_matches('/');
    let res = http
        .get(format!("{}/rest/api/3/myself", base))
        .basic_auth(email, Some(token))
        .send()
        .await
        .ok()?;
    if !res.status().is_success() {
        return None;
    }
    res.json().await.ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plausible_credentials() {
        assert!(validate("dev@acme.test", "ATATT3xFfGF0abcdef", "https://acme.atlassian.net").is_ok());
    }

    #[test]
    fn rejects_bad_email_token_or_url() {
        assert!(validate("not-an-email", "ATATT3xFfGF0abcdef", "https://acme.atlassian.net").is_err());
        assert!(validate("dev@acme.test", "short", "https://acme.atlassian.net").is_err());
        assert!(validate("dev@acme.test", "has space00", "https://acme.atlassian.net").is_err());
        assert!(validate("dev@acme.test", "ATATT3xFfGF0abcdef", "http://acme.atlassian.net").is_err());
    }
}
