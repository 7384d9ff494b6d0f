//! Google Workspace OAuth: expiry guard window and the refresh-token
//! grant. The stored refresh token survives refresh failures; only a
//! successful response mutates the record.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;

pub const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
pub const USERINFO_URL: &str = "https://openidconnect.googleapis.com/v1/userinfo";

/// Access tokens inside this window are treated as already expired so
/// a worker never starts with a token about to lapse mid-clone.
pub const REFRESH_GUARD: ChronoDuration = ChronoDuration::seconds(300);

/// Whether a token with the given expiry needs refreshing at `now`.
/// Tokens without an expiry never refresh.
pub fn needs_refresh(expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    match expires_at {
        Some(at) => at - now < REFRESH_GUARD,
        None => false,
    }
}

pub struct RefreshedToken {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
    /// Google only returns a new refresh token when rotating; absent
    /// means keep using the stored one.
    pub refresh_token: Option<String>,
}

pub enum RefreshFailure {
    /// Provider-side 5xx or transport error; worth retrying.
    Transient(String),
    /// The grant was rejected; the user has to re-authenticate.
    Denied(String),
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    refresh_token: Option<String>,
}

pub async fn refresh(
    http: &reqwest::Client,
    client_id: &str,
    client_secret: &str,
    refresh_token: &str,
    now: DateTime<Utc>,
) -> Result<RefreshedToken, RefreshFailure> {
    let res = http
        .post(TOKEN_URL)
        .form(&[
            ("grant_type", "refresh_token"),
            ("client_id", client_id),
            ("client_secret", client_secret),
            ("refresh_token", refresh_token),
        ])
        .send()
        .await
        .map_err(|e| RefreshFailure::Transient(format!("token refresh request failed: {e}")))?;
    let status = res.status();
    if status.is_server_error() {
        return Err(RefreshFailure::Transient(format!(
            "token refresh returned {}",
            status
        )));
    }
    if !status.is_success() {
        let body = res.text().await.unwrap_or_default();
        return Err(RefreshFailure::Denied(format!(
            "token refresh returned {}: {}",
            status,
            corral_common::redact::redact_secrets(&body)
        )));
    }
    let token: TokenResponse = res
        .json()
        .await
        .map_err(|e| RefreshFailure::Transient(format!("bad token refresh response: {e}")))?;
    if token.access_token.is_empty() {
        return Err(RefreshFailure::Denied(
            "token refresh response missing access_token".to_string(),
        ));
    }
    Ok(RefreshedToken {
        access_token: token.access_token,
        expires_at: now + ChronoDuration::seconds(token.expires_in.unwrap_or(3600)),
        refresh_token: token.refresh_token,
    })
}

#[derive(Deserialize, Default)]
pub struct GoogleUser {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

pub async fn fetch_identity(http: &reqwest::Client, token: &str) -> Option<GoogleUser> {
    let res = http.get(USERINFO_URL).bearer_auth(token).send().await.ok()?;
    if !res.status().is_success() {
        return None;
    }
    res.json().await.ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_window_marks_soon_to_expire_tokens() {
        let now = Utc::now();
        assert!(needs_refresh(Some(now + ChronoDuration::seconds(120)), now));
        assert!(needs_refresh(Some(now - ChronoDuration::seconds(1)), now));
        assert!(!needs_refresh(Some(now + ChronoDuration::seconds(600)), now));
        assert!(!needs_refresh(None, now));
    }
}
