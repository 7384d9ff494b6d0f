//! HMAC-SHA-256 signed OAuth state. The state round-trips through the
//! provider's redirect, so it must prove (a) we issued it, (b) for
//! which user, (c) recently. Verification is constant-time via the MAC
//! itself.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::VaultError;

type HmacSha256 = Hmac<Sha256>;

pub const STATE_MAX_AGE_SECONDS: i64 = 900;

#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct StatePayload {
    pub user_id: String,
    pub nonce: String,
    pub issued_at: i64,
}

fn mac_for(secret: &str, body: &str) -> HmacSha256 {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(body.as_bytes());
    mac
}

pub fn sign_state(secret: &str, user_id: &str, now: DateTime<Utc>) -> String {
    let payload = StatePayload {
        user_id: user_id.to_string(),
        nonce: hex::encode(rand::random::<[u8; 16]>()),
        issued_at: now.timestamp(),
    };
    let body =
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(&payload).expect("state payload serializes"));
    let sig = hex::encode(mac_for(secret, &body).finalize().into_bytes());
    format!("{body}.{sig}")
}

pub fn verify_state(
    secret: &str,
    state: &str,
    now: DateTime<Utc>,
) -> Result<StatePayload, VaultError> {
    let (body, sig_hex) = state
        .split_once('.')
        .ok_or_else(|| VaultError::BadInput("malformed state".to_string()))?;
    let sig = hex::decode(sig_hex)
        .map_err(|_| VaultError::BadInput("malformed state signature".to_string()))?;
    mac_for(secret, body)
        .verify_slice(&sig)
        .map_err(|_| VaultError::BadInput("state signature mismatch".to_string()))?;
    let payload: StatePayload = serde_json::from_slice(
        &URL_SAFE_NO_PAD
            .decode(body)
            .map_err(|_| VaultError::BadInput("malformed state payload".to_string()))?,
    )?;
    let age = now.timestamp() - payload.issued_at;
    if !(0..=STATE_MAX_AGE_SECONDS).contains(&age) {
        return Err(VaultError::BadInput("state expired".to_string()));
    }
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn round_trips_for_the_issuing_user() {
        let now = Utc::now();
        let state = sign_state("top-secret", "user-1", now);
        let payload = verify_state("top-secret", &state, now).unwrap();
        assert_eq!(payload.user_id, "user-1");
    }

    #[test]
    fn rejects_tampered_payloads() {
        let now = Utc::now();
        let state = sign_state("top-secret", "user-1", now);
        let (body, sig) = state.split_once('.').unwrap();
        let other = sign_state("top-secret", "user-2", now);
        let (other_body, _) = other.split_once('.').unwrap();
        assert!(verify_state("top-secret", &format!("{other_body}.{sig}"), now).is_err());
        assert!(verify_state("top-secret", &format!("{body}.deadbeef"), now).is_err());
        assert!(verify_state("top-secret", "garbage", now).is_err());
    }

    #[test]
    fn rejects_wrong_secret() {
        let now = Utc::now();
        let state = sign_state("top-secret", "user-1", now);
        assert!(verify_state("other-secret", &state, now).is_err());
    }

    #[test]
    fn rejects_stale_and_future_states() {
        let now = Utc::now();
        let state = sign_state("top-secret", "user-1", now);
        assert!(verify_state("top-secret", &state, now + Duration::seconds(901)).is_err());
        assert!(verify_state("top-secret", &state, now - Duration::seconds(5)).is_err());
        assert!(verify_state("top-secret", &state, now + Duration::seconds(60)).is_ok());
    }
}
