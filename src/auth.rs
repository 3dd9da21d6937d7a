//! Password hashing and signed tokens.
//!
//! Passwords are stored as `salt$hex(HMAC-SHA256(salt, password))`.
//!
//! Tokens carry `{sub, purpose, exp}` as base64url JSON followed by a hex
//! HMAC-SHA256 signature under the application secret:
//!
//! ```text
//! eyJzdWIiOjEsInB1cnBvc2UiOiJzZXNzaW9uIiwiZXhwIjoxNzAwMDAwMDAwfQ.5f1c…
//! ```
//!
//! Verification fails closed: any malformed, forged, expired or
//! wrong-purpose token is simply `None`.

use anyhow::{anyhow, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const PURPOSE_SESSION: &str = "session";
pub const PURPOSE_RESET_PASSWORD: &str = "reset_password";

fn mac(key: &[u8]) -> Result<HmacSha256> {
    HmacSha256::new_from_slice(key).map_err(|e| anyhow!("invalid HMAC key: {}", e))
}

pub fn hash_password(password: &str) -> Result<String> {
    let salt = uuid::Uuid::new_v4().simple().to_string();
    let mut m = mac(salt.as_bytes())?;
    m.update(password.as_bytes());
    Ok(format!("{}${}", salt, hex::encode(m.finalize().into_bytes())))
}

pub fn verify_password(stored: &str, password: &str) -> bool {
    let Some((salt, digest)) = stored.split_once('$') else {
        return false;
    };
    let Ok(expected) = hex::decode(digest) else {
        return false;
    };
    let Ok(mut m) = mac(salt.as_bytes()) else {
        return false;
    };
    m.update(password.as_bytes());
    m.verify_slice(&expected).is_ok()
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: i64,
    purpose: String,
    exp: i64,
}

/// Sign a token for `user_id`, valid for `ttl_secs`.
pub fn issue_token(secret: &str, user_id: i64, purpose: &str, ttl_secs: i64) -> Result<String> {
    let claims = Claims {
        sub: user_id,
        purpose: purpose.to_string(),
        exp: Utc::now().timestamp() + ttl_secs,
    };
    let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims)?);
    let mut m = mac(secret.as_bytes())?;
    m.update(payload.as_bytes());
    Ok(format!("{}.{}", payload, hex::encode(m.finalize().into_bytes())))
}

/// The user id a valid token was issued for.
pub fn verify_token(secret: &str, token: &str, purpose: &str) -> Option<i64> {
    let (payload, signature) = token.split_once('.')?;
    let signature = hex::decode(signature).ok()?;

    let mut m = mac(secret.as_bytes()).ok()?;
    m.update(payload.as_bytes());
    m.verify_slice(&signature).ok()?;

    let json = URL_SAFE_NO_PAD.decode(payload).ok()?;
    let claims: Claims = serde_json::from_slice(&json).ok()?;
    if claims.purpose != purpose || claims.exp <= Utc::now().timestamp() {
        return None;
    }
    Some(claims.sub)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_round_trip() {
        let h = hash_password("cat").unwrap();
        assert!(verify_password(&h, "cat"));
        assert!(!verify_password(&h, "dog"));
        assert_ne!(h, hash_password("cat").unwrap(), "salt must differ");
    }

    #[test]
    fn malformed_hash_never_verifies() {
        assert!(!verify_password("", "cat"));
        assert!(!verify_password("salt$zz", "cat"));
    }

    #[test]
    fn token_verifies_for_its_purpose_only() {
        let t = issue_token("k", 42, PURPOSE_RESET_PASSWORD, 600).unwrap();
        assert_eq!(verify_token("k", &t, PURPOSE_RESET_PASSWORD), Some(42));
        assert_eq!(verify_token("k", &t, PURPOSE_SESSION), None);
        assert_eq!(verify_token("other", &t, PURPOSE_RESET_PASSWORD), None);
    }

    #[test]
    fn expired_token_is_rejected() {
        let t = issue_token("k", 1, PURPOSE_SESSION, -1).unwrap();
        assert_eq!(verify_token("k", &t, PURPOSE_SESSION), None);
    }

    #[test]
    fn garbage_fails_closed() {
        for t in ["", ".", "abc", "abc.def", "!!!.00", "e30.00"] {
            assert_eq!(verify_token("k", t, PURPOSE_SESSION), None, "{}", t);
        }

        let t = issue_token("k", 1, PURPOSE_SESSION, 60).unwrap();
        let (payload, sig) = t.split_once('.').unwrap();
        let forged_payload = URL_SAFE_NO_PAD.encode(br#"{"sub":2,"purpose":"session","exp":9999999999}"#);
        assert_eq!(
            verify_token("k", &format!("{}.{}", forged_payload, sig), PURPOSE_SESSION),
            None
        );
        assert_eq!(verify_token("k", &format!("{}x.{}", payload, sig), PURPOSE_SESSION), None);
    }
}
