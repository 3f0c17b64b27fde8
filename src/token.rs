//! Signed session tokens for agent authentication.
//!
//! HS256 over the configured secret, 30-day expiry, issuer
//! `"cli-auth-backend"`. Verification is total: any altered payload, bad
//! signature, wrong issuer, or expired token yields `None` — the registry
//! never sees a token error, only an absent claim set.

use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AppError, Result};

/// Token issuer baked into every session token.
pub const ISSUER: &str = "cli-auth-backend";

/// Session token lifetime in days.
pub const EXPIRY_DAYS: i64 = 30;

/// Claims carried by a session token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user id)
    pub sub: Uuid,
    pub email: String,
    #[serde(rename = "deviceId")]
    pub device_id: String,
    /// Issued at (unix seconds)
    pub iat: i64,
    /// Expiration (unix seconds)
    pub exp: i64,
    pub iss: String,
}

/// Issues and verifies session tokens.
pub struct TokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl TokenService {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    /// Sign a 30-day session token for a user/device pair.
    pub fn issue(&self, user_id: Uuid, email: &str, device_id: &str) -> Result<String> {
        let now = Utc::now();
        let claims = Claims {
            sub: user_id,
            email: email.to_string(),
            device_id: device_id.to_string(),
            iat: now.timestamp(),
            exp: (now + Duration::days(EXPIRY_DAYS)).timestamp(),
            iss: ISSUER.to_string(),
        };
        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| AppError::Internal(format!("Token encoding failed: {e}")))
    }

    /// Verify a token and return its claims, or `None` when the token is
    /// invalid in any way (signature, issuer, expiry, shape).
    pub fn verify(&self, token: &str) -> Option<Claims> {
        let mut validation = Validation::default();
        validation.set_issuer(&[ISSUER]);
        decode::<Claims>(token, &self.decoding_key, &validation)
            .ok()
            .map(|data| data.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> TokenService {
        TokenService::new("test-secret")
    }

    #[test]
    fn test_issue_and_verify_roundtrip() {
        let svc = service();
        let user_id = Uuid::new_v4();
        let token = svc.issue(user_id, "u@x", "device_1_abc").unwrap();

        let claims = svc.verify(&token).expect("token should verify");
        assert_eq!(claims.sub, user_id);
        assert_eq!(claims.email, "u@x");
        assert_eq!(claims.device_id, "device_1_abc");
        assert_eq!(claims.iss, ISSUER);
        assert!(claims.exp > claims.iat);
    }

    #[test]
    fn test_tampered_token_rejected() {
        let svc = service();
        let token = svc.issue(Uuid::new_v4(), "u@x", "d").unwrap();

        // Flip a character in the payload segment
        let mut parts: Vec<String> = token.split('.').map(String::from).collect();
        let mut payload: Vec<u8> = parts[1].clone().into_bytes();
        payload[0] = if payload[0] == b'A' { b'B' } else { b'A' };
        parts[1] = String::from_utf8(payload).unwrap();
        let tampered = parts.join(".");

        assert!(svc.verify(&tampered).is_none());
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let token = service().issue(Uuid::new_v4(), "u@x", "d").unwrap();
        let other = TokenService::new("other-secret");
        assert!(other.verify(&token).is_none());
    }

    #[test]
    fn test_expired_token_rejected() {
        let svc = service();
        let now = Utc::now();
        let claims = Claims {
            sub: Uuid::new_v4(),
            email: "u@x".to_string(),
            device_id: "d".to_string(),
            iat: (now - Duration::days(31)).timestamp(),
            exp: (now - Duration::days(1)).timestamp(),
            iss: ISSUER.to_string(),
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(b"test-secret"),
        )
        .unwrap();
        assert!(svc.verify(&token).is_none());
    }

    #[test]
    fn test_wrong_issuer_rejected() {
        let svc = service();
        let now = Utc::now();
        let claims = Claims {
            sub: Uuid::new_v4(),
            email: "u@x".to_string(),
            device_id: "d".to_string(),
            iat: now.timestamp(),
            exp: (now + Duration::days(1)).timestamp(),
            iss: "someone-else".to_string(),
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(b"test-secret"),
        )
        .unwrap();
        assert!(svc.verify(&token).is_none());
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(service().verify("not-a-token").is_none());
    }
}
