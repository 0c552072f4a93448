//! Unverified peek at the claims of backend-issued JWTs
//!
//! The client never trusts these claims for authorization; the backend does that. They are only
//! used to avoid persisting a credential longer than the backend will honour it.

use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;

/// The one claim the client reads from RehearseKit tokens
#[derive(Debug, Clone, Deserialize)]
pub struct TokenClaims {
    /// Expiration time (Unix timestamp)
    #[serde(default)]
    pub exp: Option<i64>,
}

impl TokenClaims {
    /// Decode claims without verifying the signature. Opaque (non-JWT) tokens yield `None`.
    pub fn peek(token: &str) -> Option<Self> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.insecure_disable_signature_validation();
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();

        match decode::<TokenClaims>(token, &DecodingKey::from_secret(&[]), &validation) {
            Ok(data) => Some(data.claims),
            Err(e) => {
                tracing::debug!("Token is not a decodable JWT: {}", e);
                None
            }
        }
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.exp
            .and_then(|exp| Utc.timestamp_opt(exp, 0).single())
    }
}

/// Expiry to persist for a token: the configured lifetime, shortened by the `exp` claim if any
pub fn effective_expiry(token: &str, lifetime: chrono::Duration) -> DateTime<Utc> {
    let by_lifetime = Utc::now() + lifetime;

    match TokenClaims::peek(token).and_then(|claims| claims.expires_at()) {
        Some(exp) if exp < by_lifetime => exp,
        _ => by_lifetime,
    }
}
