use chrono::{DateTime, Duration, TimeZone, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

/// Claims carried by a provider-issued access token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessClaims {
    pub sub: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    pub exp: i64,
    pub iat: i64,
}

impl AccessClaims {
    pub fn new(sub: impl Into<String>, email: Option<String>, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            sub: sub.into(),
            email,
            role: Some("authenticated".to_string()),
            exp: (now + ttl).timestamp(),
            iat: now.timestamp(),
        }
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.exp, 0).single().unwrap_or_else(Utc::now)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JwtError {
    #[error("JWT generation error: {0}")]
    TokenGeneration(String),
    #[error("JWT decode error: {0}")]
    Decode(String),
    #[error("Invalid JWT secret")]
    InvalidSecret,
}

pub fn generate_jwt(secret: &str, claims: &AccessClaims) -> Result<String, JwtError> {
    if secret.is_empty() {
        return Err(JwtError::InvalidSecret);
    }

    let encoding_key = EncodingKey::from_secret(secret.as_bytes());
    encode(&Header::default(), claims, &encoding_key)
        .map_err(|e| JwtError::TokenGeneration(e.to_string()))
}

/// Check signature and expiry, with no clock leeway
pub fn verify_jwt(secret: &str, token: &str) -> Result<AccessClaims, JwtError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.leeway = 0;
    decode::<AccessClaims>(token, &DecodingKey::from_secret(secret.as_bytes()), &validation)
        .map(|data| data.claims)
        .map_err(|e| JwtError::Decode(e.to_string()))
}

/// Read claims without checking the signature or expiry.
/// The client only needs `sub`/`exp`; the backend is the one that verifies.
pub fn peek_claims(token: &str) -> Result<AccessClaims, JwtError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.required_spec_claims.clear();
    decode::<AccessClaims>(token, &DecodingKey::from_secret(&[]), &validation)
        .map(|data| data.claims)
        .map_err(|e| JwtError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_verification() {
        let claims = AccessClaims::new("user-1", Some("user@example.com".into()), Duration::hours(1));
        let token = generate_jwt("secret", &claims).unwrap();
        let verified = verify_jwt("secret", &token).unwrap();
        assert_eq!(verified.sub, "user-1");
        assert!(verify_jwt("other-secret", &token).is_err());
    }

    #[test]
    fn expired_token_fails_verification() {
        let claims = AccessClaims::new("user-1", None, Duration::seconds(-1));
        let token = generate_jwt("secret", &claims).unwrap();
        assert!(matches!(verify_jwt("secret", &token), Err(JwtError::Decode(_))));
    }

    #[test]
    fn peek_ignores_signature_and_expiry() {
        let claims = AccessClaims::new("user-2", None, Duration::hours(-2));
        let token = generate_jwt("server-only", &claims).unwrap();
        let peeked = peek_claims(&token).unwrap();
        assert_eq!(peeked.sub, "user-2");
        assert!(peeked.expires_at() < Utc::now());
    }

    #[test]
    fn empty_secret_is_rejected() {
        let claims = AccessClaims::new("user-3", None, Duration::minutes(5));
        assert!(matches!(generate_jwt("", &claims), Err(JwtError::InvalidSecret)));
    }
}
