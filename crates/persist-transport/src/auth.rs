//! Operator authentication via HS256 session tokens.

use axum::http::{HeaderMap, header};
use chrono::{TimeDelta, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use persist_core::traits::{AuthError, Authenticator, Operator};
use serde::{Deserialize, Serialize};

/// Claims carried by an operator session token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorClaims {
    #[serde(rename = "userId")]
    pub user_id: String,
    pub username: String,
    pub rank: u8,
    pub iat: i64,
    pub exp: i64,
}

/// Verifies HS256 tokens signed with a shared secret.
pub struct JwtAuthenticator {
    key: DecodingKey,
    validation: Validation,
}

impl JwtAuthenticator {
    #[must_use]
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }
}

impl Authenticator for JwtAuthenticator {
    fn verify(&self, token: &str) -> Result<Operator, AuthError> {
        let data = decode::<OperatorClaims>(token, &self.key, &self.validation)
            .map_err(|e| AuthError::Invalid(e.to_string()))?;
        Ok(Operator {
            user_id: data.claims.user_id,
            username: data.claims.username,
            rank: data.claims.rank,
        })
    }
}

/// Rejects every token. Used when no secret is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenyAll;

impl Authenticator for DenyAll {
    fn verify(&self, _token: &str) -> Result<Operator, AuthError> {
        Err(AuthError::Invalid("operator authentication is not configured".to_string()))
    }
}

/// Sign a session token for `operator`, valid for `ttl`.
///
/// # Errors
/// Returns error if encoding fails.
pub fn sign_token(secret: &str, operator: &Operator, ttl: TimeDelta) -> Result<String, AuthError> {
    let now = Utc::now();
    let claims = OperatorClaims {
        user_id: operator.user_id.clone(),
        username: operator.username.clone(),
        rank: operator.rank,
        iat: now.timestamp(),
        exp: (now + ttl).timestamp(),
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| AuthError::Invalid(e.to_string()))
}

/// Pull the session token from `Authorization: Bearer` or the named cookie.
#[must_use]
pub fn extract_token<'a>(headers: &'a HeaderMap, cookie_name: &str) -> Option<&'a str> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty());
    if bearer.is_some() {
        return bearer;
    }

    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, value)| *name == cookie_name && !value.is_empty())
        .map(|(_, value)| value)
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    const SECRET: &str = "test-secret";

    fn operator() -> Operator {
        Operator {
            user_id: "01HXOPERATOR".to_string(),
            username: "admin".to_string(),
            rank: 3,
        }
    }

    #[test]
    fn test_sign_and_verify() {
        let token = sign_token(SECRET, &operator(), TimeDelta::hours(1)).unwrap();
        let verified = JwtAuthenticator::new(SECRET).verify(&token).unwrap();
        assert_eq!(verified, operator());
    }

    #[test]
    fn test_rejects_wrong_secret_and_expired() {
        let token = sign_token("other", &operator(), TimeDelta::hours(1)).unwrap();
        assert!(JwtAuthenticator::new(SECRET).verify(&token).is_err());

        let expired = sign_token(SECRET, &operator(), TimeDelta::hours(-2)).unwrap();
        assert!(JwtAuthenticator::new(SECRET).verify(&expired).is_err());

        assert!(JwtAuthenticator::new(SECRET).verify("garbage").is_err());
    }

    #[test]
    fn test_deny_all() {
        let token = sign_token(SECRET, &operator(), TimeDelta::hours(1)).unwrap();
        assert!(DenyAll.verify(&token).is_err());
    }

    #[test]
    fn test_extract_token_sources() {
        let mut headers = HeaderMap::new();
        assert_eq!(extract_token(&headers, "persist_session"), None);

        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("theme=dark; persist_session=abc.def.ghi"),
        );
        assert_eq!(extract_token(&headers, "persist_session"), Some("abc.def.ghi"));
        assert_eq!(extract_token(&headers, "other"), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer xyz"));
        assert_eq!(extract_token(&headers, "persist_session"), Some("xyz"));
    }
}
