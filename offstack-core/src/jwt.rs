//! Bearer token claims
//!
//! Tokens are decoded without verifying their signature: the emulator only
//! needs the claims to populate request contexts and evaluate JWT
//! authorizers locally.

use jsonwebtoken::{decode, DecodingKey, Validation};
use serde_json::{Map, Value};
use std::collections::HashSet;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum JwtError {
    #[error("Missing bearer token")]
    Missing,

    #[error("Malformed token: {0}")]
    Malformed(String),
}

/// Claims and scopes extracted from a bearer token
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BearerClaims {
    pub claims: Map<String, Value>,
    pub scopes: Option<Vec<String>>,
}

impl BearerClaims {
    pub fn claim_str(&self, name: &str) -> Option<&str> {
        self.claims.get(name).and_then(Value::as_str)
    }
}

/// Drop a leading `Bearer ` scheme (case-insensitive)
pub fn strip_bearer(value: &str) -> &str {
    let value = value.trim();
    match value.get(..7) {
        Some(prefix) if prefix.eq_ignore_ascii_case("bearer ") => value[7..].trim(),
        _ => value,
    }
}

/// Decode the claims of a JWT without validating signature or expiry
pub fn decode_claims(token: &str) -> Result<BearerClaims, JwtError> {
    let token = strip_bearer(token);
    if token.is_empty() {
        return Err(JwtError::Missing);
    }

    let mut validation = Validation::default();
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims = HashSet::new();

    let data = decode::<Map<String, Value>>(token, &DecodingKey::from_secret(&[]), &validation)
        .map_err(|e| JwtError::Malformed(e.to_string()))?;

    let scopes = scopes_of(&data.claims);
    Ok(BearerClaims {
        claims: data.claims,
        scopes,
    })
}

fn scopes_of(claims: &Map<String, Value>) -> Option<Vec<String>> {
    match claims.get("scope").or_else(|| claims.get("scp"))? {
        Value::String(scope) => Some(scope.split_whitespace().map(ToString::to_string).collect()),
        Value::Array(items) => Some(
            items
                .iter()
                .filter_map(Value::as_str)
                .map(ToString::to_string)
                .collect(),
        ),
        _ => None,
    }
}

/// Claims from the `Authorization` header, if it carries a decodable JWT
pub fn bearer_claims(headers: &http::HeaderMap) -> Option<BearerClaims> {
    let value = headers.get(http::header::AUTHORIZATION)?.to_str().ok()?;
    decode_claims(value).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
    use serde_json::json;

    fn unsigned_token(claims: &Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
        format!("{header}.{payload}.c2lnbmF0dXJl")
    }

    #[test]
    fn test_strip_bearer() {
        assert_eq!(strip_bearer("Bearer abc"), "abc");
        assert_eq!(strip_bearer("bearer  abc"), "abc");
        assert_eq!(strip_bearer("abc"), "abc");
    }

    #[test]
    fn test_decode_claims_and_scopes() {
        let token = unsigned_token(&json!({"sub": "user-1", "scope": "read write"}));
        let claims = decode_claims(&format!("Bearer {token}")).unwrap();
        assert_eq!(claims.claim_str("sub"), Some("user-1"));
        assert_eq!(claims.scopes, Some(vec!["read".to_string(), "write".to_string()]));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(decode_claims("not-a-jwt"), Err(JwtError::Malformed(_))));
        assert!(matches!(decode_claims("Bearer "), Err(JwtError::Missing)));
    }
}
