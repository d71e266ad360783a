//! JWT authorizers of HTTP APIs
//!
//! The token is decoded without checking its signature; expiry, issuer,
//! audience and scopes are checked against the declaration.

use chrono::{DateTime, Utc};
use offstack_core::jwt::decode_claims;
use serde_json::Value;
use tracing::{debug, info};

use super::{identity_header, AuthCredentials, AuthorizerError};
use crate::endpoint::AuthorizerDescriptor;
use crate::request::GatewayRequest;

fn strings(value: Option<&Value>) -> Vec<&str> {
    match value {
        Some(Value::String(s)) => vec![s.as_str()],
        Some(Value::Array(items)) => items.iter().filter_map(Value::as_str).collect(),
        _ => Vec::new(),
    }
}

pub fn authorize(
    descriptor: &AuthorizerDescriptor,
    request: &GatewayRequest,
    now: DateTime<Utc>,
) -> Result<AuthCredentials, AuthorizerError> {
    info!(
        authorizer = %descriptor.name,
        method = %request.method,
        path = %request.path,
        "Running JWT authorization"
    );

    let header = identity_header(descriptor)
        .ok()
        .flatten()
        .unwrap_or_else(|| "authorization".to_string());
    let token = request.header(&header).unwrap_or_default();

    let bearer = decode_claims(token).map_err(|e| {
        debug!(authorizer = %descriptor.name, error = %e, "JWT could not be decoded");
        AuthorizerError::unauthorized()
    })?;
    let claims = &bearer.claims;

    if let Some(exp) = claims.get("exp").and_then(Value::as_f64) {
        #[allow(clippy::cast_possible_truncation)]
        let expires_ms = (exp * 1000.0) as i64;
        if expires_ms < now.timestamp_millis() {
            return Err(AuthorizerError::Unauthorized("JWT Token expired".to_string()));
        }
    }

    if bearer.claim_str("iss") != descriptor.issuer_url.as_deref() {
        info!(authorizer = %descriptor.name, "JWT Token not from correct issuer url");
        return Err(AuthorizerError::Unauthorized(
            "JWT Token not from correct issuer url".to_string(),
        ));
    }

    let audiences = strings(claims.get("aud"));
    let valid_audience = audiences
        .iter()
        .any(|aud| descriptor.audience.iter().any(|valid| valid == aud))
        || bearer
            .claim_str("client_id")
            .is_some_and(|client| descriptor.audience.iter().any(|valid| valid == client));
    if !valid_audience {
        info!(authorizer = %descriptor.name, "JWT Token does not contain correct audience");
        return Err(AuthorizerError::Unauthorized(
            "JWT Token does not contain correct audience".to_string(),
        ));
    }

    let scopes = if descriptor.scopes.is_empty() {
        None
    } else {
        let provided = bearer.scopes.clone().unwrap_or_default();
        if !provided.iter().any(|scope| descriptor.scopes.contains(scope)) {
            info!(authorizer = %descriptor.name, "JWT Token missing valid scope");
            return Err(AuthorizerError::Forbidden("JWT Token missing valid scope".to_string()));
        }
        Some(provided)
    };

    info!(authorizer = %descriptor.name, "JWT Token validated");
    Ok(AuthCredentials::Jwt {
        claims: bearer.claims,
        scopes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::AuthorizerKind;
    use crate::request::tests::request;
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
    use chrono::TimeZone;
    use http::{HeaderValue, Method};
    use serde_json::json;

    fn token(claims: &Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
        format!("Bearer {header}.{payload}.c2lnbmF0dXJl")
    }

    fn descriptor(scopes: &[&str]) -> AuthorizerDescriptor {
        AuthorizerDescriptor {
            name: "jwt".to_string(),
            kind: AuthorizerKind::Jwt,
            identity_source: Some("$request.header.Authorization".to_string()),
            issuer_url: Some("https://issuer.example.com".to_string()),
            audience: vec!["my-app".to_string()],
            scopes: scopes.iter().map(ToString::to_string).collect(),
            ..AuthorizerDescriptor::default()
        }
    }

    fn check(claims: &Value, scopes: &[&str]) -> Result<AuthCredentials, AuthorizerError> {
        let mut req = request(Method::GET, "/items", "");
        req.headers
            .insert("authorization", HeaderValue::from_str(&token(claims)).unwrap());
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        authorize(&descriptor(scopes), &req, now)
    }

    fn claims() -> Value {
        json!({
            "iss": "https://issuer.example.com",
            "aud": ["my-app", "other"],
            "exp": 4_102_444_800_i64,
            "scope": "read write",
            "sub": "user-1"
        })
    }

    #[test]
    fn test_valid_token() {
        let credentials = check(&claims(), &["read"]).unwrap();
        let AuthCredentials::Jwt { claims, scopes } = credentials else {
            panic!("expected JWT credentials");
        };
        assert_eq!(claims["sub"], "user-1");
        assert_eq!(scopes, Some(vec!["read".to_string(), "write".to_string()]));
    }

    #[test]
    fn test_expired_token() {
        let mut expired = claims();
        expired["exp"] = json!(1_000);
        assert_eq!(
            check(&expired, &[]),
            Err(AuthorizerError::Unauthorized("JWT Token expired".to_string()))
        );
    }

    #[test]
    fn test_wrong_issuer() {
        let mut other = claims();
        other["iss"] = json!("https://elsewhere");
        assert!(matches!(check(&other, &[]), Err(AuthorizerError::Unauthorized(_))));
    }

    #[test]
    fn test_audience_or_client_id() {
        let mut other = claims();
        other["aud"] = json!("someone-else");
        assert!(matches!(check(&other, &[]), Err(AuthorizerError::Unauthorized(_))));

        other["client_id"] = json!("my-app");
        assert!(check(&other, &[]).is_ok());
    }

    #[test]
    fn test_missing_scope_is_forbidden() {
        assert_eq!(
            check(&claims(), &["admin"]),
            Err(AuthorizerError::Forbidden("JWT Token missing valid scope".to_string()))
        );
    }

    #[test]
    fn test_missing_token() {
        let req = request(Method::GET, "/items", "");
        let now = Utc::now();
        assert_eq!(authorize(&descriptor(&[]), &req, now), Err(AuthorizerError::unauthorized()));
    }
}
