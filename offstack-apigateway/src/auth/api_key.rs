//! API keys of private routes

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tracing::info;

use crate::endpoint::GatewayOptions;

pub const API_KEY_HEADER: &str = "x-api-key";

#[derive(Debug, Clone, Default)]
pub struct ApiKeys {
    keys: Vec<String>,
}

impl ApiKeys {
    /// Configured keys; one is generated and logged when private routes
    /// exist and none are configured
    pub fn from_options(options: &GatewayOptions, has_private_routes: bool) -> Self {
        if !has_private_routes {
            return Self {
                keys: options.api_keys.clone(),
            };
        }

        if options.no_auth {
            info!("Authorizers are turned off. You do not need to use 'x-api-key' header.");
        } else {
            info!("Remember to use 'x-api-key' on the request headers.");
        }

        let mut keys = options.api_keys.clone();
        if keys.is_empty() {
            let key = uuid::Uuid::new_v4().simple().to_string();
            info!(key = %key, "Generated API key");
            keys.push(key);
        } else {
            for key in &keys {
                info!(key = %key, "API key");
            }
        }
        Self { keys }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.iter().any(|known| known == key)
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }
}

/// `403 {"message":"Forbidden"}` as API Gateway answers a bad or missing key
pub fn forbidden_response() -> Response {
    (
        StatusCode::FORBIDDEN,
        [
            ("content-type", "application/json"),
            ("x-amzn-errortype", "ForbiddenException"),
        ],
        r#"{"message":"Forbidden"}"#,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_key_when_none_configured() {
        let keys = ApiKeys::from_options(&GatewayOptions::default(), true);
        assert_eq!(keys.keys().len(), 1);
        assert_eq!(keys.keys()[0].len(), 32);
        assert!(keys.contains(&keys.keys()[0].clone()));
    }

    #[test]
    fn test_configured_keys() {
        let options = GatewayOptions {
            api_keys: vec!["secret".to_string()],
            ..GatewayOptions::default()
        };
        let keys = ApiKeys::from_options(&options, true);
        assert!(keys.contains("secret"));
        assert!(!keys.contains("other"));
    }

    #[test]
    fn test_no_generation_without_private_routes() {
        assert!(ApiKeys::from_options(&GatewayOptions::default(), false).keys().is_empty());
    }

    #[test]
    fn test_forbidden_response() {
        let response = forbidden_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(response.headers()["x-amzn-errortype"], "ForbiddenException");
    }
}
