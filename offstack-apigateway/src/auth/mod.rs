//! Authorizer gate
//!
//! Runs before the integration: custom Lambda authorizers (token and
//! request), JWT authorizers for HTTP APIs, and the API key check for
//! private routes.

pub mod api_key;
pub mod jwt;
pub mod lambda;

use offstack_core::jwt::BearerClaims;
use offstack_core::{AuthorizedPrincipal, ErrorCode, GatewayError, PolicyError};
use offstack_lambda::LambdaService;
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::endpoint::{AuthorizerDescriptor, AuthorizerKind, ConfigurationError, GatewayOptions};
use crate::request::GatewayRequest;
use crate::routes::RouteMatch;

pub use api_key::ApiKeys;

/// Fallback principal when no authorizer supplied one
pub const DEFAULT_PRINCIPAL_ID: &str = "offlineContext_authorizer_principalId";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthorizerError {
    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    InvalidContext(String),
}

impl AuthorizerError {
    pub fn unauthorized() -> Self {
        Self::Unauthorized("Unauthorized".to_string())
    }

    pub fn to_gateway_error(&self) -> GatewayError {
        let code = match self {
            Self::Unauthorized(_) => ErrorCode::Unauthorized,
            Self::Forbidden(_) => ErrorCode::Forbidden,
            Self::InvalidContext(_) => ErrorCode::AuthorizerConfiguration,
        };
        GatewayError::new(code, self.to_string())
    }
}

impl From<PolicyError> for AuthorizerError {
    fn from(error: PolicyError) -> Self {
        match error {
            PolicyError::Unauthorized => Self::unauthorized(),
            PolicyError::MissingPrincipal | PolicyError::Denied => Self::Forbidden(error.to_string()),
            PolicyError::InvalidContext => Self::InvalidContext(error.to_string()),
        }
    }
}

/// What a successful authorizer hands to the integration
#[derive(Debug, Clone, PartialEq)]
pub enum AuthCredentials {
    Lambda(AuthorizedPrincipal),
    Jwt {
        claims: Map<String, Value>,
        scopes: Option<Vec<String>>,
    },
}

impl AuthCredentials {
    pub fn principal_id(&self) -> Option<&str> {
        match self {
            Self::Lambda(principal) if !principal.principal_id.is_empty() => Some(&principal.principal_id),
            _ => None,
        }
    }

    pub fn usage_identifier_key(&self) -> Option<&str> {
        match self {
            Self::Lambda(principal) => principal.usage_identifier_key.as_deref(),
            Self::Jwt { .. } => None,
        }
    }

    /// Authorizer context values, empty for JWT
    pub fn context(&self) -> Map<String, Value> {
        match self {
            Self::Lambda(principal) => principal.context.clone(),
            Self::Jwt { .. } => Map::new(),
        }
    }
}

/// `requestContext.authorizer` of REST (payload 1.0) events and templates:
/// the context values, latency, principal, plus bearer claims when present
pub fn v1_authorizer(credentials: Option<&AuthCredentials>, bearer: Option<&BearerClaims>) -> Value {
    let mut authorizer = Map::new();
    if let Some(credentials) = credentials {
        authorizer.extend(credentials.context());
        if matches!(credentials, AuthCredentials::Lambda(_)) {
            authorizer.insert("integrationLatency".to_string(), json!("42"));
        }
    }

    let (claims, scopes) = match (credentials, bearer) {
        (Some(AuthCredentials::Jwt { claims, scopes }), _) => (Some(claims.clone()), scopes.clone()),
        (_, Some(bearer)) => (Some(bearer.claims.clone()), bearer.scopes.clone()),
        _ => (None, None),
    };
    if let Some(claims) = claims {
        authorizer.insert("claims".to_string(), Value::Object(claims));
    }
    if let Some(scopes) = scopes {
        authorizer.insert("scopes".to_string(), json!(scopes));
    }

    let principal_id = credentials
        .and_then(AuthCredentials::principal_id)
        .unwrap_or(DEFAULT_PRINCIPAL_ID);
    authorizer.insert("principalId".to_string(), json!(principal_id));
    Value::Object(authorizer)
}

/// `requestContext.authorizer` of HTTP API (payload 2.0) events
pub fn v2_authorizer(credentials: Option<&AuthCredentials>, bearer: Option<&BearerClaims>) -> Value {
    match (credentials, bearer) {
        (Some(AuthCredentials::Lambda(principal)), _) => json!({"lambda": principal.context}),
        (Some(AuthCredentials::Jwt { claims, scopes }), _) => json!({"jwt": {"claims": claims, "scopes": scopes}}),
        (None, Some(bearer)) => json!({"jwt": {"claims": bearer.claims, "scopes": bearer.scopes}}),
        (None, None) => json!({}),
    }
}

/// Header named by `method.request.header.X` / `$request.header.X`, lower case
pub fn identity_header(descriptor: &AuthorizerDescriptor) -> Result<Option<String>, ConfigurationError> {
    let (prefix, default) = match descriptor.kind {
        AuthorizerKind::Request => return Ok(None),
        AuthorizerKind::Token => ("method.request.header.", "method.request.header.Authorization"),
        AuthorizerKind::Jwt => ("$request.header.", "$request.header.Authorization"),
    };
    let source = descriptor.identity_source.as_deref().unwrap_or(default);
    match source.strip_prefix(prefix) {
        Some(name) if !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') => {
            Ok(Some(name.to_lowercase()))
        }
        _ => Err(ConfigurationError::Authorizer {
            name: descriptor.name.clone(),
            message: format!("only header identity sources are supported, got '{source}'"),
        }),
    }
}

/// Check an authorizer declaration once, at route setup
pub fn validate(descriptor: &AuthorizerDescriptor, service: &LambdaService) -> Result<(), ConfigurationError> {
    identity_header(descriptor)?;
    match descriptor.kind {
        AuthorizerKind::Jwt => {
            if descriptor.issuer_url.is_none() {
                return Err(ConfigurationError::Authorizer {
                    name: descriptor.name.clone(),
                    message: "JWT authorizers need an issuer url".to_string(),
                });
            }
        }
        AuthorizerKind::Token | AuthorizerKind::Request => {
            if service.get_function(descriptor.function_key()).is_none() {
                return Err(ConfigurationError::Authorizer {
                    name: descriptor.name.clone(),
                    message: format!("function '{}' is not registered", descriptor.function_key()),
                });
            }
            if let Some(expression) = &descriptor.identity_validation_expression {
                regex::Regex::new(expression).map_err(|e| ConfigurationError::Authorizer {
                    name: descriptor.name.clone(),
                    message: format!("invalid identity validation expression: {e}"),
                })?;
            }
        }
    }
    Ok(())
}

/// Run the endpoint's authorizer, if any
pub async fn authorize(
    service: &LambdaService,
    options: &GatewayOptions,
    request: &GatewayRequest,
    route: &RouteMatch,
) -> Result<Option<AuthCredentials>, AuthorizerError> {
    let Some(descriptor) = &route.endpoint.authorizer else {
        return Ok(None);
    };

    let credentials = match descriptor.kind {
        AuthorizerKind::Jwt => jwt::authorize(descriptor, request, chrono::Utc::now())?,
        AuthorizerKind::Token | AuthorizerKind::Request => {
            lambda::authorize(service, options, descriptor, request, route).await?
        }
    };
    Ok(Some(credentials))
}
