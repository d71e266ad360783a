//! Endpoint descriptors and their resolved form
//!
//! Descriptors are what the project declares; `Endpoint::resolve` merges
//! them with the gateway defaults once, at setup.

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

use crate::schema::RequestSchemas;

/// Problems found while building routes. The affected route is skipped.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Endpoint for function '{0}' needs either a method and path or a route key")]
    MissingRoute(String),

    #[error("Function '{0}' is not registered")]
    UnknownFunction(String),

    #[error("Unsupported integration '{integration}' for function '{function}'")]
    UnsupportedIntegration { function: String, integration: String },

    #[error("Unsupported payload version '{0}'")]
    UnsupportedPayload(String),

    #[error("Invalid selection pattern '{pattern}': {message}")]
    InvalidSelectionPattern { pattern: String, message: String },

    #[error("Invalid request schema for '{content_type}': {message}")]
    InvalidSchema { content_type: String, message: String },

    #[error("Authorizer '{name}': {message}")]
    Authorizer { name: String, message: String },
}

/// Gateway-wide CORS policy of an HTTP API
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HttpApiCors {
    pub allowed_origins: Vec<String>,
    pub allowed_headers: Vec<String>,
    pub allowed_methods: Vec<String>,
    pub allow_credentials: bool,
    pub exposed_response_headers: Vec<String>,
    pub max_age: Option<u64>,
}

impl HttpApiCors {
    pub fn allows_origin(&self, origin: &str) -> bool {
        self.allowed_origins
            .iter()
            .any(|allowed| allowed == "*" || allowed == origin)
    }
}

/// Options of the HTTP gateway
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayOptions {
    pub host: String,
    pub stage: String,
    pub region: String,
    pub no_prepend_stage_in_url: bool,
    /// Skip every authorizer and API key check
    pub no_auth: bool,
    pub api_keys: Vec<String>,
    pub hide_stack_traces: bool,
    pub http_api_cors: Option<HttpApiCors>,
    pub disable_cors: bool,
    pub enable_simple_authorizer_responses: bool,
    pub stage_variables: Option<HashMap<String, String>>,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            stage: "dev".to_string(),
            region: "us-east-1".to_string(),
            no_prepend_stage_in_url: false,
            no_auth: false,
            api_keys: Vec::new(),
            hide_stack_traces: false,
            http_api_cors: None,
            disable_cors: false,
            enable_simple_authorizer_responses: false,
            stage_variables: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthorizerKind {
    #[default]
    Token,
    Request,
    Jwt,
}

/// Authorizer attached to an endpoint
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuthorizerDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: AuthorizerKind,
    /// Function key of a custom authorizer, defaults to `name`
    pub function: Option<String>,
    pub identity_source: Option<String>,
    pub identity_validation_expression: Option<String>,
    /// `"1.0"` or `"2.0"` for HTTP API request authorizers
    pub payload_version: Option<String>,
    pub enable_simple_responses: bool,
    pub issuer_url: Option<String>,
    pub audience: Vec<String>,
    pub scopes: Vec<String>,
}

impl AuthorizerDescriptor {
    pub fn function_key(&self) -> &str {
        self.function.as_deref().unwrap_or(&self.name)
    }
}

/// Per-endpoint CORS declaration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CorsDescriptor {
    pub origins: Vec<String>,
    pub headers: Vec<String>,
    pub exposed_headers: Vec<String>,
    pub credentials: bool,
}

impl Default for CorsDescriptor {
    fn default() -> Self {
        Self {
            origins: vec!["*".to_string()],
            headers: vec![
                "Content-Type".to_string(),
                "X-Amz-Date".to_string(),
                "Authorization".to_string(),
                "X-Api-Key".to_string(),
                "X-Amz-Security-Token".to_string(),
                "X-Amz-User-Agent".to_string(),
            ],
            exposed_headers: Vec::new(),
            credentials: false,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RequestDescriptor {
    /// Content type -> mapping template
    pub templates: HashMap<String, String>,
    /// Content type -> JSON schema
    pub schemas: HashMap<String, Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ResponseDescriptor {
    /// Literal headers, values quoted as `'value'`
    pub headers: HashMap<String, String>,
    pub template: Option<String>,
}

/// A named integration response
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ResponseMapping {
    pub selection_pattern: Option<String>,
    pub status_code: Option<u16>,
    /// Content type -> response template
    pub templates: HashMap<String, String>,
    /// `method.response.header.X` -> `'literal'` or `integration.response.body[.path]`
    pub parameters: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContentHandling {
    ConvertToBinary,
    ConvertToText,
}

/// An HTTP event as declared by the project
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EndpointDescriptor {
    pub function: String,
    pub method: Option<String>,
    pub path: Option<String>,
    /// `"METHOD /path"` or `$default`
    pub route_key: Option<String>,
    pub http_api: bool,
    pub payload: Option<String>,
    pub integration: Option<String>,
    #[serde(rename = "async")]
    pub is_async: bool,
    pub private: bool,
    pub authorizer: Option<AuthorizerDescriptor>,
    pub cors: Option<CorsDescriptor>,
    pub request: Option<RequestDescriptor>,
    pub response: Option<ResponseDescriptor>,
    pub responses: BTreeMap<String, ResponseMapping>,
    pub content_handling: Option<ContentHandling>,
    pub operation_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrationType {
    /// `AWS_PROXY`: the function sees the whole request
    Proxy,
    /// `AWS`: the event comes out of a mapping template
    Template,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadVersion {
    V1,
    V2,
}

/// Request template for one content type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestTemplate {
    /// The built-in `{body, method, principalId, ...}` event
    Default,
    Custom(String),
}

/// Response template for one content type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseTemplate {
    /// Pass the result through
    Passthrough,
    Custom(String),
}

/// A resolved integration response
#[derive(Debug, Clone)]
pub struct IntegrationResponse {
    pub name: String,
    pub pattern: Regex,
    pub status_code: Option<u16>,
    pub templates: HashMap<String, ResponseTemplate>,
    pub parameters: Vec<(String, String)>,
}

/// An endpoint with every default applied
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub function: String,
    /// Upper case, `ANY` matches every method
    pub method: String,
    /// Path template without the stage prefix, or `$default`
    pub path: String,
    pub route_key: Option<String>,
    pub http_api: bool,
    pub payload: PayloadVersion,
    pub integration: IntegrationType,
    pub is_async: bool,
    pub private: bool,
    pub stage: String,
    pub authorizer: Option<AuthorizerDescriptor>,
    pub cors: Option<CorsDescriptor>,
    pub request_templates: HashMap<String, RequestTemplate>,
    pub schemas: RequestSchemas,
    /// Literal response headers, quotes stripped
    pub response_headers: Vec<(String, String)>,
    pub response_content_type: String,
    /// `default` first, then the others by name
    pub responses: Vec<IntegrationResponse>,
    pub content_handling: Option<ContentHandling>,
    pub operation_id: Option<String>,
}

const JSON: &str = "application/json";

fn unquote(value: &str) -> Option<&str> {
    value
        .strip_prefix('\'')
        .and_then(|value| value.strip_suffix('\''))
}

/// Explicit override > legacy alias > default from the async flag
fn integration_type(descriptor: &EndpointDescriptor) -> Result<IntegrationType, ConfigurationError> {
    if descriptor.http_api {
        return Ok(IntegrationType::Proxy);
    }
    match descriptor.integration.as_deref() {
        None if descriptor.is_async => Ok(IntegrationType::Template),
        None => Ok(IntegrationType::Proxy),
        Some(integration) => match integration.to_uppercase().replace('-', "_").as_str() {
            "AWS" | "LAMBDA" => Ok(IntegrationType::Template),
            "AWS_PROXY" | "LAMBDA_PROXY" => Ok(IntegrationType::Proxy),
            _ => Err(ConfigurationError::UnsupportedIntegration {
                function: descriptor.function.clone(),
                integration: integration.to_string(),
            }),
        },
    }
}

fn payload_version(descriptor: &EndpointDescriptor) -> Result<PayloadVersion, ConfigurationError> {
    match (descriptor.http_api, descriptor.payload.as_deref()) {
        (false, _) | (true, Some("1.0")) => Ok(PayloadVersion::V1),
        (true, None | Some("2.0")) => Ok(PayloadVersion::V2),
        (true, Some(other)) => Err(ConfigurationError::UnsupportedPayload(other.to_string())),
    }
}

fn selection_regex(pattern: &str) -> Result<Regex, ConfigurationError> {
    Regex::new(&format!("^(?s:{pattern})$")).map_err(|e| ConfigurationError::InvalidSelectionPattern {
        pattern: pattern.to_string(),
        message: e.to_string(),
    })
}

impl Endpoint {
    /// Merge a descriptor with the gateway defaults
    pub fn resolve(descriptor: &EndpointDescriptor, options: &GatewayOptions) -> Result<Self, ConfigurationError> {
        let (method, path, route_key) = if descriptor.http_api {
            match descriptor.route_key.as_deref() {
                Some("$default") => ("ANY".to_string(), "$default".to_string(), "$default".to_string()),
                Some(route_key) => {
                    let (method, path) = route_key
                        .split_once(' ')
                        .ok_or_else(|| ConfigurationError::MissingRoute(descriptor.function.clone()))?;
                    (method.trim().to_uppercase(), path.trim().to_string(), route_key.to_string())
                }
                None => {
                    let (Some(method), Some(path)) = (&descriptor.method, &descriptor.path) else {
                        return Err(ConfigurationError::MissingRoute(descriptor.function.clone()));
                    };
                    let method = method.to_uppercase();
                    let method = if method == "*" { "ANY".to_string() } else { method };
                    let path = normalize_path(path);
                    let route_key = if method == "ANY" {
                        format!("ANY {path}")
                    } else {
                        format!("{method} {path}")
                    };
                    (method, path, route_key)
                }
            }
        } else {
            let (Some(method), Some(path)) = (&descriptor.method, &descriptor.path) else {
                return Err(ConfigurationError::MissingRoute(descriptor.function.clone()));
            };
            (method.to_uppercase(), normalize_path(path), String::new())
        };

        let integration = integration_type(descriptor)?;
        let payload = payload_version(descriptor)?;
        let stage = if descriptor.http_api {
            "$default".to_string()
        } else {
            options.stage.clone()
        };

        let request = descriptor.request.clone().unwrap_or_default();
        let response = descriptor.response.clone().unwrap_or_default();

        let mut request_templates: HashMap<String, RequestTemplate> = request
            .templates
            .iter()
            .map(|(content_type, template)| (content_type.to_lowercase(), RequestTemplate::Custom(template.clone())))
            .collect();
        if integration == IntegrationType::Template && request_templates.is_empty() {
            request_templates.insert(JSON.to_string(), RequestTemplate::Default);
        }

        let response_content_type = response
            .headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("content-type"))
            .map_or_else(|| JSON.to_string(), |(_, value)| value.replace('\'', ""));

        let response_headers = response
            .headers
            .iter()
            .filter_map(|(name, value)| unquote(value).map(|value| (name.clone(), value.to_string())))
            .collect();

        let responses = resolve_responses(descriptor, &response, &response_content_type)?;
        let schemas = RequestSchemas::compile(&request.schemas)?;

        Ok(Self {
            function: descriptor.function.clone(),
            method,
            path,
            route_key: descriptor.http_api.then_some(route_key),
            http_api: descriptor.http_api,
            payload,
            integration,
            is_async: descriptor.is_async,
            private: descriptor.private,
            stage,
            authorizer: descriptor.authorizer.clone(),
            cors: descriptor.cors.clone(),
            request_templates,
            schemas,
            response_headers,
            response_content_type,
            responses,
            content_handling: descriptor.content_handling,
            operation_id: descriptor.operation_id.clone(),
        })
    }

    /// The integration response named `default`
    pub fn default_response(&self) -> Option<&IntegrationResponse> {
        self.responses.iter().find(|response| response.name == "default")
    }

    /// First non-default response whose pattern matches the whole error message
    pub fn select_response(&self, error_message: &str) -> Option<&IntegrationResponse> {
        self.responses
            .iter()
            .filter(|response| response.name != "default")
            .find(|response| response.pattern.is_match(error_message))
    }

    /// `METHOD path` as shown in logs and the not-found listing
    pub fn describe(&self) -> String {
        match &self.route_key {
            Some(route_key) => route_key.clone(),
            None => format!("{} {}", self.method, self.path),
        }
    }
}

fn resolve_responses(
    descriptor: &EndpointDescriptor,
    response: &ResponseDescriptor,
    response_content_type: &str,
) -> Result<Vec<IntegrationResponse>, ConfigurationError> {
    let mut declared = descriptor.responses.clone();
    let default = declared.remove("default").unwrap_or_else(|| ResponseMapping {
        status_code: Some(200),
        ..ResponseMapping::default()
    });

    let mut default_templates: HashMap<String, ResponseTemplate> = default
        .templates
        .iter()
        .map(|(content_type, template)| (content_type.to_lowercase(), ResponseTemplate::Custom(template.clone())))
        .collect();
    let default_template = match &response.template {
        Some(template) => ResponseTemplate::Custom(template.clone()),
        None => ResponseTemplate::Passthrough,
    };
    default_templates
        .entry(response_content_type.to_lowercase())
        .or_insert(default_template);

    let mut responses = vec![IntegrationResponse {
        name: "default".to_string(),
        pattern: selection_regex("default")?,
        status_code: default.status_code,
        templates: default_templates,
        parameters: default.parameters.into_iter().collect(),
    }];

    for (name, mapping) in declared {
        let pattern = selection_regex(mapping.selection_pattern.as_deref().unwrap_or(&name))?;
        responses.push(IntegrationResponse {
            pattern,
            status_code: mapping.status_code,
            templates: mapping
                .templates
                .into_iter()
                .map(|(content_type, template)| (content_type.to_lowercase(), ResponseTemplate::Custom(template)))
                .collect(),
            parameters: mapping.parameters.into_iter().collect(),
            name,
        });
    }
    Ok(responses)
}

/// Leading slash, no trailing slash
pub fn normalize_path(path: &str) -> String {
    let trimmed = path.trim().trim_matches('/');
    format!("/{trimmed}")
}
