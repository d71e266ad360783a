//! Custom Lambda authorizers (TOKEN and REQUEST)

use offstack_core::{authorizer, time::format_clf, RequestId};
use offstack_lambda::LambdaService;
use regex::Regex;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use super::{identity_header, AuthCredentials, AuthorizerError};
use crate::endpoint::{AuthorizerDescriptor, AuthorizerKind, GatewayOptions};
use crate::request::GatewayRequest;
use crate::routes::RouteMatch;

const ACCOUNT_ID: &str = "random-account-id";
const API_ID: &str = "random-api-id";

fn path_parameters(route: &RouteMatch) -> Value {
    if route.path_params.is_empty() {
        Value::Null
    } else {
        json!(route.path_params)
    }
}

/// HTTP API authorizers with payload 2.0 get the v2 request shape
fn uses_v2_payload(descriptor: &AuthorizerDescriptor, route: &RouteMatch) -> bool {
    route.endpoint.http_api && descriptor.payload_version.as_deref() != Some("1.0")
}

/// Event for a TOKEN or REQUEST authorizer. A token that is missing or
/// fails the validation expression is rejected before any invocation.
pub fn authorizer_event(
    options: &GatewayOptions,
    descriptor: &AuthorizerDescriptor,
    request: &GatewayRequest,
    route: &RouteMatch,
) -> Result<Value, AuthorizerError> {
    let endpoint = &route.endpoint;
    let http_method = request.method.as_str().to_uppercase();
    let resource_path = endpoint.path.clone();
    let method_arn = authorizer::method_arn(&options.region, &endpoint.stage, &http_method, &resource_path);

    if uses_v2_payload(descriptor, route) {
        let headers = request.header_values();
        let query = request.query();
        return Ok(json!({
            "version": "2.0",
            "type": "REQUEST",
            "routeArn": method_arn,
            "identitySource": descriptor
                .identity_source
                .as_deref()
                .and_then(|source| source.strip_prefix("$request.header."))
                .and_then(|name| headers.get(name))
                .map(|value| vec![value.to_string()])
                .unwrap_or_default(),
            "routeKey": endpoint.route_key,
            "rawPath": request.path,
            "rawQueryString": request.raw_query.clone().unwrap_or_default(),
            "cookies": offstack_core::params::parse_cookies(&request.headers),
            "headers": headers.joined(),
            "queryStringParameters": query.joined(),
            "requestContext": {
                "accountId": ACCOUNT_ID,
                "apiId": API_ID,
                "http": {
                    "method": http_method,
                    "path": request.path,
                    "protocol": "HTTP/1.1",
                    "sourceIp": request.source_ip,
                    "userAgent": request.user_agent(),
                },
                "requestId": RequestId::new().id,
                "routeKey": endpoint.route_key,
                "stage": endpoint.stage,
                "time": format_clf(&request.received_at),
                "timeEpoch": request.received_at.timestamp_millis(),
            },
            "pathParameters": path_parameters(route),
            "stageVariables": options.stage_variables,
        }));
    }

    let mut event = Map::new();
    event.insert("enhancedAuthContext".to_string(), json!({}));
    event.insert("methodArn".to_string(), json!(method_arn));
    event.insert(
        "requestContext".to_string(),
        json!({
            "accountId": ACCOUNT_ID,
            "apiId": API_ID,
            "httpMethod": http_method,
            "requestId": "random-request-id",
            "resourceId": "random-resource-id",
            "resourcePath": resource_path,
            "path": request.path,
            "stage": endpoint.stage,
        }),
    );
    event.insert("resource".to_string(), json!(resource_path));

    match descriptor.kind {
        AuthorizerKind::Request => {
            let headers = request.header_values();
            let query = request.query();
            event.insert("type".to_string(), json!("REQUEST"));
            event.insert("headers".to_string(), json!(headers.single));
            event.insert("multiValueHeaders".to_string(), json!(headers.multi));
            event.insert("queryStringParameters".to_string(), json!(query.single));
            event.insert("multiValueQueryStringParameters".to_string(), json!(query.multi));
            event.insert("pathParameters".to_string(), path_parameters(route));
            event.insert("httpMethod".to_string(), json!(http_method));
            event.insert("path".to_string(), json!(request.path));
            event.insert("stageVariables".to_string(), json!(options.stage_variables));
        }
        AuthorizerKind::Token | AuthorizerKind::Jwt => {
            let header = identity_header(descriptor)
                .map_err(|e| {
                    warn!(authorizer = %descriptor.name, error = %e, "Unusable identity source");
                    AuthorizerError::unauthorized()
                })?
                .unwrap_or_else(|| "authorization".to_string());
            let Some(token) = request.header(&header).filter(|token| !token.is_empty()) else {
                debug!(authorizer = %descriptor.name, header = %header, "Identity header missing");
                return Err(AuthorizerError::unauthorized());
            };
            if let Some(expression) = &descriptor.identity_validation_expression {
                let matches = Regex::new(&format!("^(?:{expression})$")).is_ok_and(|re| re.is_match(token));
                if !matches {
                    debug!(authorizer = %descriptor.name, "Token failed the identity validation expression");
                    return Err(AuthorizerError::unauthorized());
                }
            }
            event.insert("type".to_string(), json!("TOKEN"));
            event.insert("authorizationToken".to_string(), json!(token));
        }
    }

    Ok(Value::Object(event))
}

/// Invoke the authorizer function and evaluate its answer
pub async fn authorize(
    service: &LambdaService,
    options: &GatewayOptions,
    descriptor: &AuthorizerDescriptor,
    request: &GatewayRequest,
    route: &RouteMatch,
) -> Result<AuthCredentials, AuthorizerError> {
    info!(
        authorizer = %descriptor.name,
        method = %request.method,
        path = %request.path,
        "Running authorization function"
    );

    let event = authorizer_event(options, descriptor, request, route)?;
    let method_arn = event
        .get("methodArn")
        .or_else(|| event.get("routeArn"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let result = service
        .invoke(descriptor.function_key(), event, None)
        .await
        .map_err(|e| {
            info!(authorizer = %descriptor.name, error = %e, "Authorization function returned an error");
            AuthorizerError::unauthorized()
        })?;

    let simple = uses_v2_payload(descriptor, route)
        && (descriptor.enable_simple_responses || options.enable_simple_authorizer_responses);
    let principal = if simple {
        authorizer::evaluate_simple(&result)
    } else {
        authorizer::evaluate(&result, &method_arn)
    }
    .map_err(|e| {
        info!(authorizer = %descriptor.name, reason = %e, "Authorization denied");
        AuthorizerError::from(e)
    })?;

    info!(authorizer = %descriptor.name, principal = %principal.principal_id, "Authorization succeeded");
    Ok(AuthCredentials::Lambda(principal))
}
