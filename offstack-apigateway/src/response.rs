//! Function results to HTTP responses
//!
//! Template-mapped endpoints pick a declared integration response (by
//! selection pattern for errors), apply header mappings and an optional
//! response template. Proxy endpoints take the status, headers and body from
//! the result itself.

use axum::{
    body::Body,
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::Response,
};
use base64::{engine::general_purpose, Engine};
use offstack_core::{error::error_reply_body, json_path};
use offstack_lambda::InvocationError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use tracing::{debug, error, warn};

use crate::endpoint::{ContentHandling, Endpoint, IntegrationResponse, PayloadVersion, ResponseTemplate};
use crate::template::{TemplateContext, TemplateRenderer};

pub const OFFLINE_INFO: &str =
    "If you believe this is an issue with offstack itself, please report it with the request that triggered it.";

pub const BODY_NOT_STRINGIFIED: &str = "According to the API Gateway specs, the body content must be stringified. \
     Check your Lambda response and make sure you are invoking JSON.stringify(YOUR_CONTENT) on your body object";

static STATUS_IN_MESSAGE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[(\d{3})]").expect("static regex"));

fn build(status: StatusCode, headers: HeaderMap, body: impl Into<Body>) -> Response {
    let mut response = Response::new(body.into());
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

fn set_header(headers: &mut HeaderMap, name: &str, value: &str, append: bool) {
    let (Ok(name), Ok(value)) = (HeaderName::try_from(name), HeaderValue::try_from(value)) else {
        warn!(header = %name, "Skipping invalid response header");
        return;
    };
    if append {
        headers.append(name, value);
    } else {
        headers.insert(name, value);
    }
}

fn ensure_json_content_type(headers: &mut HeaderMap, content_type: &str) {
    if !headers.contains_key(header::CONTENT_TYPE) {
        set_header(headers, header::CONTENT_TYPE.as_str(), content_type, false);
    }
}

/// `{errorMessage, errorType, offlineInfo, stackTrace}` reply
pub fn error_reply(status: StatusCode, message: &str, error_type: &str, stack: &[String], hide_stack_traces: bool) -> Response {
    let body = error_reply_body(message, error_type, OFFLINE_INFO, (!hide_stack_traces).then_some(stack));
    let mut headers = HeaderMap::new();
    ensure_json_content_type(&mut headers, "application/json");
    build(status, headers, body.to_string())
}

/// Failure of the execution machinery: always 502
pub fn transport_error(endpoint: &Endpoint, error: &InvocationError, hide_stack_traces: bool) -> Response {
    error!(function = %endpoint.function, error = %error, "Function could not be invoked");
    error_reply(
        StatusCode::BAD_GATEWAY,
        &error.to_string(),
        error.error_type(),
        error.stack_trace(),
        hide_stack_traces,
    )
}

/// Status code embedded as `[NNN]` in an error message
pub fn status_in_message(message: &str) -> Option<u16> {
    STATUS_IN_MESSAGE
        .captures(message)
        .and_then(|captures| captures[1].parse().ok())
}

/// Status of a failed invocation: bracketed code, then the selected
/// response's status, then 502
fn error_status(message: &str, selected: Option<&IntegrationResponse>) -> StatusCode {
    status_in_message(message)
        .or_else(|| selected.and_then(|response| response.status_code))
        .and_then(|code| StatusCode::from_u16(code).ok())
        .unwrap_or(StatusCode::BAD_GATEWAY)
}

fn error_object(error: &InvocationError, hide_stack_traces: bool) -> Value {
    let mut object = json!({
        "errorMessage": error.to_string(),
        "errorType": error.error_type(),
    });
    if !hide_stack_traces {
        object["stackTrace"] = json!(error.stack_trace());
    }
    object
}

/// `method.response.header.X` <- `'literal'` or `integration.response.body[.path]`
fn apply_parameters(headers: &mut HeaderMap, parameters: &[(String, String)], result: &Value) {
    for (key, value) in parameters {
        let Some(name) = key.strip_prefix("method.response.header.").filter(|name| !name.is_empty()) else {
            warn!(parameter = %key, "Only method.response.header.NAME response parameters are supported, skipping");
            continue;
        };

        let header_value = if let Some(source) = value.strip_prefix("integration.response.") {
            let Some(path) = source.strip_prefix("body") else {
                warn!(parameter = %key, value = %value, "Only integration.response.body[.path] sources are supported, skipping");
                continue;
            };
            let selected = match path.strip_prefix('.') {
                Some(path) => json_path::resolve(result, path),
                None => Some(result),
            };
            match selected {
                None | Some(Value::Null) => String::new(),
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
            }
        } else {
            value
                .strip_prefix('\'')
                .and_then(|v| v.strip_suffix('\''))
                .unwrap_or(value)
                .to_string()
        };

        if header_value.is_empty() {
            warn!(parameter = %key, "Empty value for response parameter, it won't be set");
            continue;
        }
        debug!(header = %name, value = %header_value, "Response parameter");
        set_header(headers, name, &header_value, false);
    }
}

/// Response of a template-mapped integration
pub fn integration_response(
    endpoint: &Endpoint,
    outcome: Result<Value, InvocationError>,
    renderer: &dyn TemplateRenderer,
    mut context: TemplateContext,
    hide_stack_traces: bool,
) -> Response {
    let (mut result, status, chosen) = match outcome {
        Ok(result) => {
            let chosen = endpoint.default_response();
            let status = chosen
                .and_then(|response| response.status_code)
                .and_then(|code| StatusCode::from_u16(code).ok())
                .unwrap_or(StatusCode::OK);
            (result, status, chosen)
        }
        Err(error) => {
            let message = error.to_string();
            error!(function = %endpoint.function, error = %message, "Handler failed");
            let selected = endpoint.select_response(&message);
            let status = error_status(&message, selected);
            (error_object(&error, hide_stack_traces), status, selected.or_else(|| endpoint.default_response()))
        }
    };
    debug!(response = chosen.map_or("default", |r| r.name.as_str()), "Using integration response");

    let mut headers = HeaderMap::new();
    for (name, value) in &endpoint.response_headers {
        set_header(&mut headers, name, value, false);
    }
    if let Some(chosen) = chosen {
        apply_parameters(&mut headers, &chosen.parameters, &result);

        if let Some(ResponseTemplate::Custom(template)) = chosen.templates.get(&endpoint.response_content_type.to_lowercase()) {
            if template.trim().is_empty() {
                debug!("Blank response template, passing the result through");
            } else {
                context.payload = result.clone();
                match renderer.render(template, &context) {
                    Ok(rendered) => result = rendered,
                    Err(e) => error!(function = %endpoint.function, error = %e, "Error while rendering response template"),
                }
            }
        }
    }
    ensure_json_content_type(&mut headers, &endpoint.response_content_type);

    if endpoint.content_handling == Some(ContentHandling::ConvertToBinary) {
        let encoded = match &result {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        return match general_purpose::STANDARD.decode(encoded.trim()) {
            Ok(bytes) => build(status, headers, bytes),
            Err(e) => {
                warn!(function = %endpoint.function, error = %e, "Result is not base64, sending it as is");
                build(status, headers, encoded)
            }
        };
    }

    let body = match result {
        Value::Null => String::new(),
        other => other.to_string(),
    };
    build(status, headers, body)
}

fn header_values(value: &Value) -> Vec<String> {
    match value {
        Value::Null => Vec::new(),
        Value::String(s) => vec![s.clone()],
        Value::Array(items) => items.iter().flat_map(header_values).collect(),
        other => vec![other.to_string()],
    }
}

/// Wrap a v2 result that is not shaped like a response
fn wrap_v2(result: Value) -> Value {
    let shaped = result.as_object().is_some_and(|object| object.contains_key("statusCode"));
    if shaped {
        return result;
    }
    json!({
        "statusCode": 200,
        "headers": {"Content-Type": "application/json"},
        "body": result.to_string(),
        "isBase64Encoded": false,
    })
}

fn result_status(result: &Value) -> StatusCode {
    let code = match result.get("statusCode") {
        Some(Value::Number(n)) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
        Some(Value::String(s)) => s.parse().ok(),
        _ => None,
    };
    code.and_then(|code| StatusCode::from_u16(code).ok())
        .unwrap_or(StatusCode::OK)
}

/// Response of a proxy integration
pub fn proxy_response(endpoint: &Endpoint, outcome: Result<Value, InvocationError>, hide_stack_traces: bool) -> Response {
    let result = match outcome {
        Ok(result) => result,
        Err(error) => {
            let message = error.to_string();
            error!(function = %endpoint.function, error = %message, "Handler failed");
            let status = error_status(&message, endpoint.select_response(&message));
            return error_reply(status, &message, error.error_type(), error.stack_trace(), hide_stack_traces);
        }
    };

    let result = if endpoint.payload == PayloadVersion::V2 {
        wrap_v2(result)
    } else {
        result
    };

    if result.is_null() {
        return error_reply(
            StatusCode::BAD_GATEWAY,
            "Function returned no response",
            "Error",
            &[],
            hide_stack_traces,
        );
    }

    // A result carrying `errorType` is a failure reported as a value
    let status = if result.get("errorType").is_some() {
        warn!(function = %endpoint.function, "Proxy result carries errorType");
        StatusCode::BAD_GATEWAY
    } else {
        result_status(&result)
    };
    let mut headers = HeaderMap::new();

    let declared = [result.get("headers"), result.get("multiValueHeaders")];
    for (name, value) in declared.into_iter().flatten().filter_map(Value::as_object).flatten() {
        for value in header_values(value) {
            set_header(&mut headers, name, &value, true);
        }
    }
    if endpoint.payload == PayloadVersion::V2 {
        for cookie in result.get("cookies").map(header_values).unwrap_or_default() {
            set_header(&mut headers, header::SET_COOKIE.as_str(), &cookie, true);
        }
    }
    ensure_json_content_type(&mut headers, "application/json");

    if let Value::String(text) = &result {
        return build(status, headers, Value::String(text.clone()).to_string());
    }

    match result.get("body") {
        None | Some(Value::Null) => build(status, headers, Body::empty()),
        Some(Value::String(body)) if result.get("isBase64Encoded") == Some(&Value::Bool(true)) => {
            match general_purpose::STANDARD.decode(body.trim()) {
                Ok(bytes) => build(status, headers, bytes),
                Err(e) => error_reply(
                    StatusCode::BAD_GATEWAY,
                    &format!("Body is flagged as base64 but could not be decoded: {e}"),
                    "Error",
                    &[],
                    hide_stack_traces,
                ),
            }
        }
        Some(Value::String(body)) => build(status, headers, body.clone()),
        Some(_) => {
            warn!(function = %endpoint.function, "Proxy result body is not a string");
            error_reply(StatusCode::BAD_GATEWAY, BODY_NOT_STRINGIFIED, "Error", &[], hide_stack_traces)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{EndpointDescriptor, GatewayOptions};
    use crate::template::SubstitutionRenderer;
    use http_body_util::BodyExt;
    use offstack_lambda::HandlerError;

    fn endpoint(value: Value) -> Endpoint {
        let descriptor: EndpointDescriptor = serde_json::from_value(value).unwrap();
        Endpoint::resolve(&descriptor, &GatewayOptions::default()).unwrap()
    }

    async fn body_of(response: Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn template_endpoint() -> Endpoint {
        endpoint(json!({
            "function": "f",
            "method": "get",
            "path": "/x",
            "integration": "lambda",
            "response": {"headers": {"X-Literal": "'yes'"}},
            "responses": {
                "default": {
                    "status_code": 200,
                    "parameters": {
                        "method.response.header.Location": "integration.response.body.redirect.url",
                        "method.response.header.X-Static": "'fixed'"
                    }
                },
                "notFound": {
                    "selection_pattern": "Not found.*",
                    "status_code": 404,
                    "templates": {"application/json": "{\"missing\": \"$input.path('$.errorMessage')\"}"}
                }
            }
        }))
    }

    #[tokio::test]
    async fn test_integration_success_with_parameters() {
        let endpoint = template_endpoint();
        let response = integration_response(
            &endpoint,
            Ok(json!({"redirect": {"url": "https://example.com"}})),
            &SubstitutionRenderer,
            TemplateContext::default(),
            false,
        );
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["location"], "https://example.com");
        assert_eq!(response.headers()["x-static"], "fixed");
        assert_eq!(response.headers()["x-literal"], "yes");
        assert_eq!(response.headers()["content-type"], "application/json");
        assert_eq!(body_of(response).await, r#"{"redirect":{"url":"https://example.com"}}"#);
    }

    #[tokio::test]
    async fn test_integration_selection_pattern() {
        let endpoint = template_endpoint();
        let response = integration_response(
            &endpoint,
            Err(InvocationError::Handler(HandlerError::new("Error", "Not found [404]"))),
            &SubstitutionRenderer,
            TemplateContext::default(),
            false,
        );
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_of(response).await, r#"{"missing":"Not found [404]"}"#);
    }

    #[tokio::test]
    async fn test_integration_unmatched_error_is_502() {
        let endpoint = template_endpoint();
        let response = integration_response(
            &endpoint,
            Err(InvocationError::Handler(HandlerError::new("Error", "boom"))),
            &SubstitutionRenderer,
            TemplateContext::default(),
            true,
        );
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body: Value = serde_json::from_str(&body_of(response).await).unwrap();
        assert_eq!(body["errorMessage"], "boom");
        assert!(body.get("stackTrace").is_none());
    }

    #[tokio::test]
    async fn test_integration_string_is_stringified() {
        let endpoint = template_endpoint();
        let response = integration_response(&endpoint, Ok(json!("hi")), &SubstitutionRenderer, TemplateContext::default(), false);
        assert_eq!(body_of(response).await, r#""hi""#);
    }

    #[tokio::test]
    async fn test_integration_convert_to_binary() {
        let endpoint = endpoint(json!({
            "function": "f", "method": "get", "path": "/img", "integration": "lambda",
            "content_handling": "CONVERT_TO_BINARY"
        }));
        let response = integration_response(&endpoint, Ok(json!("aGVsbG8=")), &SubstitutionRenderer, TemplateContext::default(), false);
        assert_eq!(body_of(response).await, "hello");
    }

    #[tokio::test]
    async fn test_v2_bare_string_is_wrapped() {
        let endpoint = endpoint(json!({"function": "f", "http_api": true, "route_key": "GET /ok"}));
        let response = proxy_response(&endpoint, Ok(json!("ok")), false);
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-type"], "application/json");
        assert_eq!(body_of(response).await, r#""ok""#);
    }

    #[test]
    fn test_wrap_v2_shape() {
        assert_eq!(
            wrap_v2(json!("ok")),
            json!({
                "statusCode": 200,
                "headers": {"Content-Type": "application/json"},
                "body": "\"ok\"",
                "isBase64Encoded": false
            })
        );
        let shaped = json!({"statusCode": 201, "body": "x"});
        assert_eq!(wrap_v2(shaped.clone()), shaped);
    }

    #[tokio::test]
    async fn test_proxy_headers_and_cookies() {
        let endpoint = endpoint(json!({"function": "f", "http_api": true, "route_key": "GET /c"}));
        let response = proxy_response(
            &endpoint,
            Ok(json!({
                "statusCode": 201,
                "headers": {"content-type": "text/plain", "x-one": "1"},
                "multiValueHeaders": {"set-cookie": ["a=1", "b=2"], "x-one": ["2"]},
                "cookies": ["c=3"],
                "body": "created"
            })),
            false,
        );
        assert_eq!(response.status(), StatusCode::CREATED);
        let cookies: Vec<_> = response.headers().get_all("set-cookie").iter().collect();
        assert_eq!(cookies.len(), 3);
        let ones: Vec<_> = response.headers().get_all("x-one").iter().collect();
        assert_eq!(ones.len(), 2);
        assert_eq!(response.headers()["content-type"], "text/plain");
        assert_eq!(body_of(response).await, "created");
    }

    #[tokio::test]
    async fn test_proxy_base64_body() {
        let endpoint = endpoint(json!({"function": "f", "method": "get", "path": "/b"}));
        let response = proxy_response(
            &endpoint,
            Ok(json!({"statusCode": 200, "body": "aGVsbG8=", "isBase64Encoded": true})),
            false,
        );
        assert_eq!(body_of(response).await, "hello");
    }

    #[tokio::test]
    async fn test_proxy_unstringified_body_is_502() {
        let endpoint = endpoint(json!({"function": "f", "method": "get", "path": "/b"}));
        let response = proxy_response(&endpoint, Ok(json!({"statusCode": 200, "body": {"a": 1}})), false);
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body: Value = serde_json::from_str(&body_of(response).await).unwrap();
        assert_eq!(body["errorMessage"], BODY_NOT_STRINGIFIED);
    }

    #[tokio::test]
    async fn test_proxy_error_status_from_message() {
        let endpoint = endpoint(json!({"function": "f", "method": "get", "path": "/b"}));
        let response = proxy_response(
            &endpoint,
            Err(InvocationError::Handler(HandlerError::new("Error", "Conflict [409]"))),
            false,
        );
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let timeout = proxy_response(&endpoint, Err(InvocationError::Timeout(std::time::Duration::from_secs(6))), false);
        assert_eq!(timeout.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[tokio::test]
    async fn test_proxy_error_type_result_is_502() {
        let endpoint = endpoint(json!({"function": "f", "method": "get", "path": "/b"}));
        let response = proxy_response(
            &endpoint,
            Ok(json!({"statusCode": 200, "errorType": "TypeError", "body": "oops"})),
            false,
        );
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(body_of(response).await, "oops");

        let bare = proxy_response(&endpoint, Ok(json!({"errorType": "Error", "errorMessage": "x"})), false);
        assert_eq!(bare.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_status_in_message() {
        assert_eq!(status_in_message("Not found [404]"), Some(404));
        assert_eq!(status_in_message("nothing here"), None);
    }
}
