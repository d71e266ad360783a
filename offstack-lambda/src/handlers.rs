//! Lambda invoke API
//!
//! `POST /2015-03-31/functions/:function_name/invocations`, compatible with
//! the AWS SDKs' `Invoke` call.

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Router,
};
use base64::{engine::general_purpose, Engine};
use bytes::Bytes;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{error, info};

use crate::invocation::{InvocationError, InvocationType};
use crate::service::LambdaService;

/// Shared state for Lambda handlers
pub struct LambdaState {
    pub service: Arc<LambdaService>,
}

impl LambdaState {
    pub fn new(service: Arc<LambdaService>) -> Self {
        Self { service }
    }
}

/// Router serving the invoke API
pub fn router(service: Arc<LambdaService>) -> Router {
    Router::new()
        .route(
            "/2015-03-31/functions/:function_name/invocations",
            post(invoke_function),
        )
        .with_state(Arc::new(LambdaState::new(service)))
}

fn json_response(status: StatusCode, body: &Value) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

fn user_error(status: StatusCode, error_type: &'static str, message: String) -> Response {
    let mut response = json_response(status, &json!({ "Message": message, "Type": "User" }));
    response.headers_mut().insert(
        "x-amzn-ErrorType",
        header::HeaderValue::from_static(error_type),
    );
    response
}

fn resource_not_found(function_name: &str) -> Response {
    user_error(
        StatusCode::NOT_FOUND,
        "ResourceNotFoundException",
        format!("Function not found: {function_name}"),
    )
}

/// Decode `X-Amz-Client-Context` (base64 JSON)
fn client_context(headers: &HeaderMap) -> Result<Option<Value>, String> {
    let Some(raw) = headers.get("X-Amz-Client-Context") else {
        return Ok(None);
    };
    let raw = raw.to_str().map_err(|e| e.to_string())?;
    let decoded = general_purpose::STANDARD
        .decode(raw.trim())
        .map_err(|e| format!("Client context is not base64: {e}"))?;
    serde_json::from_slice(&decoded)
        .map(Some)
        .map_err(|e| format!("Client context is not JSON: {e}"))
}

/// POST /2015-03-31/functions/{FunctionName}/invocations
pub async fn invoke_function(
    State(state): State<Arc<LambdaState>>,
    Path(function_name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    info!(function_name = %function_name, payload_size = %body.len(), "Invoke");

    let invocation_type = match headers.get("X-Amz-Invocation-Type").map(|v| v.to_str()) {
        None => InvocationType::RequestResponse,
        Some(Ok(value)) => match InvocationType::from_str(value) {
            Some(invocation_type) => invocation_type,
            None => {
                return user_error(
                    StatusCode::BAD_REQUEST,
                    "InvalidParameterValueException",
                    format!("invocationType: '{value}' not supported by offstack"),
                )
            }
        },
        Some(Err(_)) => {
            return user_error(
                StatusCode::BAD_REQUEST,
                "InvalidParameterValueException",
                "Invalid X-Amz-Invocation-Type header".to_string(),
            )
        }
    };

    let Some(function) = state.service.get_by_name(&function_name) else {
        error!(function_name = %function_name, "Attempt to invoke a function that does not exist");
        return resource_not_found(&function_name);
    };

    let client_context = match client_context(&headers) {
        Ok(client_context) => client_context,
        Err(message) => {
            return user_error(StatusCode::BAD_REQUEST, "InvalidRequestContentException", message)
        }
    };

    let event: Value = if body.is_empty() {
        json!({})
    } else {
        match serde_json::from_slice(&body) {
            Ok(event) => event,
            Err(e) => {
                return user_error(
                    StatusCode::BAD_REQUEST,
                    "InvalidRequestContentException",
                    format!("Could not parse request body into json: {e}"),
                )
            }
        }
    };

    match invocation_type {
        InvocationType::DryRun => StatusCode::NO_CONTENT.into_response(),
        InvocationType::Event => match state.service.invoke_async(&function.key, event) {
            Ok(()) => StatusCode::ACCEPTED.into_response(),
            Err(e) => {
                error!(error = %e, "Asynchronous invoke failed");
                resource_not_found(&function_name)
            }
        },
        InvocationType::RequestResponse => {
            match state.service.invoke(&function.key, event, client_context).await {
                Ok(result) => Response::builder()
                    .status(StatusCode::OK)
                    .header(header::CONTENT_TYPE, "application/json")
                    .header("X-Amz-Executed-Version", "$LATEST")
                    .body(Body::from(result.to_string()))
                    .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()),
                Err(InvocationError::FunctionNotFound(_)) => resource_not_found(&function_name),
                Err(e) => {
                    error!(function_name = %function_name, error = %e, "Unhandled Lambda error during invoke");
                    let payload = json!({
                        "errorMessage": e.to_string(),
                        "errorType": e.error_type(),
                        "trace": e.stack_trace(),
                    });
                    let mut response = json_response(StatusCode::OK, &payload);
                    let headers = response.headers_mut();
                    headers.insert("X-Amz-Function-Error", header::HeaderValue::from_static("Unhandled"));
                    headers.insert("X-Amz-Executed-Version", header::HeaderValue::from_static("$LATEST"));
                    response
                }
            }
        }
    }
}
