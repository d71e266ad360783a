//! Gateway error codes and reply bodies

use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

/// Error codes surfaced by the emulated gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    // Authorization
    Unauthorized,
    Forbidden,
    AuthorizerConfiguration,

    // Request handling
    BadRequest,
    RouteNotFound,
    ResourceNotFound,
    Gone,

    // Integration
    BadGateway,
    GatewayTimeout,
    ServiceException,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unauthorized => "UnauthorizedException",
            Self::Forbidden => "ForbiddenException",
            Self::AuthorizerConfiguration => "AuthorizerConfigurationException",
            Self::BadRequest => "BadRequestException",
            Self::RouteNotFound => "NotFoundException",
            Self::ResourceNotFound => "ResourceNotFoundException",
            Self::Gone => "GoneException",
            Self::BadGateway => "BadGatewayException",
            Self::GatewayTimeout => "GatewayTimeoutException",
            Self::ServiceException => "ServiceException",
        }
    }

    /// Short reason phrase used in the `error` field of gateway replies
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Unauthorized => "Unauthorized",
            Self::Forbidden => "Forbidden",
            Self::AuthorizerConfiguration => "AuthorizerConfigurationException",
            Self::BadRequest => "Bad Request",
            Self::RouteNotFound | Self::ResourceNotFound => "Not Found",
            Self::Gone => "Gone",
            Self::BadGateway => "Bad Gateway",
            Self::GatewayTimeout => "Gateway Timeout",
            Self::ServiceException => "Internal Server Error",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            Self::Unauthorized => 401,
            Self::Forbidden => 403,
            Self::AuthorizerConfiguration | Self::ServiceException => 500,
            Self::BadRequest => 400,
            Self::RouteNotFound | Self::ResourceNotFound => 404,
            Self::Gone => 410,
            Self::BadGateway => 502,
            Self::GatewayTimeout => 504,
        }
    }
}

/// Gateway-generated error, rendered before or instead of a function response
#[derive(Debug, Error)]
#[error("{}: {message}", code.as_str())]
pub struct GatewayError {
    pub code: ErrorCode,
    pub message: String,
    pub request_id: String,
}

impl GatewayError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            request_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn unauthorized() -> Self {
        Self::new(ErrorCode::Unauthorized, "Unauthorized")
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Forbidden, message)
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    pub fn status(&self) -> u16 {
        self.code.http_status()
    }

    /// Format as a `{statusCode, error, message}` JSON body
    pub fn to_json(&self) -> String {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct JsonError<'a> {
            status_code: u16,
            error: &'a str,
            message: &'a str,
        }

        let error = JsonError {
            status_code: self.status(),
            error: self.code.reason(),
            message: &self.message,
        };

        serde_json::to_string(&error).unwrap_or_else(|_| {
            format!(
                r#"{{"statusCode":{},"error":"{}","message":"{}"}}"#,
                self.status(),
                self.code.reason(),
                self.message
            )
        })
    }
}

/// Body returned when a function invocation fails inside the gateway.
///
/// Mirrors `{errorMessage, errorType, offlineInfo, stackTrace}`; the stack is
/// left out when stack traces are hidden.
pub fn error_reply_body(
    message: &str,
    error_type: &str,
    offline_info: &str,
    stack_trace: Option<&[String]>,
) -> Value {
    let mut body = json!({
        "errorMessage": message,
        "errorType": error_type,
        "offlineInfo": offline_info,
    });
    if let Some(stack) = stack_trace {
        body["stackTrace"] = json!(stack);
    }
    body
}

/// Split a raw stack string into trimmed, non-empty frames
pub fn parse_stack_trace(stack: &str) -> Vec<String> {
    stack
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(ToString::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_json_format() {
        let error = GatewayError::forbidden("User is not authorized to access this resource");

        let json = error.to_json();
        assert!(json.contains(r#""statusCode":403"#));
        assert!(json.contains(r#""error":"Forbidden""#));
        assert!(json.contains("not authorized"));
    }

    #[test]
    fn test_unauthorized_status() {
        let error = GatewayError::unauthorized().with_request_id("req-1");
        assert_eq!(error.status(), 401);
        assert_eq!(error.request_id, "req-1");
        assert_eq!(error.code.as_str(), "UnauthorizedException");
    }

    #[test]
    fn test_error_reply_body_hides_stack() {
        let shown = error_reply_body("boom", "Error", "info", Some(&["at a".to_string()]));
        assert_eq!(shown["stackTrace"][0], "at a");

        let hidden = error_reply_body("boom", "Error", "info", None);
        assert!(hidden.get("stackTrace").is_none());
        assert_eq!(hidden["errorMessage"], "boom");
    }

    #[test]
    fn test_parse_stack_trace() {
        let frames = parse_stack_trace("Error: boom\n    at handler (a.js:1:1)\n\n");
        assert_eq!(frames, vec!["Error: boom", "at handler (a.js:1:1)"]);
    }
}
