//! Invocation outcomes and errors

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;

/// Error raised by user code (thrown, rejected, or passed to a callback)
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
#[error("{error_message}")]
pub struct HandlerError {
    pub error_type: String,
    pub error_message: String,
    #[serde(default)]
    pub stack_trace: Vec<String>,
}

impl HandlerError {
    pub fn new(error_type: impl Into<String>, error_message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            error_message: error_message.into(),
            stack_trace: Vec::new(),
        }
    }

    pub fn with_stack(mut self, stack_trace: Vec<String>) -> Self {
        self.stack_trace = stack_trace;
        self
    }

    /// Interpret an error value produced by a foreign runtime
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::String(message) => Self::new("Error", message.clone()),
            Value::Object(fields) => {
                let message = fields
                    .get("errorMessage")
                    .or_else(|| fields.get("message"))
                    .and_then(Value::as_str)
                    .map_or_else(|| value.to_string(), ToString::to_string);
                let error_type = fields
                    .get("errorType")
                    .or_else(|| fields.get("name"))
                    .and_then(Value::as_str)
                    .unwrap_or("Error");
                let stack = match fields.get("stackTrace").or_else(|| fields.get("stack")) {
                    Some(Value::Array(frames)) => frames
                        .iter()
                        .filter_map(Value::as_str)
                        .map(ToString::to_string)
                        .collect(),
                    Some(Value::String(stack)) => offstack_core::error::parse_stack_trace(stack),
                    _ => Vec::new(),
                };
                Self::new(error_type, message).with_stack(stack)
            }
            other => Self::new("Error", other.to_string()),
        }
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new("Error", message)
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self::new("Error", message)
    }
}

#[derive(Debug, Clone, Error)]
pub enum InvocationError {
    #[error("Function not found: {0}")]
    FunctionNotFound(String),

    #[error("Unsupported runtime '{runtime}' for function {function}")]
    UnsupportedRuntime { function: String, runtime: String },

    #[error(transparent)]
    Handler(#[from] HandlerError),

    #[error("[504] - Lambda timeout.")]
    Timeout(Duration),

    #[error("{0}")]
    Transport(String),

    #[error("Function pool is shut down")]
    PoolClosed,
}

impl InvocationError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    /// Failures of the execution machinery rather than of user code
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::UnsupportedRuntime { .. } | Self::PoolClosed | Self::FunctionNotFound(_)
        )
    }

    pub fn error_type(&self) -> &str {
        match self {
            Self::Handler(error) => &error.error_type,
            Self::Timeout(_) => "TimeoutError",
            Self::FunctionNotFound(_) => "ResourceNotFoundException",
            _ => "Error",
        }
    }

    pub fn stack_trace(&self) -> &[String] {
        match self {
            Self::Handler(error) => &error.stack_trace,
            _ => &[],
        }
    }

    /// `{errorMessage, errorType, stackTrace}` as the platform reports it
    pub fn to_error_object(&self) -> Value {
        json!({
            "errorMessage": self.to_string(),
            "errorType": self.error_type(),
            "stackTrace": self.stack_trace(),
        })
    }
}

/// Invocation type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationType {
    /// Synchronous invocation (wait for response)
    RequestResponse,
    /// Asynchronous invocation (fire and forget)
    Event,
    /// Validation only (don't actually invoke)
    DryRun,
}

impl InvocationType {
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "RequestResponse" => Some(Self::RequestResponse),
            "Event" => Some(Self::Event),
            "DryRun" => Some(Self::DryRun),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handler_error_from_value() {
        let error = HandlerError::from_value(&json!({
            "errorMessage": "Not found [404]",
            "errorType": "NotFound",
            "stackTrace": ["at a", "at b"]
        }));
        assert_eq!(error.error_message, "Not found [404]");
        assert_eq!(error.error_type, "NotFound");
        assert_eq!(error.stack_trace.len(), 2);

        let js = HandlerError::from_value(&json!({"name": "TypeError", "message": "x", "stack": "TypeError: x\n  at y"}));
        assert_eq!(js.error_type, "TypeError");
        assert_eq!(js.stack_trace, vec!["TypeError: x", "at y"]);

        assert_eq!(HandlerError::from_value(&json!("boom")).error_message, "boom");
    }

    #[test]
    fn test_timeout_message() {
        let error = InvocationError::Timeout(Duration::from_secs(6));
        assert_eq!(error.to_string(), "[504] - Lambda timeout.");
        assert!(!error.is_transport());
        assert_eq!(error.to_error_object()["errorType"], "TimeoutError");
    }

    #[test]
    fn test_transport_classification() {
        assert!(InvocationError::transport("spawn failed").is_transport());
        assert!(InvocationError::PoolClosed.is_transport());
        assert!(!InvocationError::Handler(HandlerError::from("oops")).is_transport());
    }

    #[test]
    fn test_invocation_type_from_str() {
        assert_eq!(InvocationType::from_str("Event"), Some(InvocationType::Event));
        assert_eq!(InvocationType::from_str("bogus"), None);
    }
}
