//! Per-invocation context

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::function::FunctionDefinition;

/// Lambda context passed to the function.
///
/// Only serializable members live here; completion methods are attached by
/// the in-process backend (see [`crate::completion::HandlerContext`]).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LambdaContext {
    pub aws_request_id: String,
    pub callback_waits_for_empty_event_loop: bool,
    pub client_context: Option<Value>,
    pub function_name: String,
    pub function_version: String,
    pub identity: Option<Value>,
    pub invoked_function_arn: String,
    pub log_group_name: String,
    pub log_stream_name: String,
    #[serde(rename = "memoryLimitInMB")]
    pub memory_limit_in_mb: String,
    /// Unix epoch milliseconds after which the invocation times out
    pub deadline_ms: i64,
}

impl LambdaContext {
    pub fn new(function: &FunctionDefinition, request_id: &str, deadline_ms: i64) -> Self {
        let name = function.name();
        Self {
            aws_request_id: request_id.to_string(),
            callback_waits_for_empty_event_loop: true,
            client_context: None,
            function_name: name.to_string(),
            function_version: "$LATEST".to_string(),
            identity: None,
            invoked_function_arn: format!("offline_invokedFunctionArn_for_{name}"),
            log_group_name: format!("offline_logGroupName_for_{name}"),
            log_stream_name: format!("offline_logStreamName_for_{name}"),
            memory_limit_in_mb: function.memory_size.to_string(),
            deadline_ms,
        }
    }

    /// Context for an invocation starting now
    pub fn starting_now(function: &FunctionDefinition, request_id: &str) -> Self {
        let timeout_ms = i64::try_from(function.timeout().as_millis()).unwrap_or(i64::MAX);
        let deadline_ms = chrono::Utc::now().timestamp_millis().saturating_add(timeout_ms);
        Self::new(function, request_id, deadline_ms)
    }

    pub fn with_client_context(mut self, client_context: Option<Value>) -> Self {
        self.client_context = client_context;
        self
    }

    /// Get remaining time in milliseconds
    pub fn get_remaining_time_in_millis(&self) -> i64 {
        let now = chrono::Utc::now().timestamp_millis();
        (self.deadline_ms - now).max(0)
    }
}
