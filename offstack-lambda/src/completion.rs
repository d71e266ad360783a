//! Single-resolution completion for in-process handlers
//!
//! A handler may finish through its callback, through `succeed`/`fail`/`done`
//! on the context, or by returning a future. All of them feed the same
//! [`Completion`]: the first writer wins and later writers are ignored.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::warn;

use crate::context::LambdaContext;
use crate::invocation::HandlerError;

pub type Outcome = Result<Value, HandlerError>;

/// Write-once slot shared by every completion style of one invocation
#[derive(Clone)]
pub struct Completion {
    sender: Arc<Mutex<Option<oneshot::Sender<Outcome>>>>,
    request_id: Arc<str>,
}

impl Completion {
    pub fn channel(request_id: &str) -> (Self, oneshot::Receiver<Outcome>) {
        let (tx, rx) = oneshot::channel();
        let completion = Self {
            sender: Arc::new(Mutex::new(Some(tx))),
            request_id: Arc::from(request_id),
        };
        (completion, rx)
    }

    /// Resolve the invocation. Returns `false` (and logs) if it was already
    /// resolved.
    pub fn complete(&self, outcome: Outcome, style: &'static str) -> bool {
        let sender = self.sender.lock().take();
        match sender {
            Some(tx) => {
                // The receiver is gone when the caller timed out
                let _ = tx.send(outcome);
                true
            }
            None => {
                warn!(
                    request_id = %self.request_id,
                    style,
                    "Ignoring completion of an already resolved invocation"
                );
                false
            }
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.sender.lock().is_none()
    }
}

/// Legacy error-first callback handed to handlers
#[derive(Clone)]
pub struct Callback {
    completion: Completion,
}

impl Callback {
    pub fn call(&self, error: Option<HandlerError>, value: Option<Value>) {
        self.completion.complete(settle(error, value), "callback");
    }
}

/// `callback(err)` with the literal `"Unauthorized"` resolves to that string
/// so authorizers can reject without failing the invocation
pub(crate) fn settle(error: Option<HandlerError>, value: Option<Value>) -> Outcome {
    match error {
        Some(error) if error.error_message == "Unauthorized" => {
            Ok(Value::String("Unauthorized".to_string()))
        }
        Some(error) => Err(error),
        None => Ok(value.unwrap_or(Value::Null)),
    }
}

/// Context handed to in-process handlers
#[derive(Clone)]
pub struct HandlerContext {
    context: Arc<LambdaContext>,
    env: Arc<HashMap<String, String>>,
    completion: Completion,
}

impl HandlerContext {
    pub fn new(
        context: LambdaContext,
        env: Arc<HashMap<String, String>>,
        completion: Completion,
    ) -> Self {
        Self {
            context: Arc::new(context),
            env,
            completion,
        }
    }

    pub fn lambda_context(&self) -> &LambdaContext {
        &self.context
    }

    pub fn aws_request_id(&self) -> &str {
        &self.context.aws_request_id
    }

    pub fn function_name(&self) -> &str {
        &self.context.function_name
    }

    pub fn get_remaining_time_in_millis(&self) -> i64 {
        self.context.get_remaining_time_in_millis()
    }

    /// Environment variable as the function sees it
    pub fn env(&self, key: &str) -> Option<&str> {
        self.env.get(key).map(String::as_str)
    }

    pub fn succeed(&self, value: impl Into<Value>) {
        self.completion.complete(Ok(value.into()), "succeed");
    }

    pub fn fail(&self, error: impl Into<HandlerError>) {
        self.completion.complete(settle(Some(error.into()), None), "fail");
    }

    pub fn done(&self, error: Option<HandlerError>, value: Option<Value>) {
        self.completion.complete(settle(error, value), "done");
    }

    pub fn callback(&self) -> Callback {
        Callback {
            completion: self.completion.clone(),
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.completion.is_resolved()
    }

    pub(crate) fn completion(&self) -> &Completion {
        &self.completion
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::{FunctionDefinition, Runtime};
    use serde_json::json;

    fn context() -> (HandlerContext, oneshot::Receiver<Outcome>) {
        let def = FunctionDefinition::new("fn", "h.handler", Runtime::ProvidedAl2);
        let (completion, rx) = Completion::channel("req-1");
        let ctx = HandlerContext::new(
            LambdaContext::starting_now(&def, "req-1"),
            Arc::new(HashMap::new()),
            completion,
        );
        (ctx, rx)
    }

    #[tokio::test]
    async fn test_first_completion_wins() {
        let (ctx, rx) = context();
        ctx.succeed("A");
        ctx.done(None, Some(json!("B")));
        ctx.fail("C");

        assert_eq!(rx.await.unwrap(), Ok(json!("A")));
        assert!(ctx.is_resolved());
    }

    #[tokio::test]
    async fn test_callback_styles_agree() {
        let (callback_ctx, callback_rx) = context();
        callback_ctx.callback().call(None, Some(json!("foo")));

        let (succeed_ctx, succeed_rx) = context();
        succeed_ctx.succeed("foo");

        let (done_ctx, done_rx) = context();
        done_ctx.done(None, Some(json!("foo")));

        for rx in [callback_rx, succeed_rx, done_rx] {
            assert_eq!(rx.await.unwrap(), Ok(json!("foo")));
        }
    }

    #[tokio::test]
    async fn test_unauthorized_resolves_as_value() {
        let (ctx, rx) = context();
        ctx.fail("Unauthorized");
        assert_eq!(rx.await.unwrap(), Ok(json!("Unauthorized")));
    }

    #[tokio::test]
    async fn test_callback_error() {
        let (ctx, rx) = context();
        ctx.callback().call(Some(HandlerError::new("Error", "boom")), None);
        let outcome = rx.await.unwrap();
        assert_eq!(outcome.unwrap_err().error_message, "boom");
    }

    #[test]
    fn test_env_lookup() {
        let def = FunctionDefinition::new("fn", "h.handler", Runtime::ProvidedAl2);
        let (completion, _rx) = Completion::channel("req-1");
        let env = Arc::new(HashMap::from([("TABLE".to_string(), "users".to_string())]));
        let ctx = HandlerContext::new(LambdaContext::starting_now(&def, "req-1"), env, completion);
        assert_eq!(ctx.env("TABLE"), Some("users"));
        assert_eq!(ctx.env("MISSING"), None);
    }
}
