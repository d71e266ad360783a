//! Correlated request/reply bookkeeping for multiplexed backends

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;

use crate::context::LambdaContext;
use crate::invocation::{HandlerError, InvocationError};

pub(crate) type CallResult = Result<Value, InvocationError>;

/// In-flight calls of one shared process or worker, keyed by call id
#[derive(Default)]
pub(crate) struct PendingCalls {
    calls: Mutex<HashMap<String, oneshot::Sender<CallResult>>>,
}

impl PendingCalls {
    /// Register a call. Dropping the guard forgets it, so abandoned calls
    /// (timeouts) do not leak entries.
    pub(crate) fn register(self: &Arc<Self>, id: &str) -> (PendingGuard, oneshot::Receiver<CallResult>) {
        let (tx, rx) = oneshot::channel();
        self.calls.lock().insert(id.to_string(), tx);
        let guard = PendingGuard {
            calls: self.clone(),
            id: id.to_string(),
        };
        (guard, rx)
    }

    pub(crate) fn resolve(&self, id: &str, result: CallResult) -> bool {
        match self.calls.lock().remove(id) {
            Some(tx) => tx.send(result).is_ok(),
            None => false,
        }
    }

    /// Fail every in-flight call with the same error
    pub(crate) fn fail_all(&self, error: &InvocationError) -> usize {
        let calls: Vec<_> = self.calls.lock().drain().collect();
        let count = calls.len();
        for (_, tx) in calls {
            let _ = tx.send(Err(error.clone()));
        }
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.calls.lock().len()
    }
}

pub(crate) struct PendingGuard {
    calls: Arc<PendingCalls>,
    id: String,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.calls.calls.lock().remove(&self.id);
    }
}

/// Wait for the reply of a registered call
pub(crate) async fn wait(rx: oneshot::Receiver<CallResult>) -> CallResult {
    rx.await
        .unwrap_or_else(|_| Err(InvocationError::transport("Backend dropped the invocation")))
}

/// Host to backend message
#[derive(Debug, Serialize)]
pub(crate) struct CallRequest<'a> {
    pub id: &'a str,
    pub event: &'a Value,
    pub context: &'a LambdaContext,
}

/// Backend to host message. Without an `id` it is a fatal error of the
/// whole backend.
#[derive(Debug, Deserialize)]
pub(crate) struct CallReply {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub error: Option<Value>,
}

impl CallReply {
    pub(crate) fn into_result(self) -> (Option<String>, CallResult) {
        let result = match self.error {
            Some(error) => Err(InvocationError::Handler(HandlerError::from_value(&error))),
            None => Ok(self.result),
        };
        (self.id, result)
    }
}
