//! Function instances
//!
//! An instance owns one lazily created backend. Its status is a single
//! atomic so the pool can hand it out and take it back without holding a
//! lock across the invocation.

use parking_lot::Mutex;
use serde_json::Value;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::artifact::{self, CodeDir};
use crate::context::LambdaContext;
use crate::function::FunctionDefinition;
use crate::invocation::InvocationError;
use crate::runner::{self, Runner, RunnerEnv};

const IDLE: u8 = 0;
const BUSY: u8 = 1;
const RETIRED: u8 = 2;

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceStatus {
    Idle,
    Busy,
    Retired,
}

struct LoadedRunner {
    runner: Arc<dyn Runner>,
    _code_dir: CodeDir,
}

pub struct FunctionInstance {
    id: u64,
    function: Arc<FunctionDefinition>,
    env: Arc<RunnerEnv>,
    status: AtomicU8,
    created_at: Instant,
    idle_since: Mutex<Instant>,
    runner: tokio::sync::Mutex<Option<LoadedRunner>>,
}

impl FunctionInstance {
    /// New instance, already claimed by its creator
    pub(crate) fn new_busy(function: Arc<FunctionDefinition>, env: Arc<RunnerEnv>) -> Arc<Self> {
        let now = Instant::now();
        Arc::new(Self {
            id: NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed),
            function,
            env,
            status: AtomicU8::new(BUSY),
            created_at: now,
            idle_since: Mutex::new(now),
            runner: tokio::sync::Mutex::new(None),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn function(&self) -> &Arc<FunctionDefinition> {
        &self.function
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn status(&self) -> InstanceStatus {
        match self.status.load(Ordering::SeqCst) {
            IDLE => InstanceStatus::Idle,
            BUSY => InstanceStatus::Busy,
            _ => InstanceStatus::Retired,
        }
    }

    /// IDLE -> BUSY
    pub(crate) fn try_claim(&self) -> bool {
        self.status
            .compare_exchange(IDLE, BUSY, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// IDLE -> RETIRED; a retired instance is never handed out again
    pub(crate) fn try_retire(&self) -> bool {
        self.status
            .compare_exchange(IDLE, RETIRED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn retire(&self) {
        self.status.store(RETIRED, Ordering::SeqCst);
    }

    /// BUSY -> IDLE
    fn release(&self) {
        *self.idle_since.lock() = Instant::now();
        let _ = self
            .status
            .compare_exchange(BUSY, IDLE, Ordering::SeqCst, Ordering::SeqCst);
    }

    /// How long the instance has been idle, `None` unless IDLE
    pub fn idle_for(&self) -> Option<Duration> {
        (self.status() == InstanceStatus::Idle).then(|| self.idle_since.lock().elapsed())
    }

    /// Cached backend, created on first use. Checked under the slot lock so
    /// a retired instance never starts a backend `cleanup` would miss.
    async fn runner(&self) -> Result<Arc<dyn Runner>, InvocationError> {
        let mut slot = self.runner.lock().await;
        if self.status() == InstanceStatus::Retired {
            return Err(InvocationError::PoolClosed);
        }
        if let Some(loaded) = slot.as_ref() {
            return Ok(loaded.runner.clone());
        }
        let code_dir = artifact::prepare(&self.function).await?;
        let runner = runner::create(&self.function, code_dir.path(), &self.env)?;
        *slot = Some(LoadedRunner {
            runner: runner.clone(),
            _code_dir: code_dir,
        });
        Ok(runner)
    }

    /// Run one invocation, bounded by the function timeout unless disabled
    pub async fn run(&self, event: Value, client_context: Option<Value>) -> Result<Value, InvocationError> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let context = LambdaContext::starting_now(&self.function, &request_id).with_client_context(client_context);
        let runner = self.runner().await?;

        debug!(
            function = %self.function.key,
            instance = self.id,
            request_id = %request_id,
            backend = runner.kind().as_str(),
            "Invoking function"
        );

        if self.env.config.no_timeout {
            return runner.run(event, context).await;
        }

        let timeout = self.function.timeout();
        match tokio::time::timeout(timeout, runner.run(event, context)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    function = %self.function.key,
                    instance = self.id,
                    request_id = %request_id,
                    timeout = ?timeout,
                    "Function timed out"
                );
                // The abandoned call may still be running; start from a fresh backend next time
                self.cleanup().await;
                Err(InvocationError::Timeout(timeout))
            }
        }
    }

    /// Tear the backend down. Safe to call repeatedly.
    pub async fn cleanup(&self) {
        let loaded = self.runner.lock().await.take();
        if let Some(loaded) = loaded {
            loaded.runner.cleanup().await;
            debug!(function = %self.function.key, instance = self.id, "Cleaned up instance");
        }
    }
}

/// Exclusive use of a BUSY instance; dropping it makes the instance IDLE
pub struct InstanceLease {
    instance: Arc<FunctionInstance>,
}

impl InstanceLease {
    pub(crate) fn new(instance: Arc<FunctionInstance>) -> Self {
        Self { instance }
    }

    pub fn instance(&self) -> &Arc<FunctionInstance> {
        &self.instance
    }
}

impl Deref for InstanceLease {
    type Target = FunctionInstance;

    fn deref(&self) -> &Self::Target {
        &self.instance
    }
}

impl Drop for InstanceLease {
    fn drop(&mut self) {
        self.instance.release();
    }
}
