//! Worker backend: native handlers on a dedicated thread per function
//!
//! Each worker owns a single-threaded tokio runtime and its own module
//! cache, so handler state is isolated from the host runtime.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::correlation::{self, CallResult, PendingCalls};
use super::in_process::{invoke_handler, resolve_handler};
use super::module_cache::{HandlerRegistry, ModuleCache};
use super::shared::{SharedUnit, SharedUnits};
use super::{Runner, RunnerKind};
use crate::config::ReloadPolicy;
use crate::context::LambdaContext;
use crate::function::FunctionDefinition;
use crate::invocation::InvocationError;

/// How long shutdown waits for a worker thread to exit
const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

struct Job {
    id: String,
    event: Value,
    context: LambdaContext,
}

/// Worker threads, shared by every instance of a function
pub struct WorkerRegistry {
    units: SharedUnits<WorkerHandle>,
    registry: HandlerRegistry,
    policy: ReloadPolicy,
}

impl WorkerRegistry {
    pub fn new(registry: HandlerRegistry, policy: ReloadPolicy) -> Self {
        Self {
            units: SharedUnits::new(),
            registry,
            policy,
        }
    }

    pub async fn shutdown_all(&self) {
        self.units.shutdown_all().await;
    }
}

struct WorkerHandle {
    function: String,
    jobs: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    pending: Arc<PendingCalls>,
    alive: Arc<AtomicBool>,
}

impl WorkerHandle {
    fn start(
        function: Arc<FunctionDefinition>,
        code_dir: PathBuf,
        env: Arc<HashMap<String, String>>,
        registry: HandlerRegistry,
        policy: ReloadPolicy,
    ) -> Result<Self, InvocationError> {
        let (job_tx, mut job_rx) = mpsc::unbounded_channel::<Job>();
        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<(String, CallResult)>();
        let name = function.key.clone();

        let thread = std::thread::Builder::new()
            .name(format!("offstack-worker-{name}"))
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        error!(function = %function.key, error = %e, "Failed to build worker runtime");
                        return;
                    }
                };
                runtime.block_on(async move {
                    let modules = ModuleCache::new(registry, policy);
                    while let Some(job) = job_rx.recv().await {
                        let handler = resolve_handler(&function, &code_dir, &modules);
                        let replies = reply_tx.clone();
                        let env = env.clone();
                        tokio::spawn(async move {
                            let result = match handler {
                                Ok(handler) => invoke_handler(handler, job.event, job.context, env)
                                    .await
                                    .map_err(InvocationError::from),
                                Err(e) => Err(e),
                            };
                            let _ = replies.send((job.id, result));
                        });
                    }
                });
            })
            .map_err(|e| InvocationError::transport(format!("Failed to start worker for {name}: {e}")))?;

        let pending = Arc::new(PendingCalls::default());
        let alive = Arc::new(AtomicBool::new(true));
        {
            let pending = pending.clone();
            let alive = alive.clone();
            let name = name.clone();
            tokio::spawn(async move {
                while let Some((id, result)) = reply_rx.recv().await {
                    pending.resolve(&id, result);
                }
                alive.store(false, Ordering::SeqCst);
                let failed = pending.fail_all(&InvocationError::transport("Worker stopped"));
                debug!(function = %name, failed, "Worker reply channel closed");
            });
        }

        info!(function = %name, "Started worker");
        Ok(Self {
            function: name,
            jobs: Mutex::new(Some(job_tx)),
            thread: Mutex::new(Some(thread)),
            pending,
            alive,
        })
    }

    async fn call(&self, event: Value, context: LambdaContext) -> CallResult {
        let id = uuid::Uuid::new_v4().to_string();
        let (_guard, rx) = self.pending.register(&id);
        let sent = self
            .jobs
            .lock()
            .as_ref()
            .map(|jobs| jobs.send(Job { id, event, context }).is_ok())
            .unwrap_or(false);
        if !sent {
            self.alive.store(false, Ordering::SeqCst);
            return Err(InvocationError::transport(format!(
                "Worker for {} is not running",
                self.function
            )));
        }
        correlation::wait(rx).await
    }
}

#[async_trait]
impl SharedUnit for WorkerHandle {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn shutdown(&self) {
        // Closing the job channel ends the worker loop; dropping its runtime
        // cancels handlers still in flight
        self.jobs.lock().take();
        self.alive.store(false, Ordering::SeqCst);

        let thread = self.thread.lock().take();
        if let Some(thread) = thread {
            let joined = tokio::time::timeout(JOIN_TIMEOUT, tokio::task::spawn_blocking(move || thread.join())).await;
            match joined {
                Ok(Ok(Ok(()))) => {}
                Ok(_) => warn!(function = %self.function, "Worker thread panicked"),
                Err(_) => warn!(function = %self.function, timeout = ?JOIN_TIMEOUT, "Worker thread did not stop in time"),
            }
        }
        info!(function = %self.function, "Stopped worker");
    }
}

pub struct WorkerRunner {
    function: Arc<FunctionDefinition>,
    code_dir: PathBuf,
    env: Arc<HashMap<String, String>>,
    workers: Arc<WorkerRegistry>,
    unit_key: String,
    released: AtomicBool,
}

impl WorkerRunner {
    pub fn new(
        function: Arc<FunctionDefinition>,
        code_dir: PathBuf,
        env: Arc<HashMap<String, String>>,
        workers: Arc<WorkerRegistry>,
    ) -> Self {
        let unit_key = format!("{}:{}", function.key, code_dir.display());
        workers.units.acquire(&unit_key);
        Self {
            function,
            code_dir,
            env,
            workers,
            unit_key,
            released: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Runner for WorkerRunner {
    async fn run(&self, event: Value, context: LambdaContext) -> Result<Value, InvocationError> {
        let worker = self
            .workers
            .units
            .get_or_start(&self.unit_key, || async {
                WorkerHandle::start(
                    self.function.clone(),
                    self.code_dir.clone(),
                    self.env.clone(),
                    self.workers.registry.clone(),
                    self.workers.policy,
                )
            })
            .await?;
        worker.call(event, context).await
    }

    async fn cleanup(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.workers.units.release(&self.unit_key).await;
        }
    }

    fn kind(&self) -> RunnerKind {
        RunnerKind::Worker
    }
}
