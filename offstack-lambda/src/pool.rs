//! Function pool
//!
//! Keeps warm instances per function key. `get` is the only place that
//! hands instances out and it does so under the pool lock, so two callers
//! can never claim the same IDLE instance. A background reaper retires
//! instances that stayed idle past the configured threshold.

use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::config::LambdaConfig;
use crate::function::FunctionDefinition;
use crate::instance::{FunctionInstance, InstanceLease};
use crate::invocation::InvocationError;
use crate::runner::module_cache::HandlerRegistry;
use crate::runner::{self, RunnerEnv};

pub struct FunctionPool {
    env: Arc<RunnerEnv>,
    instances: Mutex<HashMap<String, Vec<Arc<FunctionInstance>>>>,
    /// Flushed instances that were BUSY at the time; cleaned once released
    retiring: Mutex<Vec<Arc<FunctionInstance>>>,
    closed: AtomicBool,
    reaper: Mutex<Option<JoinHandle<()>>>,
    shutdown: OnceCell<()>,
}

impl FunctionPool {
    /// Create the pool and start its reaper. Must be called inside a tokio runtime.
    pub fn new(config: LambdaConfig, registry: HandlerRegistry) -> Arc<Self> {
        let pool = Arc::new(Self {
            env: Arc::new(RunnerEnv::new(config, registry)),
            instances: Mutex::new(HashMap::new()),
            retiring: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            reaper: Mutex::new(None),
            shutdown: OnceCell::new(),
        });
        *pool.reaper.lock() = Some(Self::spawn_reaper(&pool));
        pool
    }

    fn spawn_reaper(pool: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(pool);
        let period = pool.env.config.reap_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(pool) = weak.upgrade() else {
                    break;
                };
                pool.reap().await;
            }
        })
    }

    pub fn config(&self) -> &LambdaConfig {
        &self.env.config
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.env.registry
    }

    /// Claim an IDLE instance of `function` or create a new one
    pub fn get(&self, function: &Arc<FunctionDefinition>) -> Result<InstanceLease, InvocationError> {
        runner::select(function, &self.env.config)?;

        let mut instances = self.instances.lock();
        // Checked under the lock so nothing is added after shutdown drained the pool
        if self.closed.load(Ordering::SeqCst) {
            return Err(InvocationError::PoolClosed);
        }
        let set = instances.entry(function.key.clone()).or_default();
        if let Some(instance) = set.iter().find(|instance| instance.try_claim()) {
            debug!(function = %function.key, instance = instance.id(), "Reusing warm instance");
            return Ok(InstanceLease::new(instance.clone()));
        }

        let instance = FunctionInstance::new_busy(function.clone(), self.env.clone());
        debug!(function = %function.key, instance = instance.id(), "Created instance");
        set.push(instance.clone());
        Ok(InstanceLease::new(instance))
    }

    /// Retire instances idle past the threshold and finish flushed ones
    pub async fn reap(&self) -> usize {
        let threshold = self.env.config.idle_timeout();
        let mut expired = Vec::new();
        {
            let mut instances = self.instances.lock();
            for set in instances.values_mut() {
                set.retain(|instance| {
                    let stale = instance.idle_for().is_some_and(|idle| idle >= threshold);
                    if stale && instance.try_retire() {
                        expired.push(instance.clone());
                        false
                    } else {
                        true
                    }
                });
            }
            instances.retain(|_, set| !set.is_empty());
        }
        {
            let mut retiring = self.retiring.lock();
            retiring.retain(|instance| {
                if instance.try_retire() {
                    expired.push(instance.clone());
                    false
                } else {
                    true
                }
            });
        }

        let count = expired.len();
        if count > 0 {
            join_all(expired.iter().map(|instance| instance.cleanup())).await;
            debug!(count, "Reaped idle instances");
        }
        count
    }

    /// Drop every instance: IDLE ones now, BUSY ones once they are released
    pub async fn flush(&self) {
        let all: Vec<_> = self.instances.lock().drain().flat_map(|(_, set)| set).collect();
        let mut idle = Vec::new();
        {
            let mut retiring = self.retiring.lock();
            for instance in all {
                if instance.try_retire() {
                    idle.push(instance);
                } else {
                    retiring.push(instance);
                }
            }
        }
        join_all(idle.iter().map(|instance| instance.cleanup())).await;
        info!(cleaned = idle.len(), "Flushed function pool");
    }

    /// Shut the pool down, cleaning every instance including BUSY ones.
    /// Concurrent and repeated calls all wait for the same teardown.
    pub async fn cleanup(&self) {
        self.shutdown
            .get_or_init(|| async {
                self.closed.store(true, Ordering::SeqCst);
                if let Some(reaper) = self.reaper.lock().take() {
                    reaper.abort();
                }

                let mut all: Vec<_> = self.instances.lock().drain().flat_map(|(_, set)| set).collect();
                all.append(&mut self.retiring.lock());
                for instance in &all {
                    instance.retire();
                }
                join_all(all.iter().map(|instance| instance.cleanup())).await;
                self.env.shutdown().await;
                info!(instances = all.len(), "Function pool shut down");
            })
            .await;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of live instances of `key`
    pub fn instance_count(&self, key: &str) -> usize {
        self.instances.lock().get(key).map_or(0, Vec::len)
    }
}

impl Drop for FunctionPool {
    fn drop(&mut self) {
        if let Some(reaper) = self.reaper.lock().take() {
            reaper.abort();
        }
    }
}
