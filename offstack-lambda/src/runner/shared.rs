//! Lease-counted units shared by all instances of one function key
//!
//! Subprocesses and workers are started lazily on first use, replaced when
//! they die, and shut down when the last instance using them is cleaned up.

use async_trait::async_trait;
use dashmap::DashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::invocation::InvocationError;

#[async_trait]
pub(crate) trait SharedUnit: Send + Sync + 'static {
    fn is_alive(&self) -> bool;

    async fn shutdown(&self);
}

struct Slot<U> {
    users: AtomicUsize,
    unit: Mutex<Option<Arc<U>>>,
}

pub(crate) struct SharedUnits<U> {
    slots: DashMap<String, Arc<Slot<U>>>,
}

impl<U: SharedUnit> SharedUnits<U> {
    pub(crate) fn new() -> Self {
        Self {
            slots: DashMap::new(),
        }
    }

    fn slot(&self, key: &str) -> Arc<Slot<U>> {
        self.slots
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(Slot {
                    users: AtomicUsize::new(0),
                    unit: Mutex::new(None),
                })
            })
            .clone()
    }

    /// Record one more instance using `key`
    pub(crate) fn acquire(&self, key: &str) {
        self.slot(key).users.fetch_add(1, Ordering::SeqCst);
    }

    /// Running unit for `key`, started with `start` when absent or dead.
    /// Fails once every claim on `key` was released or after `shutdown_all`.
    pub(crate) async fn get_or_start<F, Fut>(&self, key: &str, start: F) -> Result<Arc<U>, InvocationError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<U, InvocationError>>,
    {
        let Some(slot) = self.slots.get(key).map(|s| s.clone()) else {
            return Err(InvocationError::PoolClosed);
        };
        let mut unit = slot.unit.lock().await;
        if slot.users.load(Ordering::SeqCst) == 0 {
            return Err(InvocationError::PoolClosed);
        }
        if let Some(existing) = unit.as_ref() {
            if existing.is_alive() {
                return Ok(existing.clone());
            }
        }
        let started = Arc::new(start().await?);
        *unit = Some(started.clone());
        Ok(started)
    }

    /// Drop one instance's claim; the last one shuts the unit down
    pub(crate) async fn release(&self, key: &str) {
        let Some(slot) = self.slots.get(key).map(|s| s.clone()) else {
            return;
        };
        let previous = slot
            .users
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        if previous > 1 {
            return;
        }

        let unit = slot.unit.lock().await.take();
        if let Some(unit) = unit {
            unit.shutdown().await;
        }
        self.slots
            .remove_if(key, |_, s| s.users.load(Ordering::SeqCst) == 0);
    }

    pub(crate) async fn shutdown_all(&self) {
        let slots: Vec<_> = self.slots.iter().map(|entry| entry.value().clone()).collect();
        self.slots.clear();
        for slot in slots {
            let unit = slot.unit.lock().await.take();
            if let Some(unit) = unit {
                unit.shutdown().await;
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn users(&self, key: &str) -> usize {
        self.slots
            .get(key)
            .map_or(0, |slot| slot.users.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    struct StubUnit {
        alive: AtomicBool,
        stopped: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl SharedUnit for StubUnit {
        fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        async fn shutdown(&self) {
            self.stopped.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn stub(stopped: &Arc<AtomicUsize>) -> StubUnit {
        StubUnit {
            alive: AtomicBool::new(true),
            stopped: stopped.clone(),
        }
    }

    #[tokio::test]
    async fn test_unit_shared_until_last_release() {
        let units = SharedUnits::new();
        let stopped = Arc::new(AtomicUsize::new(0));

        units.acquire("fn");
        units.acquire("fn");
        let a = units.get_or_start("fn", || async { Ok(stub(&stopped)) }).await.unwrap();
        let b = units.get_or_start("fn", || async { Ok(stub(&stopped)) }).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        units.release("fn").await;
        assert_eq!(stopped.load(Ordering::SeqCst), 0);
        assert_eq!(units.users("fn"), 1);

        units.release("fn").await;
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
        assert_eq!(units.users("fn"), 0);
    }

    #[tokio::test]
    async fn test_released_or_shut_down_key_starts_nothing() {
        let units = SharedUnits::new();
        let stopped = Arc::new(AtomicUsize::new(0));

        units.acquire("fn");
        units.release("fn").await;
        let late = units.get_or_start("fn", || async { Ok(stub(&stopped)) }).await;
        assert!(matches!(late, Err(InvocationError::PoolClosed)));

        units.acquire("other");
        units.get_or_start("other", || async { Ok(stub(&stopped)) }).await.unwrap();
        units.shutdown_all().await;
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
        let late = units.get_or_start("other", || async { Ok(stub(&stopped)) }).await;
        assert!(matches!(late, Err(InvocationError::PoolClosed)));
    }

    #[tokio::test]
    async fn test_dead_unit_is_replaced() {
        let units = SharedUnits::new();
        let stopped = Arc::new(AtomicUsize::new(0));
        units.acquire("fn");

        let first = units.get_or_start("fn", || async { Ok(stub(&stopped)) }).await.unwrap();
        first.alive.store(false, Ordering::SeqCst);
        let second = units.get_or_start("fn", || async { Ok(stub(&stopped)) }).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }
}
