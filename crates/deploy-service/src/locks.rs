//! Per-resource serialization
//!
//! Every mutating operation on a resource id runs under that id's lock, so
//! two operations on the same resource never interleave. Different ids
//! proceed in parallel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

pub type ResourceGuard = OwnedMutexGuard<()>;

#[derive(Default)]
pub struct ResourceLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl ResourceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(id.to_string()).or_default().clone()
    }

    /// Wait for exclusive access to `id`
    pub async fn acquire(&self, id: &str) -> ResourceGuard {
        self.entry(id).lock_owned().await
    }

    /// Exclusive access to `id` if nobody holds it right now
    pub fn try_acquire(&self, id: &str) -> Option<ResourceGuard> {
        self.entry(id).try_lock_owned().ok()
    }

    pub fn is_locked(&self, id: &str) -> bool {
        let locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .get(id)
            .map(|lock| lock.try_lock().is_err())
            .unwrap_or(false)
    }

    /// Drop entries nobody holds or waits on
    pub fn prune(&self) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
