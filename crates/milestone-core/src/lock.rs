//! Per-resource mutual exclusion.
//!
//! The engine requires at most one in-flight check per resource. Callers
//! hold a [`ResourceGuard`] for the whole fetch/decide/persist cycle.
//! This only serializes callers inside one process; concurrent writers in
//! other processes are caught by the store's version check.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::OwnedMutexGuard;

use crate::types::ResourceId;

/// Held while a resource is being checked. Dropping it releases the lock.
pub type ResourceGuard = OwnedMutexGuard<()>;

/// Registry of async mutexes keyed by resource id.
#[derive(Debug, Default)]
pub struct ResourceLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ResourceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `resource_id`.
    pub async fn acquire(&self, resource_id: &ResourceId) -> ResourceGuard {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            // Drop entries nobody holds or waits on.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(
                locks
                    .entry(resource_id.0.clone())
                    .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
            )
        };
        lock.lock_owned().await
    }

    /// Try to take the lock without waiting.
    #[cfg(test)]
    pub fn try_acquire(&self, resource_id: &ResourceId) -> Option<ResourceGuard> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(
                locks
                    .entry(resource_id.0.clone())
                    .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
            )
        };
        lock.try_lock_owned().ok()
    }

    /// Number of resources with a live lock entry.
    #[cfg(test)]
    pub fn tracked(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
