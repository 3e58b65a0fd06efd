//! State store contract and an in-memory implementation.
//!
//! The store is the system of record for [`ResourceState`]. Writes are
//! conditional on the version token so a concurrent writer is detected
//! instead of silently overwritten.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;

use crate::types::{ResourceId, ResourceState};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),
    #[error("version conflict for {resource_id}: expected {expected}, found {found}")]
    Conflict {
        resource_id: String,
        expected: u64,
        found: u64,
    },
    #[error("corrupt state for {resource_id}: {message}")]
    Corrupt {
        resource_id: String,
        message: String,
    },
}

impl StoreError {
    /// The write may have been applied even though it reported failure.
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// The stored state differs from what the caller last read.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Precondition for [`StateStore::upsert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteCondition {
    /// Last write wins.
    Always,
    /// Only write if the stored version equals this value (`0` = no row yet).
    IfVersion(u64),
}

/// Durable mapping from resource id to its last known state.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Point lookup. `Ok(None)` when the resource has never been persisted.
    async fn get(&self, resource_id: &ResourceId) -> Result<Option<ResourceState>>;

    /// Insert or replace the state for `state.resource_id`.
    ///
    /// Returns the committed state with its new version and timestamp.
    async fn upsert(&self, state: &ResourceState, condition: WriteCondition)
        -> Result<ResourceState>;

    /// Remove a resource's state. Returns true if a row existed.
    async fn delete(&self, resource_id: &ResourceId) -> Result<bool>;
}

/// Store backed by a process-local map. State is lost on restart.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    states: RwLock<HashMap<String, ResourceState>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.states
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl StateStore for InMemoryStore {
    async fn get(&self, resource_id: &ResourceId) -> Result<Option<ResourceState>> {
        let states = self.states.read().unwrap_or_else(PoisonError::into_inner);
        Ok(states.get(resource_id.as_str()).cloned())
    }

    async fn upsert(
        &self,
        state: &ResourceState,
        condition: WriteCondition,
    ) -> Result<ResourceState> {
        let mut states = self.states.write().unwrap_or_else(PoisonError::into_inner);
        let current = states
            .get(state.resource_id.as_str())
            .map_or(0, |s| s.version);

        if let WriteCondition::IfVersion(expected) = condition {
            if current != expected {
                return Err(StoreError::Conflict {
                    resource_id: state.resource_id.to_string(),
                    expected,
                    found: current,
                });
            }
        }

        let mut committed = state.clone();
        committed.version = current + 1;
        committed.updated_at = Some(Utc::now());
        states.insert(state.resource_id.0.clone(), committed.clone());
        Ok(committed)
    }

    async fn delete(&self, resource_id: &ResourceId) -> Result<bool> {
        let mut states = self.states.write().unwrap_or_else(PoisonError::into_inner);
        Ok(states.remove(resource_id.as_str()).is_some())
    }
}
