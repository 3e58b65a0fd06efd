//! In-process state cache.
//!
//! A pure read-through/write-through mirror of the store. It holds only
//! states that were read from or committed to the store, never synthesized
//! defaults, so dropping an entry is always safe.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use crate::types::{ResourceId, ResourceState};

/// Cache interface injected into the engine.
pub trait StateCache: Send + Sync {
    fn get(&self, resource_id: &ResourceId) -> Option<ResourceState>;
    fn put(&self, state: ResourceState);
    fn invalidate(&self, resource_id: &ResourceId);
}

/// Unbounded map-backed cache.
#[derive(Debug, Default)]
pub struct InMemoryCache {
    entries: RwLock<HashMap<String, ResourceState>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StateCache for InMemoryCache {
    fn get(&self, resource_id: &ResourceId) -> Option<ResourceState> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(resource_id.as_str())
            .cloned()
    }

    fn put(&self, state: ResourceState) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(state.resource_id.0.clone(), state);
    }

    fn invalidate(&self, resource_id: &ResourceId) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(resource_id.as_str());
    }
}

/// Cache that never retains anything; every load reads through to the store.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCache;

impl StateCache for NoCache {
    fn get(&self, _resource_id: &ResourceId) -> Option<ResourceState> {
        None
    }

    fn put(&self, _state: ResourceState) {}

    fn invalidate(&self, _resource_id: &ResourceId) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_invalidate() {
        let cache = InMemoryCache::new();
        let id = ResourceId::new("vid");
        assert!(cache.get(&id).is_none());

        let mut state = ResourceState::new(id.clone());
        state.version = 3;
        cache.put(state.clone());
        assert_eq!(cache.get(&id), Some(state));
        assert_eq!(cache.len(), 1);

        cache.invalidate(&id);
        assert!(cache.get(&id).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn no_cache_never_retains() {
        let cache = NoCache;
        let id = ResourceId::new("vid");
        cache.put(ResourceState::new(id.clone()));
        assert!(cache.get(&id).is_none());
    }
}
