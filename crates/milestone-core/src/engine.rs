//! Milestone engine.
//!
//! Loads a resource's state, applies the metric's crossing rule to a fresh
//! observation, persists the advanced state and reports the decision.
//!
//! Callers must serialize checks for the same resource (see
//! [`crate::lock::ResourceLocks`]); the engine performs exactly one store
//! write per call and never retries on its own.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cache::StateCache;
use crate::catalog::MetricCatalog;
use crate::store::{StateStore, StoreError, WriteCondition};
use crate::types::{Decision, MetricStatus, ResourceId, ResourceState, ResourceStatus};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("unknown metric '{metric}' for resource {resource_id}")]
    UnknownMetric { resource_id: String, metric: String },
    #[error("failed to load state for {resource_id}: {source}")]
    StoreReadFailure {
        resource_id: String,
        source: StoreError,
    },
    #[error("failed to persist state for {resource_id}: {source}")]
    PersistenceFailure {
        resource_id: String,
        source: StoreError,
    },
}

impl EngineError {
    /// Malformed request or configuration mismatch. Retrying will not help.
    pub fn is_caller_error(&self) -> bool {
        matches!(self, Self::InvalidInput(_) | Self::UnknownMetric { .. })
    }

    /// The write may have committed; re-read state before retrying the same
    /// observation.
    pub fn requires_recheck(&self) -> bool {
        match self {
            Self::PersistenceFailure { source, .. } => {
                source.is_ambiguous() || source.is_conflict()
            }
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Milestone detection over durable per-resource state.
pub struct MilestoneEngine {
    catalog: MetricCatalog,
    store: Arc<dyn StateStore>,
    cache: Arc<dyn StateCache>,
    store_timeout: Option<Duration>,
}

impl std::fmt::Debug for MilestoneEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MilestoneEngine")
            .field("catalog", &self.catalog)
            .field("store_timeout", &self.store_timeout)
            .finish_non_exhaustive()
    }
}

impl MilestoneEngine {
    pub fn new(
        catalog: MetricCatalog,
        store: Arc<dyn StateStore>,
        cache: Arc<dyn StateCache>,
    ) -> Self {
        Self {
            catalog,
            store,
            cache,
            store_timeout: None,
        }
    }

    /// Bound each store call (load and write) by `timeout`.
    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = Some(timeout);
        self
    }

    pub fn catalog(&self) -> &MetricCatalog {
        &self.catalog
    }

    /// Apply a fresh observation of `metric` to `resource_id`.
    ///
    /// `observed` must come from a successful metric fetch. Values below
    /// the stored counter are tolerated: they never trigger and never move
    /// the counter backward.
    pub async fn check_and_advance(
        &self,
        resource_id: &str,
        metric: &str,
        observed: i64,
    ) -> Result<Decision> {
        let resource_id = validate_resource_id(resource_id)?;
        if metric.trim().is_empty() {
            return Err(EngineError::InvalidInput("metric must not be empty".into()));
        }
        let observed = u64::try_from(observed).map_err(|_| {
            EngineError::InvalidInput(format!("observed value must be non-negative, got {observed}"))
        })?;
        let rule = self
            .catalog
            .rule_for(&resource_id, metric)
            .ok_or_else(|| EngineError::UnknownMetric {
                resource_id: resource_id.to_string(),
                metric: metric.to_string(),
            })?
            .rule;

        let state = self.load(&resource_id).await?;
        let previous = state.metric(metric).copied();

        let source_regressed = previous.is_some_and(|m| observed < m.last_counter_value);
        let crossing = if source_regressed {
            warn!(
                resource_id = %resource_id,
                metric,
                observed,
                stored = previous.map_or(0, |m| m.last_counter_value),
                "observation below stored counter, ignoring"
            );
            None
        } else {
            rule.evaluate(previous.as_ref(), observed)
        };

        let mut next = state.clone();
        let entry = next.metrics.entry(metric.to_string()).or_default();
        entry.last_counter_value = entry.last_counter_value.max(observed);
        if let Some(crossing) = crossing {
            entry.last_triggered_milestone = Some(
                entry
                    .last_triggered_milestone
                    .map_or(crossing.recorded, |m| m.max(crossing.recorded)),
            );
        }

        let committed = self
            .persist(&next, WriteCondition::IfVersion(state.version))
            .await?;
        self.cache.put(committed);

        let milestone_value = crossing.map(|c| c.reported);
        if let Some(milestone) = milestone_value {
            info!(
                resource_id = %resource_id,
                metric,
                observed,
                milestone,
                "milestone crossed"
            );
        } else {
            debug!(resource_id = %resource_id, metric, observed, "no new milestone");
        }

        Ok(Decision {
            metric: metric.to_string(),
            observed_value: observed,
            crossed: milestone_value.is_some(),
            milestone_value,
            source_regressed,
        })
    }

    /// Current state of a resource: cache, then store, then a seeded default.
    ///
    /// A store hit fills the cache; seeded defaults are not cached until they
    /// are persisted. Only call this while holding the resource's lock.
    pub async fn load(&self, resource_id: &ResourceId) -> Result<ResourceState> {
        self.read(resource_id, true).await
    }

    async fn read(&self, resource_id: &ResourceId, fill_cache: bool) -> Result<ResourceState> {
        if let Some(state) = self.cache.get(resource_id) {
            return Ok(state);
        }

        debug!(resource_id = %resource_id, "state cache miss, reading store");
        let stored = self
            .bounded(self.store.get(resource_id))
            .await
            .map_err(|source| EngineError::StoreReadFailure {
                resource_id: resource_id.to_string(),
                source,
            })?;

        match stored {
            Some(state) => {
                if fill_cache {
                    self.cache.put(state.clone());
                }
                Ok(state)
            }
            None => {
                debug!(resource_id = %resource_id, "no stored state, seeding defaults");
                Ok(self.catalog.seed_state(resource_id))
            }
        }
    }

    /// Stored values and next trigger for every metric registered for the
    /// resource.
    ///
    /// Read-only: never fills the cache, so it is safe without the resource
    /// lock.
    pub async fn status(&self, resource_id: &str) -> Result<ResourceStatus> {
        let resource_id = validate_resource_id(resource_id)?;
        let state = self.read(&resource_id, false).await?;

        let metrics = self
            .catalog
            .metrics_for(&resource_id)
            .into_iter()
            .map(|(name, metric)| {
                let stored = state.metric(name);
                MetricStatus {
                    metric: name.to_string(),
                    rule: metric.rule.kind(),
                    phase: metric.rule.phase(stored),
                    last_counter_value: stored.map(|m| m.last_counter_value),
                    last_triggered_milestone: stored.and_then(|m| m.last_triggered_milestone),
                    next_trigger: metric.rule.next_trigger(stored),
                }
            })
            .collect();

        Ok(ResourceStatus {
            resource_id: state.resource_id,
            version: state.version,
            updated_at: state.updated_at,
            metrics,
        })
    }

    /// Delete a resource's stored state and evict it from the cache.
    ///
    /// Administrative only; checks never delete state.
    pub async fn forget(&self, resource_id: &str) -> Result<bool> {
        let resource_id = validate_resource_id(resource_id)?;
        // Evict even if the delete fails: the store outcome is unknown.
        self.cache.invalidate(&resource_id);
        let removed = self
            .bounded(self.store.delete(&resource_id))
            .await
            .map_err(|source| EngineError::PersistenceFailure {
                resource_id: resource_id.to_string(),
                source,
            })?;
        info!(resource_id = %resource_id, removed, "state deleted");
        Ok(removed)
    }

    async fn persist(
        &self,
        state: &ResourceState,
        condition: WriteCondition,
    ) -> Result<ResourceState> {
        match self.bounded(self.store.upsert(state, condition)).await {
            Ok(committed) => Ok(committed),
            Err(source) => {
                if source.is_ambiguous() || source.is_conflict() {
                    // The cached copy can no longer be trusted.
                    self.cache.invalidate(&state.resource_id);
                }
                warn!(
                    resource_id = %state.resource_id,
                    error = %source,
                    "failed to persist state"
                );
                Err(EngineError::PersistenceFailure {
                    resource_id: state.resource_id.to_string(),
                    source,
                })
            }
        }
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = std::result::Result<T, StoreError>>,
    ) -> std::result::Result<T, StoreError> {
        match self.store_timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .unwrap_or(Err(StoreError::Timeout(limit))),
            None => call.await,
        }
    }
}

fn validate_resource_id(resource_id: &str) -> Result<ResourceId> {
    if resource_id.trim().is_empty() {
        return Err(EngineError::InvalidInput(
            "resource id must not be empty".into(),
        ));
    }
    Ok(ResourceId::new(resource_id))
}
