//! Metric registry: which crossing rule applies to which resource/metric.

use std::collections::BTreeMap;

use crate::rules::CrossingRule;
use crate::types::{ResourceId, ResourceState};

/// Rule and optional seed value for one metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricRule {
    pub rule: CrossingRule,
    /// Counter value assumed for resources seen for the first time.
    pub initial: Option<u64>,
}

impl MetricRule {
    pub fn new(rule: CrossingRule) -> Self {
        Self { rule, initial: None }
    }

    pub fn with_initial(mut self, initial: u64) -> Self {
        self.initial = Some(initial);
        self
    }
}

/// Metric rules applied to every resource, with per-resource overrides.
///
/// An override replaces the default rule for the same metric name and may
/// register metrics the defaults do not have.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricCatalog {
    defaults: BTreeMap<String, MetricRule>,
    overrides: BTreeMap<String, BTreeMap<String, MetricRule>>,
}

impl MetricCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a metric for all resources.
    pub fn with_metric(mut self, name: impl Into<String>, rule: MetricRule) -> Self {
        self.defaults.insert(name.into(), rule);
        self
    }

    /// Register or replace a metric for one resource.
    pub fn with_override(
        mut self,
        resource_id: impl Into<String>,
        name: impl Into<String>,
        rule: MetricRule,
    ) -> Self {
        self.overrides
            .entry(resource_id.into())
            .or_default()
            .insert(name.into(), rule);
        self
    }

    pub fn rule_for(&self, resource_id: &ResourceId, metric: &str) -> Option<&MetricRule> {
        self.overrides
            .get(resource_id.as_str())
            .and_then(|m| m.get(metric))
            .or_else(|| self.defaults.get(metric))
    }

    /// All metrics registered for a resource, overrides applied.
    pub fn metrics_for(&self, resource_id: &ResourceId) -> BTreeMap<&str, &MetricRule> {
        let mut merged: BTreeMap<&str, &MetricRule> = self
            .defaults
            .iter()
            .map(|(name, rule)| (name.as_str(), rule))
            .collect();
        if let Some(overrides) = self.overrides.get(resource_id.as_str()) {
            for (name, rule) in overrides {
                merged.insert(name.as_str(), rule);
            }
        }
        merged
    }

    /// Default state for a resource that has never been persisted.
    pub fn seed_state(&self, resource_id: &ResourceId) -> ResourceState {
        let mut state = ResourceState::new(resource_id.clone());
        for (name, metric) in self.metrics_for(resource_id) {
            if let Some(initial) = metric.initial {
                state
                    .metrics
                    .insert(name.to_string(), metric.rule.seed(initial));
            }
        }
        state
    }
}
