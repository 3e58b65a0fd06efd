//! Core types for the milestone engine.
//!
//! Resource state, per-metric counters and the decision record returned to
//! callers after every check.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque, stable identifier of a monitored resource (e.g. a video id).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(pub String);

impl ResourceId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for ResourceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// --- Enumerations ---

/// Crossing rule family configured for a metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    /// Start reporting at a floor, then every step after it.
    FloorStep,
    /// Report every multiple of the step.
    PureStep,
}

impl RuleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FloorStep => "floor_step",
            Self::PureStep => "pure_step",
        }
    }
}

/// Tracking phase of one resource/metric pair.
///
/// Transitions only move forward: `Uninitialized -> BelowFloor -> Armed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MetricPhase {
    Uninitialized,
    BelowFloor,
    Armed,
}

impl MetricPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uninitialized => "UNINITIALIZED",
            Self::BelowFloor => "BELOW_FLOOR",
            Self::Armed => "ARMED",
        }
    }
}

// --- State ---

/// Last observed values for a single metric of a resource.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricState {
    /// Highest absolute counter value observed so far.
    pub last_counter_value: u64,
    /// Highest step multiple already reported as crossed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_triggered_milestone: Option<u64>,
}

/// Durable state of one monitored resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceState {
    pub resource_id: ResourceId,
    pub metrics: BTreeMap<String, MetricState>,
    /// Write token for conditional upserts. `0` means never persisted.
    pub version: u64,
    /// Time of the last successful persist. Not used by crossing logic.
    pub updated_at: Option<DateTime<Utc>>,
}

impl ResourceState {
    /// Empty, never-persisted state for a resource.
    pub fn new(resource_id: ResourceId) -> Self {
        Self {
            resource_id,
            metrics: BTreeMap::new(),
            version: 0,
            updated_at: None,
        }
    }

    pub fn metric(&self, name: &str) -> Option<&MetricState> {
        self.metrics.get(name)
    }
}

// --- Results ---

/// Outcome of a single `check_and_advance` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub metric: String,
    pub observed_value: u64,
    pub crossed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub milestone_value: Option<u64>,
    /// The observation was below the stored counter and was not applied.
    #[serde(default)]
    pub source_regressed: bool,
}

/// Read-only view of a metric for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricStatus {
    pub metric: String,
    pub rule: RuleKind,
    pub phase: MetricPhase,
    pub last_counter_value: Option<u64>,
    pub last_triggered_milestone: Option<u64>,
    /// Smallest counter value that would cross a new milestone.
    pub next_trigger: u64,
}

/// Read-only view of a resource for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceStatus {
    pub resource_id: ResourceId,
    pub version: u64,
    pub updated_at: Option<DateTime<Utc>>,
    pub metrics: Vec<MetricStatus>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_state_is_not_persisted() {
        let state = ResourceState::new(ResourceId::new("abc"));
        assert_eq!(state.version, 0);
        assert!(state.metrics.is_empty());
        assert!(state.updated_at.is_none());
    }

    #[test]
    fn resource_state_json_shape() {
        let mut state = ResourceState::new(ResourceId::new("LQAFm01IOT0"));
        state.metrics.insert(
            "likes".to_string(),
            MetricState {
                last_counter_value: 51,
                last_triggered_milestone: Some(50),
            },
        );
        state.metrics.insert(
            "views".to_string(),
            MetricState {
                last_counter_value: 10,
                last_triggered_milestone: None,
            },
        );

        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["resource_id"], "LQAFm01IOT0");
        assert_eq!(json["metrics"]["likes"]["last_triggered_milestone"], 50);
        assert!(json["metrics"]["views"]
            .get("last_triggered_milestone")
            .is_none());
    }

    #[test]
    fn phase_ordering_is_forward_only() {
        assert!(MetricPhase::Uninitialized < MetricPhase::BelowFloor);
        assert!(MetricPhase::BelowFloor < MetricPhase::Armed);
        assert_eq!(MetricPhase::Armed.as_str(), "ARMED");
    }

    #[test]
    fn decision_omits_missing_milestone() {
        let decision = Decision {
            metric: "views".to_string(),
            observed_value: 524,
            crossed: false,
            milestone_value: None,
            source_regressed: false,
        };
        let json = serde_json::to_value(&decision).unwrap();
        assert!(json.get("milestone_value").is_none());
        assert_eq!(json["crossed"], false);
    }
}
