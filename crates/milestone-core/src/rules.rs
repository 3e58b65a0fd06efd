//! Milestone crossing rules.
//!
//! A rule decides, from the previously stored metric state and a fresh
//! observation, whether a new milestone was reached. Rules are pure: they
//! never touch storage and never mutate state.

use serde::{Deserialize, Serialize};

use crate::types::{MetricPhase, MetricState, RuleKind};

/// Crossing rule for one metric. Steps are always non-zero (see
/// [`CrossingRule::validate`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CrossingRule {
    /// Milestones start at `floor`, then fire every `step` units.
    FloorStep { floor: u64, step: u64 },
    /// Milestones fire at every multiple of `step`.
    PureStep { step: u64 },
}

/// A newly crossed milestone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Crossing {
    /// Milestone value reported to the caller.
    pub reported: u64,
    /// Step multiple stored as `last_triggered_milestone`.
    pub recorded: u64,
}

impl CrossingRule {
    pub fn kind(&self) -> RuleKind {
        match self {
            Self::FloorStep { .. } => RuleKind::FloorStep,
            Self::PureStep { .. } => RuleKind::PureStep,
        }
    }

    pub fn step(&self) -> u64 {
        match self {
            Self::FloorStep { step, .. } | Self::PureStep { step } => *step,
        }
    }

    /// Counter value at which tracking begins (`0` for pure-step rules).
    pub fn floor(&self) -> u64 {
        match self {
            Self::FloorStep { floor, .. } => *floor,
            Self::PureStep { .. } => 0,
        }
    }

    /// Reject rules that cannot be evaluated.
    pub fn validate(&self) -> Result<(), String> {
        if self.step() == 0 {
            return Err(format!("{} step must be greater than zero", self.kind().as_str()));
        }
        Ok(())
    }

    /// Largest multiple of the step not above `value`.
    fn multiple(&self, value: u64) -> u64 {
        value / self.step() * self.step()
    }

    /// Decide whether `observed` crosses a new milestone given the stored
    /// state. Callers must not pass observations below the stored counter.
    pub fn evaluate(&self, previous: Option<&MetricState>, observed: u64) -> Option<Crossing> {
        let last_counter = previous.map_or(0, |m| m.last_counter_value);

        match *self {
            Self::FloorStep { floor, step } => {
                if observed < floor {
                    return None;
                }
                // First arrival at the floor fires once, whatever the step alignment.
                let crossed = last_counter < floor || observed / step > last_counter / step;
                crossed.then(|| Crossing {
                    reported: floor.max(self.multiple(observed)),
                    recorded: self.multiple(observed),
                })
            }
            Self::PureStep { .. } => {
                let multiple = self.multiple(observed);
                let last_triggered = previous
                    .and_then(|m| m.last_triggered_milestone)
                    .unwrap_or(0);
                (multiple > last_triggered).then_some(Crossing {
                    reported: multiple,
                    recorded: multiple,
                })
            }
        }
    }

    /// Initial metric state for a resource seeded with `initial`.
    ///
    /// Milestones at or below the seed count as already reported.
    pub fn seed(&self, initial: u64) -> MetricState {
        let last_triggered_milestone = match self {
            Self::FloorStep { floor, .. } => {
                (initial >= *floor).then(|| self.multiple(initial))
            }
            Self::PureStep { .. } => Some(self.multiple(initial)).filter(|m| *m > 0),
        };
        MetricState {
            last_counter_value: initial,
            last_triggered_milestone,
        }
    }

    pub fn phase(&self, state: Option<&MetricState>) -> MetricPhase {
        match state {
            None => MetricPhase::Uninitialized,
            Some(m) if m.last_counter_value < self.floor() => MetricPhase::BelowFloor,
            Some(_) => MetricPhase::Armed,
        }
    }

    /// Smallest counter value that would cross a new milestone.
    pub fn next_trigger(&self, state: Option<&MetricState>) -> u64 {
        match self {
            Self::FloorStep { floor, step } => {
                let last_counter = state.map_or(0, |m| m.last_counter_value);
                if last_counter < *floor {
                    *floor
                } else {
                    (last_counter / step + 1) * step
                }
            }
            Self::PureStep { step } => {
                let last_triggered = state
                    .and_then(|m| m.last_triggered_milestone)
                    .unwrap_or(0);
                self.multiple(last_triggered) + step
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(counter: u64, milestone: Option<u64>) -> MetricState {
        MetricState {
            last_counter_value: counter,
            last_triggered_milestone: milestone,
        }
    }

    #[test]
    fn floor_step_boundary() {
        let rule = CrossingRule::FloorStep { floor: 525, step: 5 };

        assert_eq!(rule.evaluate(Some(&state(520, None)), 524), None);

        let crossing = rule.evaluate(Some(&state(524, None)), 525).unwrap();
        assert_eq!(crossing.reported, 525);
        assert_eq!(crossing.recorded, 525);

        assert_eq!(rule.evaluate(Some(&state(525, Some(525))), 529), None);

        let crossing = rule.evaluate(Some(&state(529, Some(525))), 530).unwrap();
        assert_eq!(crossing.reported, 530);
    }

    #[test]
    fn floor_step_unaligned_floor_fires_once_on_arrival() {
        let rule = CrossingRule::FloorStep { floor: 523, step: 5 };

        let crossing = rule.evaluate(Some(&state(500, None)), 524).unwrap();
        assert_eq!(crossing.reported, 523);
        assert_eq!(crossing.recorded, 520);

        // Same step bucket as the floor arrival: nothing new.
        assert_eq!(rule.evaluate(Some(&state(524, Some(520))), 524), None);
        assert!(rule.evaluate(Some(&state(524, Some(520))), 525).is_some());
    }

    #[test]
    fn floor_step_skipped_polls_fire_once() {
        let rule = CrossingRule::FloorStep { floor: 525, step: 5 };
        let crossing = rule.evaluate(Some(&state(100, None)), 612).unwrap();
        assert_eq!(crossing.reported, 610);
        assert_eq!(crossing.recorded, 610);
    }

    #[test]
    fn floor_step_from_uninitialized() {
        let rule = CrossingRule::FloorStep { floor: 525, step: 5 };
        assert_eq!(rule.evaluate(None, 10), None);
        assert!(rule.evaluate(None, 600).is_some());
    }

    #[test]
    fn pure_step_only_fires_above_last_triggered() {
        let rule = CrossingRule::PureStep { step: 25 };
        assert_eq!(rule.evaluate(None, 24), None);
        assert_eq!(rule.evaluate(None, 25).unwrap().reported, 25);
        assert_eq!(rule.evaluate(Some(&state(25, Some(25))), 49), None);
        assert_eq!(rule.evaluate(Some(&state(49, Some(25))), 50).unwrap().reported, 50);
        assert_eq!(rule.evaluate(Some(&state(50, Some(50))), 50), None);
    }

    #[test]
    fn seed_marks_prior_milestones_as_reported() {
        let likes = CrossingRule::PureStep { step: 25 };
        assert_eq!(likes.seed(60), state(60, Some(50)));
        assert_eq!(likes.seed(10), state(10, None));

        let views = CrossingRule::FloorStep { floor: 525, step: 5 };
        assert_eq!(views.seed(100), state(100, None));
        assert_eq!(views.seed(531), state(531, Some(530)));
    }

    #[test]
    fn phase_transitions() {
        let views = CrossingRule::FloorStep { floor: 525, step: 5 };
        assert_eq!(views.phase(None), MetricPhase::Uninitialized);
        assert_eq!(views.phase(Some(&state(10, None))), MetricPhase::BelowFloor);
        assert_eq!(views.phase(Some(&state(525, Some(525)))), MetricPhase::Armed);

        let likes = CrossingRule::PureStep { step: 25 };
        assert_eq!(likes.phase(Some(&state(0, None))), MetricPhase::Armed);
    }

    #[test]
    fn next_trigger_values() {
        let views = CrossingRule::FloorStep { floor: 525, step: 5 };
        assert_eq!(views.next_trigger(None), 525);
        assert_eq!(views.next_trigger(Some(&state(527, Some(525)))), 530);

        let likes = CrossingRule::PureStep { step: 25 };
        assert_eq!(likes.next_trigger(None), 25);
        assert_eq!(likes.next_trigger(Some(&state(60, Some(50)))), 75);
    }

    #[test]
    fn zero_step_is_invalid() {
        assert!(CrossingRule::PureStep { step: 0 }.validate().is_err());
        assert!(CrossingRule::FloorStep { floor: 1, step: 5 }.validate().is_ok());
    }
}
