//! Trial records: lifecycle state, typed attributes, and the handle passed to
//! objectives.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The state of a trial in its lifecycle.
///
/// Trials move `Created -> Running -> Complete | Failed`, each step exactly once.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialState {
    /// A trial number was allocated; parameters are being sampled.
    Created,
    /// Parameters are fixed and the objective is being evaluated.
    Running,
    /// The objective returned a value.
    Complete,
    /// The objective failed.
    Failed,
}

impl TrialState {
    /// Returns `true` for `Complete` and `Failed`.
    #[must_use]
    pub fn is_finished(self) -> bool {
        matches!(self, TrialState::Complete | TrialState::Failed)
    }

    /// Returns `true` if a trial in `self` may move to `next`.
    #[must_use]
    pub fn can_transition_to(self, next: TrialState) -> bool {
        matches!(
            (self, next),
            (TrialState::Created, TrialState::Running)
                | (TrialState::Running, TrialState::Complete | TrialState::Failed)
        )
    }

    /// Stable lowercase name used by the persistent backends.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            TrialState::Created => "created",
            TrialState::Running => "running",
            TrialState::Complete => "complete",
            TrialState::Failed => "failed",
        }
    }

    /// Inverse of [`as_str`](Self::as_str).
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(TrialState::Created),
            "running" => Some(TrialState::Running),
            "complete" => Some(TrialState::Complete),
            "failed" => Some(TrialState::Failed),
            _ => None,
        }
    }
}

/// User attributes recorded alongside a trial.
///
/// The well-known attributes are typed; anything else reported by the trainer
/// lands in `extra` untouched.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TrialAttrs {
    /// The exact argv used to launch the trainer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invocation: Option<Vec<String>>,
    /// Best iteration reported by the trainer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best_iteration: Option<u64>,
    /// Error message of a failed trial.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail_reason: Option<String>,
    /// Opaque pass-through attributes.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// A trial as recorded in a [`StudyStore`](crate::storage::StudyStore).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FrozenTrial {
    /// Study-unique trial number.
    pub number: u64,
    /// Lifecycle state.
    pub state: TrialState,
    /// Sampled parameter values, by name.
    pub params: BTreeMap<String, f64>,
    /// Objective value; present iff the trial is `Complete`.
    pub value: Option<f64>,
    /// User attributes.
    pub attrs: TrialAttrs,
    /// When the trial became `Running`.
    pub started_at: Option<DateTime<Utc>>,
    /// When the trial reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
}

impl FrozenTrial {
    /// A freshly allocated trial with no parameters.
    #[must_use]
    pub fn created(number: u64) -> Self {
        Self {
            number,
            state: TrialState::Created,
            params: BTreeMap::new(),
            value: None,
            attrs: TrialAttrs::default(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Returns the parameter value for `name`, if it was sampled.
    #[must_use]
    pub fn param(&self, name: &str) -> Option<f64> {
        self.params.get(name).copied()
    }

    /// Returns the value if the trial is `Complete`.
    #[must_use]
    pub fn completed_value(&self) -> Option<f64> {
        match self.state {
            TrialState::Complete => self.value,
            _ => None,
        }
    }
}

/// Pick the best trial among `trials`: lowest value among complete trials,
/// ties going to the lowest trial number.
pub(crate) fn best_of<'a, I>(trials: I) -> Option<&'a FrozenTrial>
where
    I: IntoIterator<Item = &'a FrozenTrial>,
{
    trials
        .into_iter()
        .filter_map(|t| t.completed_value().map(|v| (v, t)))
        .min_by(|(va, a), (vb, b)| va.total_cmp(vb).then(a.number.cmp(&b.number)))
        .map(|(_, t)| t)
}

/// A running trial as seen by an [`Objective`](crate::Objective).
///
/// Parameters are sampled before the objective runs, so the handle only
/// exposes read access to them. The objective records attributes on the
/// handle; they are persisted whether evaluation succeeds or fails.
#[derive(Clone, Debug)]
pub struct Trial {
    number: u64,
    params: BTreeMap<String, f64>,
    attrs: TrialAttrs,
}

impl Trial {
    /// Creates a handle for trial `number` with its sampled parameters.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::collections::BTreeMap;
    ///
    /// use ffm_tune::Trial;
    ///
    /// let trial = Trial::new(3, BTreeMap::from([("eta".to_string(), 0.1)]));
    /// assert_eq!(trial.number(), 3);
    /// assert_eq!(trial.param("eta"), Some(0.1));
    /// ```
    #[must_use]
    pub fn new(number: u64, params: BTreeMap<String, f64>) -> Self {
        Self {
            number,
            params,
            attrs: TrialAttrs::default(),
        }
    }

    /// Returns the trial number.
    #[must_use]
    pub fn number(&self) -> u64 {
        self.number
    }

    /// Returns all sampled parameters.
    #[must_use]
    pub fn params(&self) -> &BTreeMap<String, f64> {
        &self.params
    }

    /// Returns the sampled value of `name`.
    #[must_use]
    pub fn param(&self, name: &str) -> Option<f64> {
        self.params.get(name).copied()
    }

    /// Returns the attributes recorded so far.
    #[must_use]
    pub fn attrs(&self) -> &TrialAttrs {
        &self.attrs
    }

    /// Record the exact command line used for this trial.
    pub fn set_invocation(&mut self, argv: Vec<String>) {
        self.attrs.invocation = Some(argv);
    }

    /// Record the best iteration reported by the trainer.
    pub fn set_best_iteration(&mut self, iteration: u64) {
        self.attrs.best_iteration = Some(iteration);
    }

    /// Record an opaque attribute.
    pub fn set_extra_attr(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.attrs.extra.insert(key.into(), value);
    }

    pub(crate) fn into_attrs(self) -> TrialAttrs {
        self.attrs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete(number: u64, value: f64) -> FrozenTrial {
        FrozenTrial {
            state: TrialState::Complete,
            value: Some(value),
            ..FrozenTrial::created(number)
        }
    }

    #[test]
    fn transitions_follow_lifecycle() {
        use TrialState::{Complete, Created, Failed, Running};
        assert!(Created.can_transition_to(Running));
        assert!(Running.can_transition_to(Complete));
        assert!(Running.can_transition_to(Failed));
        assert!(!Created.can_transition_to(Complete));
        assert!(!Complete.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Running));
        assert!(!Running.can_transition_to(Running));
    }

    #[test]
    fn state_names_round_trip() {
        for s in [
            TrialState::Created,
            TrialState::Running,
            TrialState::Complete,
            TrialState::Failed,
        ] {
            assert_eq!(TrialState::parse(s.as_str()), Some(s));
        }
        assert_eq!(TrialState::parse("pruned"), None);
    }

    #[test]
    fn best_of_prefers_lowest_value_then_lowest_number() {
        let mut failed = FrozenTrial::created(0);
        failed.state = TrialState::Failed;
        let trials = vec![
            failed,
            complete(1, 0.4),
            complete(2, 0.3),
            complete(3, 0.3),
            complete(4, 0.9),
        ];
        let best = best_of(&trials).unwrap();
        assert_eq!(best.number, 2);
        assert_eq!(best.value, Some(0.3));
    }

    #[test]
    fn best_of_ignores_unfinished_trials() {
        let mut running = FrozenTrial::created(0);
        running.state = TrialState::Running;
        running.value = Some(-1.0);
        assert!(best_of(&[running]).is_none());
    }

    #[test]
    fn attrs_skip_empty_fields_when_serialized() {
        let json = serde_json::to_string(&TrialAttrs::default()).unwrap();
        assert_eq!(json, "{}");

        let mut trial = Trial::new(0, BTreeMap::new());
        trial.set_best_iteration(12);
        trial.set_extra_attr("tr_loss", serde_json::json!(0.25));
        let attrs = trial.into_attrs();
        let back: TrialAttrs = serde_json::from_str(&serde_json::to_string(&attrs).unwrap()).unwrap();
        assert_eq!(back, attrs);
    }
}
