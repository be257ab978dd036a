//! Runs a single trial end-to-end: allocate, sample, evaluate, record.

use core::fmt;
use core::str::FromStr;
use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::objective::Objective;
use crate::study::Study;
use crate::trial::{Trial, TrialState, best_of};

/// What a run does after a trial fails.
///
/// The failed trial is recorded as [`TrialState::Failed`] either way.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop starting new trials and return the error.
    #[default]
    AbortOnFailure,
    /// Keep going; the failure only shows up in the store and the summary.
    SkipAndContinue,
}

impl FromStr for FailurePolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "abort" | "abort_on_failure" | "abort-on-failure" => Ok(FailurePolicy::AbortOnFailure),
            "skip" | "skip_and_continue" | "skip-and-continue" => Ok(FailurePolicy::SkipAndContinue),
            other => Err(Error::InvalidConfig(format!(
                "unknown failure policy '{other}' (expected abort or skip)"
            ))),
        }
    }
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailurePolicy::AbortOnFailure => write!(f, "abort"),
            FailurePolicy::SkipAndContinue => write!(f, "skip"),
        }
    }
}

/// How a trial ended, when the run is allowed to continue.
#[derive(Clone, Debug, PartialEq)]
pub enum TrialOutcome {
    /// The objective returned a finite value.
    Complete {
        /// Trial number.
        number: u64,
        /// Objective value.
        value: f64,
    },
    /// The objective failed and the policy said to keep going.
    Failed {
        /// Trial number.
        number: u64,
        /// Error message, as recorded in `fail_reason`.
        reason: String,
    },
}

impl TrialOutcome {
    /// Returns the trial number.
    #[must_use]
    pub fn number(&self) -> u64 {
        match self {
            TrialOutcome::Complete { number, .. } | TrialOutcome::Failed { number, .. } => *number,
        }
    }
}

/// Drives one trial at a time for a study.
///
/// Cheap to clone; every worker of a parallel run holds its own copy.
#[derive(Clone)]
pub struct TrialCoordinator {
    study: Study,
    objective: Arc<dyn Objective>,
    policy: FailurePolicy,
}

impl TrialCoordinator {
    /// Creates a coordinator for `study` evaluating `objective`.
    #[must_use]
    pub fn new(study: Study, objective: Arc<dyn Objective>, policy: FailurePolicy) -> Self {
        Self {
            study,
            objective,
            policy,
        }
    }

    /// Returns the failure policy.
    #[must_use]
    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    /// Run one trial to a terminal state. Blocks for the whole evaluation.
    ///
    /// # Errors
    ///
    /// Returns store errors, and objective errors when the policy is
    /// [`FailurePolicy::AbortOnFailure`]. In the latter case the trial has
    /// already been recorded as failed.
    pub fn run(&self) -> Result<TrialOutcome> {
        let name = self.study.name();
        let store = self.study.store();

        let number = store.allocate_trial(name)?;
        let span = tracing::info_span!("trial", study = name, number);
        let _enter = span.enter();
        tracing::debug!("allocated trial");

        let history = store.completed_trials(name)?;
        let sampler = self.study.sampler();
        let space = self.objective.search_space();
        sampler.before_trial(number, &space, &history);
        let params: BTreeMap<String, f64> = space
            .into_iter()
            .map(|spec| {
                let value = sampler.suggest(number, &spec.name, &spec.distribution, &history);
                (spec.name, value)
            })
            .collect();
        sampler.after_trial(number);

        store.start_trial(name, number, &params)?;
        tracing::info!(params = ?params, "trial started");

        let mut trial = Trial::new(number, params);
        let result = self
            .objective
            .evaluate(&mut trial)
            .and_then(|value| {
                if value.is_finite() {
                    Ok(value)
                } else {
                    Err(Error::NonFiniteValue(value))
                }
            });
        let mut attrs = trial.into_attrs();

        match result {
            Ok(value) => {
                store.record(name, number, TrialState::Complete, Some(value), &attrs)?;
                tracing::info!(value, "trial completed");
                let previous_best = best_of(&history).and_then(|t| t.value);
                if previous_best.is_none_or(|best| value < best) {
                    tracing::info!(value, "new best value found");
                }
                Ok(TrialOutcome::Complete { number, value })
            }
            Err(e) => {
                let reason = e.to_string();
                attrs.fail_reason = Some(reason.clone());
                store.record(name, number, TrialState::Failed, None, &attrs)?;
                match self.policy {
                    FailurePolicy::AbortOnFailure => {
                        tracing::error!(error = %e, "trial failed, aborting run");
                        Err(e)
                    }
                    FailurePolicy::SkipAndContinue => {
                        tracing::warn!(error = %e, "trial failed, continuing");
                        Ok(TrialOutcome::Failed { number, reason })
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distribution::{FloatDistribution, ParameterSpec};
    use crate::sampler::{RandomSampler, Sampler};
    use crate::storage::{MemoryStore, StudyStore};
    use crate::trial::FrozenTrial;

    struct Fixed(Result<f64>);

    impl Objective for Fixed {
        fn search_space(&self) -> Vec<ParameterSpec> {
            vec![ParameterSpec::new(
                "x",
                FloatDistribution::log_uniform(1e-3, 1.0).unwrap(),
            )]
        }

        fn evaluate(&self, trial: &mut Trial) -> Result<f64> {
            trial.set_best_iteration(9);
            match &self.0 {
                Ok(v) => Ok(*v),
                Err(e) => Err(Error::Storage(e.to_string())),
            }
        }
    }

    fn study() -> Study {
        let store: Arc<dyn StudyStore> = Arc::new(MemoryStore::new());
        Study::create("s", store, Arc::new(RandomSampler::with_seed(1))).unwrap()
    }

    #[test]
    fn completes_and_records_params() {
        let study = study();
        let c = TrialCoordinator::new(
            study.clone(),
            Arc::new(Fixed(Ok(0.25))),
            FailurePolicy::default(),
        );
        assert_eq!(
            c.run().unwrap(),
            TrialOutcome::Complete {
                number: 0,
                value: 0.25
            }
        );
        let trials = study.trials().unwrap();
        assert_eq!(trials[0].state, TrialState::Complete);
        assert!(trials[0].param("x").is_some());
        assert_eq!(trials[0].attrs.best_iteration, Some(9));
    }

    #[test]
    fn failure_is_recorded_before_abort() {
        let study = study();
        let c = TrialCoordinator::new(
            study.clone(),
            Arc::new(Fixed(Err(Error::Storage("boom".into())))),
            FailurePolicy::AbortOnFailure,
        );
        assert!(c.run().is_err());
        let trials = study.trials().unwrap();
        assert_eq!(trials[0].state, TrialState::Failed);
        assert!(trials[0].attrs.fail_reason.as_deref().unwrap().contains("boom"));
        assert_eq!(trials[0].attrs.best_iteration, Some(9));
    }

    #[test]
    fn skip_policy_returns_failed_outcome() {
        let c = TrialCoordinator::new(
            study(),
            Arc::new(Fixed(Err(Error::Storage("boom".into())))),
            FailurePolicy::SkipAndContinue,
        );
        assert!(matches!(
            c.run().unwrap(),
            TrialOutcome::Failed { number: 0, .. }
        ));
    }

    #[test]
    fn non_finite_value_fails_the_trial() {
        let c = TrialCoordinator::new(
            study(),
            Arc::new(Fixed(Ok(f64::NAN))),
            FailurePolicy::AbortOnFailure,
        );
        assert!(matches!(c.run(), Err(Error::NonFiniteValue(_))));
    }

    /// Logs the hook calls it receives and always suggests the lower bound.
    #[derive(Default)]
    struct Recording(parking_lot::Mutex<Vec<String>>);

    impl Sampler for Recording {
        fn before_trial(&self, trial_number: u64, space: &[ParameterSpec], _: &[FrozenTrial]) {
            let names: Vec<&str> = space.iter().map(|s| s.name.as_str()).collect();
            self.0
                .lock()
                .push(format!("before {trial_number} {}", names.join(",")));
        }

        fn suggest(
            &self,
            trial_number: u64,
            name: &str,
            distribution: &FloatDistribution,
            _: &[FrozenTrial],
        ) -> f64 {
            self.0.lock().push(format!("suggest {trial_number} {name}"));
            distribution.low
        }

        fn after_trial(&self, trial_number: u64) {
            self.0.lock().push(format!("after {trial_number}"));
        }
    }

    #[test]
    fn sampler_sees_whole_space_before_suggesting() {
        let store: Arc<dyn StudyStore> = Arc::new(MemoryStore::new());
        let sampler = Arc::new(Recording::default());
        let study = Study::create("s", store, sampler.clone()).unwrap();
        TrialCoordinator::new(study, Arc::new(Fixed(Ok(1.0))), FailurePolicy::default())
            .run()
            .unwrap();
        assert_eq!(
            *sampler.0.lock(),
            ["before 0 x", "suggest 0 x", "after 0"]
        );
    }

    #[test]
    fn parses_policies() {
        assert_eq!(
            "skip".parse::<FailurePolicy>().unwrap(),
            FailurePolicy::SkipAndContinue
        );
        assert_eq!(
            "abort_on_failure".parse::<FailurePolicy>().unwrap(),
            FailurePolicy::AbortOnFailure
        );
        assert!("retry".parse::<FailurePolicy>().is_err());
    }
}
