//! Opens the configured study, runs it, and reports the best trial.

use core::fmt;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::TunerSettings;
use crate::error::{Error, Result};
use crate::evaluator::FfmObjective;
use crate::objective::Objective;
use crate::runner::RunSummary;
use crate::storage::StudyStore;
use crate::study::Study;
use crate::trial::FrozenTrial;

/// The best trial of a study, as printed at the end of a run.
#[derive(Clone, Debug, PartialEq)]
pub struct BestTrialReport {
    /// Trial number.
    pub number: u64,
    /// Sampled parameters.
    pub params: BTreeMap<String, f64>,
    /// Best validation loss.
    pub value: f64,
}

impl BestTrialReport {
    /// Builds a report from a complete trial.
    #[must_use]
    pub fn from_trial(trial: &FrozenTrial) -> Option<Self> {
        Some(Self {
            number: trial.number,
            params: trial.params.clone(),
            value: trial.completed_value()?,
        })
    }
}

impl fmt::Display for BestTrialReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "best_trial {}", self.number)?;
        write!(f, "best_params {{")?;
        for (i, (name, value)) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "\"{name}\": {value}")?;
        }
        writeln!(f, "}}")?;
        write!(f, "best_value {}", self.value)
    }
}

/// Wires settings to a store, a sampler and the trainer objective.
pub struct StudyDriver {
    settings: TunerSettings,
    store: Arc<dyn StudyStore>,
}

impl StudyDriver {
    /// Opens the configured store.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the settings are invalid or the
    /// storage URL cannot be parsed, or a store error if the store cannot be
    /// opened.
    pub fn new(settings: TunerSettings) -> Result<Self> {
        settings.validate()?;
        let url = settings.storage_url()?;
        tracing::debug!(storage = %url, "opening study store");
        let store = url.open()?;
        Ok(Self { settings, store })
    }

    /// Uses an already-open store instead of the configured one.
    #[must_use]
    pub fn with_store(settings: TunerSettings, store: Arc<dyn StudyStore>) -> Self {
        Self { settings, store }
    }

    /// Returns the settings.
    #[must_use]
    pub fn settings(&self) -> &TunerSettings {
        &self.settings
    }

    /// Returns the store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn StudyStore> {
        &self.store
    }

    /// Create the configured study.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyExists`] if the study exists.
    pub fn create_study(&self) -> Result<Study> {
        Study::create(
            self.settings.study_name.clone(),
            Arc::clone(&self.store),
            self.settings.sampler.build(),
        )
    }

    /// Open the configured study, creating it if `create_if_missing` is set.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the study does not exist and
    /// `create_if_missing` is off.
    pub fn open_study(&self) -> Result<Study> {
        let name = self.settings.study_name.clone();
        let store = Arc::clone(&self.store);
        let sampler = self.settings.sampler.build();
        if self.settings.create_if_missing {
            Study::create_or_load(name, store, sampler)
        } else {
            Study::load(name, store, sampler)
        }
    }

    /// Run the trainer objective and report the best trial.
    ///
    /// # Errors
    ///
    /// Returns the first trial failure under the abort policy, any store error,
    /// or [`Error::NoCompletedTrials`] if nothing has completed.
    pub async fn run(&self) -> Result<BestTrialReport> {
        let objective = Arc::new(FfmObjective::new(self.settings.trainer.clone())?);
        self.run_with(objective).await.map(|(_, report)| report)
    }

    /// Run `objective` on the configured study and report the best trial.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoCompletedTrials`] if nothing has completed, including
    /// in earlier runs, and otherwise the same errors as [`StudyDriver::run`].
    pub async fn run_with(
        &self,
        objective: Arc<dyn Objective>,
    ) -> Result<(RunSummary, BestTrialReport)> {
        let study = self.open_study()?;
        let summary = study.optimize(objective, self.settings.run_options()).await?;
        let report = best_report(&study)?;
        tracing::info!(
            number = report.number,
            value = report.value,
            "best trial"
        );
        Ok((summary, report))
    }

    /// Report the best trial of the configured study without running.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the study does not exist, or
    /// [`Error::NoCompletedTrials`] if no trial has completed.
    pub fn best_trial(&self) -> Result<BestTrialReport> {
        best_report(&self.open_existing()?)
    }

    /// All trials of the configured study.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the study does not exist.
    pub fn trials(&self) -> Result<Vec<FrozenTrial>> {
        self.open_existing()?.trials()
    }

    fn open_existing(&self) -> Result<Study> {
        Study::load(
            self.settings.study_name.clone(),
            Arc::clone(&self.store),
            self.settings.sampler.build(),
        )
    }
}

fn best_report(study: &Study) -> Result<BestTrialReport> {
    let best = study.best_trial()?;
    BestTrialReport::from_trial(&best).ok_or(Error::NoCompletedTrials)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_prints_three_lines() {
        let report = BestTrialReport {
            number: 1,
            params: BTreeMap::from([("eta".to_string(), 0.1), ("lambda".to_string(), 0.002)]),
            value: 0.3,
        };
        assert_eq!(
            report.to_string(),
            "best_trial 1\nbest_params {\"eta\": 0.1, \"lambda\": 0.002}\nbest_value 0.3"
        );
    }

    #[test]
    fn missing_study_is_not_found() {
        let settings = TunerSettings {
            storage: "memory".into(),
            ..TunerSettings::default()
        };
        let driver = StudyDriver::new(settings).unwrap();
        assert!(matches!(
            driver.best_trial(),
            Err(crate::Error::NotFound(_))
        ));
        driver.create_study().unwrap();
        assert!(matches!(
            driver.best_trial(),
            Err(crate::Error::NoCompletedTrials)
        ));
    }
}
