//! Layered configuration for a tuning run.
//!
//! Precedence (lowest to highest):
//! 1. Programmatic defaults ([`TunerSettings::default`])
//! 2. An optional YAML file
//! 3. Environment variables prefixed `FFM_TUNE_`, nested with `__`
//!    (`FFM_TUNE_TRAINER__PROGRAM=/opt/ffm-train`)
//! 4. Command-line flags, applied by the binary

use std::path::Path;
use std::sync::Arc;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Yaml};
use serde::{Deserialize, Serialize};

use crate::coordinator::FailurePolicy;
use crate::error::{Error, Result};
use crate::evaluator::TrainerConfig;
use crate::runner::default_n_jobs;
use crate::sampler::{GpSampler, RandomSampler, Sampler};
use crate::storage::StorageUrl;
use crate::study::RunOptions;

/// Prefix of the environment variables read by [`TunerSettings::load`].
pub const ENV_PREFIX: &str = "FFM_TUNE_";

/// Which sampler proposes new trials.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplerKind {
    /// Gaussian-process Bayesian optimization.
    #[default]
    Gp,
    /// Independent log-uniform draws.
    Random,
}

/// Sampler configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerSettings {
    /// Sampler algorithm.
    pub kind: SamplerKind,
    /// Fixed seed; random when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    /// Random trials before the GP takes over.
    pub n_startup_trials: usize,
    /// Candidates scored per GP proposal.
    pub n_candidates: usize,
}

impl Default for SamplerSettings {
    fn default() -> Self {
        Self {
            kind: SamplerKind::Gp,
            seed: None,
            n_startup_trials: 10,
            n_candidates: 1000,
        }
    }
}

impl SamplerSettings {
    /// Build the configured sampler.
    #[must_use]
    pub fn build(&self) -> Arc<dyn Sampler> {
        match self.kind {
            SamplerKind::Gp => {
                let mut builder = GpSampler::builder()
                    .n_startup_trials(self.n_startup_trials)
                    .n_candidates(self.n_candidates);
                if let Some(seed) = self.seed {
                    builder = builder.seed(seed);
                }
                Arc::new(builder.build())
            }
            SamplerKind::Random => match self.seed {
                Some(seed) => Arc::new(RandomSampler::with_seed(seed)),
                None => Arc::new(RandomSampler::new()),
            },
        }
    }
}

/// Everything a tuning run needs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunerSettings {
    /// Study name, the persistence key.
    pub study_name: String,
    /// Storage location, see [`StorageUrl`].
    pub storage: String,
    /// Trials to start per run.
    pub n_trials: usize,
    /// Concurrent workers; defaults to cores - 1.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n_jobs: Option<usize>,
    /// What to do after a failed trial.
    pub failure_policy: FailurePolicy,
    /// Create the study on `optimize` if it does not exist.
    pub create_if_missing: bool,
    /// Sampler configuration.
    pub sampler: SamplerSettings,
    /// Trainer invocation and parameter ranges.
    pub trainer: TrainerConfig,
}

impl Default for TunerSettings {
    fn default() -> Self {
        Self {
            study_name: "dynalyst-ffm-gp".to_string(),
            storage: "sqlite:///db.sqlite3".to_string(),
            n_trials: 256,
            n_jobs: None,
            failure_policy: FailurePolicy::AbortOnFailure,
            create_if_missing: false,
            sampler: SamplerSettings::default(),
            trainer: TrainerConfig::default(),
        }
    }
}

impl TunerSettings {
    /// Defaults, then `config_file` (if any), then the environment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `config_file` is given but does not
    /// exist.
    pub fn figment(config_file: Option<&Path>) -> Result<Figment> {
        let mut figment = Figment::new().merge(Serialized::defaults(TunerSettings::default()));
        if let Some(path) = config_file {
            if !path.is_file() {
                return Err(Error::InvalidConfig(format!(
                    "config file {} not found",
                    path.display()
                )));
            }
            figment = figment.merge(Yaml::file(path));
        }
        Ok(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    /// Extract and validate settings from `figment`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if a layer cannot be parsed or the
    /// merged settings fail [`TunerSettings::validate`].
    pub fn from_figment(figment: &Figment) -> Result<Self> {
        let settings: Self = figment
            .extract()
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from the default layers.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the file is missing, a layer cannot
    /// be parsed, or the settings are invalid.
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        Self::from_figment(&Self::figment(config_file)?)
    }

    /// Reject settings that cannot produce a run.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for an empty study name, a bad storage
    /// URL, zero counts, or invalid trainer settings.
    pub fn validate(&self) -> Result<()> {
        if self.study_name.trim().is_empty() {
            return Err(Error::InvalidConfig("study_name is empty".into()));
        }
        self.storage_url()?;
        if self.n_trials == 0 {
            return Err(Error::InvalidConfig("n_trials must be at least 1".into()));
        }
        if self.n_jobs == Some(0) {
            return Err(Error::InvalidConfig("n_jobs must be at least 1".into()));
        }
        if self.sampler.n_candidates == 0 {
            return Err(Error::InvalidConfig(
                "sampler.n_candidates must be at least 1".into(),
            ));
        }
        self.trainer.validate()
    }

    /// Parsed storage location.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `storage` is not a recognised URL.
    pub fn storage_url(&self) -> Result<StorageUrl> {
        self.storage.parse()
    }

    /// Worker count, falling back to [`default_n_jobs`].
    #[must_use]
    pub fn n_jobs(&self) -> usize {
        self.n_jobs.unwrap_or_else(default_n_jobs)
    }

    /// Options for [`Study::optimize`](crate::Study::optimize).
    #[must_use]
    pub fn run_options(&self) -> RunOptions {
        RunOptions::new(self.n_trials)
            .n_jobs(self.n_jobs())
            .failure_policy(self.failure_policy)
    }
}
