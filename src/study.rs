//! A named, persistent optimization study.

use core::fmt;
use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::Instrument;

use crate::coordinator::{FailurePolicy, TrialCoordinator};
use crate::error::{Error, Result};
use crate::objective::Objective;
use crate::runner::{ParallelRunner, RunSummary, default_n_jobs};
use crate::sampler::Sampler;
use crate::storage::StudyStore;
use crate::trial::FrozenTrial;

/// Settings for one [`Study::optimize`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RunOptions {
    /// Number of trials to start in this run.
    pub n_trials: usize,
    /// Number of concurrent workers.
    pub n_jobs: usize,
    /// What to do after a failed trial.
    pub failure_policy: FailurePolicy,
}

impl RunOptions {
    /// `n_trials` trials on [`default_n_jobs`] workers, aborting on failure.
    #[must_use]
    pub fn new(n_trials: usize) -> Self {
        Self {
            n_trials,
            n_jobs: default_n_jobs(),
            failure_policy: FailurePolicy::default(),
        }
    }

    /// Sets the worker count.
    #[must_use]
    pub fn n_jobs(mut self, n_jobs: usize) -> Self {
        self.n_jobs = n_jobs;
        self
    }

    /// Sets the failure policy.
    #[must_use]
    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }
}

/// A minimization study: a name in a [`StudyStore`] plus the [`Sampler`]
/// used to propose new trials.
///
/// All state lives in the store, so a `Study` is a cheap handle. Cloning it
/// shares the same store and sampler. Several processes may open the same
/// study in a shared file-backed store and optimize it at once.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
///
/// use ffm_tune::Study;
/// use ffm_tune::sampler::RandomSampler;
/// use ffm_tune::storage::MemoryStore;
///
/// let store = Arc::new(MemoryStore::new());
/// let study = Study::create("demo", store.clone(), Arc::new(RandomSampler::new())).unwrap();
/// assert_eq!(study.name(), "demo");
/// assert!(Study::create("demo", store, Arc::new(RandomSampler::new())).is_err());
/// ```
#[derive(Clone)]
pub struct Study {
    name: String,
    store: Arc<dyn StudyStore>,
    sampler: Arc<dyn Sampler>,
}

impl fmt::Debug for Study {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Study").field("name", &self.name).finish_non_exhaustive()
    }
}

impl Study {
    /// Create a new, empty study.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyExists`] if the name is taken.
    pub fn create(
        name: impl Into<String>,
        store: Arc<dyn StudyStore>,
        sampler: Arc<dyn Sampler>,
    ) -> Result<Self> {
        let name = name.into();
        store.create_study(&name)?;
        tracing::info!(study = %name, "created study");
        Ok(Self {
            name,
            store,
            sampler,
        })
    }

    /// Open an existing study.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the study does not exist.
    pub fn load(
        name: impl Into<String>,
        store: Arc<dyn StudyStore>,
        sampler: Arc<dyn Sampler>,
    ) -> Result<Self> {
        let name = name.into();
        store.load_study(&name)?;
        Ok(Self {
            name,
            store,
            sampler,
        })
    }

    /// Open the study, creating it first if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns store errors other than [`Error::AlreadyExists`].
    pub fn create_or_load(
        name: impl Into<String>,
        store: Arc<dyn StudyStore>,
        sampler: Arc<dyn Sampler>,
    ) -> Result<Self> {
        let name = name.into();
        match store.create_study(&name) {
            Ok(()) => tracing::info!(study = %name, "created study"),
            // Another process may have created it in between.
            Err(Error::AlreadyExists(_)) => store.load_study(&name)?,
            Err(e) => return Err(e),
        }
        Ok(Self {
            name,
            store,
            sampler,
        })
    }

    /// Returns the study name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the backing store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn StudyStore> {
        &self.store
    }

    /// Returns the sampler.
    #[must_use]
    pub fn sampler(&self) -> &Arc<dyn Sampler> {
        &self.sampler
    }

    /// All trials, ordered by number.
    ///
    /// # Errors
    ///
    /// Returns store errors.
    pub fn trials(&self) -> Result<Vec<FrozenTrial>> {
        self.store.trials(&self.name)
    }

    /// Number of trials ever allocated in this study.
    ///
    /// # Errors
    ///
    /// Returns store errors.
    pub fn n_trials(&self) -> Result<usize> {
        Ok(self.trials()?.len())
    }

    /// The complete trial with the lowest value, ties going to the lowest
    /// number.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoCompletedTrials`] if no trial has completed.
    pub fn best_trial(&self) -> Result<FrozenTrial> {
        self.store.best_trial(&self.name)
    }

    /// The lowest value among complete trials.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoCompletedTrials`] if no trial has completed.
    pub fn best_value(&self) -> Result<f64> {
        self.best_trial()?.value.ok_or(Error::NoCompletedTrials)
    }

    /// The parameters of the best trial.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoCompletedTrials`] if no trial has completed.
    pub fn best_params(&self) -> Result<BTreeMap<String, f64>> {
        Ok(self.best_trial()?.params)
    }

    /// Run `options.n_trials` more trials of `objective` on
    /// `options.n_jobs` workers.
    ///
    /// Trial numbers continue after any already in the store. With
    /// [`FailurePolicy::AbortOnFailure`] the first failure stops the run and
    /// is returned once in-flight trials have been recorded.
    ///
    /// Must be called from within a multi-threaded tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns the first failure under [`FailurePolicy::AbortOnFailure`], store
    /// errors, and [`Error::TaskError`] if a worker panics.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::sync::Arc;
    ///
    /// use ffm_tune::sampler::RandomSampler;
    /// use ffm_tune::storage::MemoryStore;
    /// use ffm_tune::{FloatDistribution, Objective, ParameterSpec, RunOptions, Study, Trial};
    ///
    /// struct Square;
    ///
    /// impl Objective for Square {
    ///     fn search_space(&self) -> Vec<ParameterSpec> {
    ///         vec![ParameterSpec::new("x", FloatDistribution::uniform(-1.0, 1.0).unwrap())]
    ///     }
    ///
    ///     fn evaluate(&self, trial: &mut Trial) -> ffm_tune::Result<f64> {
    ///         Ok(trial.param("x").unwrap_or_default().powi(2))
    ///     }
    /// }
    ///
    /// # #[tokio::main]
    /// # async fn main() -> ffm_tune::Result<()> {
    /// let study = Study::create("square", Arc::new(MemoryStore::new()), Arc::new(RandomSampler::new()))?;
    /// let summary = study.optimize(Arc::new(Square), RunOptions::new(8).n_jobs(2)).await?;
    /// assert_eq!(summary.completed, 8);
    /// assert!(study.best_value()? <= 1.0);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn optimize(
        &self,
        objective: Arc<dyn Objective>,
        options: RunOptions,
    ) -> Result<RunSummary> {
        let span = tracing::info_span!(
            "optimize",
            study = %self.name,
            n_trials = options.n_trials,
            n_jobs = options.n_jobs
        );
        async move {
            tracing::info!(policy = %options.failure_policy, "starting optimization");
            let coordinator =
                TrialCoordinator::new(self.clone(), objective, options.failure_policy);
            let summary = ParallelRunner::new(options.n_jobs)
                .run(coordinator, options.n_trials)
                .await?;
            tracing::info!(
                completed = summary.completed,
                failed = summary.failed,
                "optimization finished"
            );
            Ok(summary)
        }
        .instrument(span)
        .await
    }
}
