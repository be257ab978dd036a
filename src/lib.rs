#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![deny(unreachable_pub)]
#![deny(clippy::correctness)]
#![deny(clippy::suspicious)]
#![deny(clippy::style)]
#![deny(clippy::complexity)]
#![deny(clippy::perf)]
#![deny(clippy::pedantic)]
#![deny(clippy::std_instead_of_core)]

//! Resumable, parallel hyperparameter search for `ffm-train`, a field-aware
//! factorization machine trainer.
//!
//! Each trial samples a regularization strength `lambda` and a learning rate
//! `eta`, launches the trainer as an external process, and reads the best
//! validation loss from the JSON result file the trainer writes. Trials are
//! recorded in a persistent store so an interrupted study can be resumed, and
//! several workers (or several processes sharing one store) can run trials
//! at once.
//!
//! # Getting Started
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use ffm_tune::evaluator::{FfmObjective, TrainerConfig};
//! use ffm_tune::sampler::GpSampler;
//! use ffm_tune::storage::SqliteStore;
//! use ffm_tune::{RunOptions, Study};
//!
//! # #[tokio::main]
//! # async fn main() -> ffm_tune::Result<()> {
//! let store = Arc::new(SqliteStore::open("db.sqlite3")?);
//! let study = Study::create_or_load("ffm-gp", store, Arc::new(GpSampler::new()))?;
//! let objective = Arc::new(FfmObjective::new(TrainerConfig::default())?);
//!
//! study.optimize(objective, RunOptions::new(64)).await?;
//! println!("best value {}", study.best_value()?);
//! # Ok(())
//! # }
//! ```
//!
//! # Core Concepts
//!
//! | Type | Role |
//! |------|------|
//! | [`Study`] | A named minimization study; runs trials and reports the best one. |
//! | [`Objective`] | The function being minimized; declares its search space. |
//! | [`Trial`] | A running trial as seen by the objective: number, parameters, attributes. |
//! | [`FrozenTrial`] | A trial as recorded in the store. |
//! | [`Sampler`](sampler::Sampler) | Proposes parameter values from the trial history. |
//! | [`StudyStore`](storage::StudyStore) | Persists studies and trials. |
//!
//! # Samplers
//!
//! | Sampler | Algorithm |
//! |---------|-----------|
//! | [`GpSampler`](sampler::GpSampler) | Gaussian process + expected improvement |
//! | [`RandomSampler`](sampler::RandomSampler) | Independent (log-)uniform draws |
//!
//! # Storage
//!
//! | Backend | Shared across processes |
//! |---------|-------------------------|
//! | [`MemoryStore`](storage::MemoryStore) | no |
//! | [`SqliteStore`](storage::SqliteStore) | yes |
//! | [`JournalStore`](storage::JournalStore) | yes |

pub mod cli;
pub mod config;
pub mod coordinator;
mod distribution;
pub mod driver;
mod error;
pub mod evaluator;
pub mod objective;
pub mod result;
pub mod runner;
pub mod sampler;
pub mod storage;
mod study;
mod trial;

pub use coordinator::{FailurePolicy, TrialCoordinator, TrialOutcome};
pub use distribution::{FloatDistribution, ParameterSpec};
pub use error::{Error, Result};
pub use objective::Objective;
pub use runner::RunSummary;
pub use study::{RunOptions, Study};
pub use trial::{FrozenTrial, Trial, TrialAttrs, TrialState};

/// Convenient wildcard import for the most common types.
///
/// ```
/// use ffm_tune::prelude::*;
/// ```
pub mod prelude {
    pub use crate::coordinator::FailurePolicy;
    pub use crate::distribution::{FloatDistribution, ParameterSpec};
    pub use crate::error::{Error, Result};
    pub use crate::evaluator::{ExitStatusPolicy, FfmObjective, TrainerConfig};
    pub use crate::objective::Objective;
    pub use crate::sampler::{GpSampler, RandomSampler, Sampler};
    pub use crate::storage::{JournalStore, MemoryStore, SqliteStore, StorageUrl, StudyStore};
    pub use crate::study::{RunOptions, Study};
    pub use crate::trial::{FrozenTrial, Trial, TrialAttrs, TrialState};
}
