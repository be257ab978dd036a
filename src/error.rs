use std::path::PathBuf;

use crate::trial::TrialState;

/// Errors returned by studies, stores, samplers and the trainer objective.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Returned when the lower bound is not strictly less than the upper bound.
    #[error("invalid bounds: low ({low}) must be less than high ({high})")]
    InvalidBounds {
        /// The lower bound value.
        low: f64,
        /// The upper bound value.
        high: f64,
    },

    /// Returned when a log-scale distribution has a non-positive lower bound.
    #[error("invalid log bounds: low ({0}) must be positive for log scale")]
    InvalidLogBounds(f64),

    /// Returned when creating a study whose name is already taken.
    #[error("study '{0}' already exists")]
    AlreadyExists(String),

    /// Returned when loading a study that does not exist.
    #[error("study '{0}' not found")]
    NotFound(String),

    /// Returned when a trial number is not known to the study.
    #[error("trial {number} not found in study '{study}'")]
    UnknownTrial {
        /// The study name.
        study: String,
        /// The trial number that was looked up.
        number: u64,
    },

    /// Returned when a trial is moved to a state its current state cannot reach.
    #[error("trial {number} cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        /// The trial number.
        number: u64,
        /// The state the trial is in.
        from: TrialState,
        /// The requested state.
        to: TrialState,
    },

    /// Returned when requesting the best trial but no trials have completed.
    #[error("no completed trials available")]
    NoCompletedTrials,

    /// Returned when the trainer's result file lacks a required field.
    #[error("result file {path} is missing required field '{field}'")]
    MissingResultField {
        /// Path of the result file.
        path: PathBuf,
        /// The missing field name.
        field: &'static str,
    },

    /// Returned when a required result field has the wrong type or range.
    #[error("result file {path} has invalid field '{field}': {reason}")]
    InvalidResultField {
        /// Path of the result file.
        path: PathBuf,
        /// The offending field name.
        field: &'static str,
        /// What was wrong with it.
        reason: String,
    },

    /// Returned when the result file cannot be read or is not a JSON object.
    #[error("cannot read result file {path}: {reason}")]
    ResultArtifact {
        /// Path of the result file.
        path: PathBuf,
        /// The underlying I/O or parse failure.
        reason: String,
    },

    /// Returned when the external trainer cannot be started.
    #[error("failed to launch '{program}': {source}")]
    ExternalProcessLaunch {
        /// The program that was invoked.
        program: String,
        /// The underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// Returned in strict mode when the trainer exits unsuccessfully.
    #[error("trainer exited with {status}")]
    TrainerExitStatus {
        /// Human-readable exit status.
        status: String,
    },

    /// Returned when an objective produces NaN or an infinite value.
    #[error("objective value {0} is not finite")]
    NonFiniteValue(f64),

    /// Returned when a storage operation fails.
    #[error("storage error: {0}")]
    Storage(String),

    /// Returned when configuration is rejected.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Returned when a worker task fails to join.
    #[error("worker task error: {0}")]
    TaskError(String),
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

pub type Result<T> = core::result::Result<T, Error>;
