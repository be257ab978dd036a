//! Study storage backends.
//!
//! The [`StudyStore`] trait defines how studies and their trials are
//! persisted. A [`Study`](crate::Study) holds an `Arc<dyn StudyStore>` that
//! is shared by every worker of a parallel run.
//!
//! # Available backends
//!
//! | Backend | Description |
//! |---------|-------------|
//! | [`MemoryStore`] | `HashMap` behind a mutex; nothing survives the process |
//! | [`SqliteStore`] | `SQLite` database in WAL mode; safe across processes |
//! | [`JournalStore`] | JSONL operation log with `fs2` file locking |
//!
//! All backends issue trial numbers under a single writer: an in-process
//! mutex plus, for the file-backed stores, a database write transaction or an
//! exclusive file lock. Numbers are therefore contiguous and never reused,
//! even with several processes sharing one file.
//!
//! # Choosing a backend from a string
//!
//! ```
//! use ffm_tune::storage::StorageUrl;
//!
//! let url: StorageUrl = "sqlite:///db.sqlite3".parse().unwrap();
//! assert_eq!(url, StorageUrl::Sqlite("db.sqlite3".into()));
//! ```

mod journal;
mod memory;
mod sqlite;

use core::fmt;
use core::str::FromStr;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
pub use journal::JournalStore;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::error::{Error, Result};
use crate::trial::{FrozenTrial, TrialAttrs, TrialState, best_of};

/// Persistent record of named studies and their trials.
///
/// Implementations must be `Send + Sync`; every method may be called
/// concurrently from any worker without the caller holding a lock.
pub trait StudyStore: Send + Sync {
    /// Create an empty study.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyExists`] if the name is taken.
    fn create_study(&self, name: &str) -> Result<()>;

    /// Check that a study exists.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if it does not.
    fn load_study(&self, name: &str) -> Result<()>;

    /// Names of all studies, sorted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the backing store cannot be read.
    fn study_names(&self) -> Result<Vec<String>>;

    /// Atomically reserve the next trial number and record the trial as
    /// `Created`.
    ///
    /// The first trial of a study is numbered 0; later ones continue from the
    /// highest number ever issued, including by other processes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the study does not exist, or
    /// [`Error::Storage`] if the store cannot be written.
    fn allocate_trial(&self, study: &str) -> Result<u64>;

    /// Move a trial from `Created` to `Running` with its sampled parameters.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownTrial`] if the trial was never allocated, or
    /// [`Error::InvalidTransition`] if it is not `Created`.
    fn start_trial(&self, study: &str, number: u64, params: &BTreeMap<String, f64>) -> Result<()>;

    /// Persist the terminal state of a `Running` trial.
    ///
    /// `value` must be present (and finite) iff `state` is `Complete`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransition`] if the trial is not `Running` or
    /// `state` is not terminal, and [`Error::Storage`] if `value` does not
    /// match `state`.
    fn record(
        &self,
        study: &str,
        number: u64,
        state: TrialState,
        value: Option<f64>,
        attrs: &TrialAttrs,
    ) -> Result<()>;

    /// All trials of the study, ordered by number.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the study does not exist.
    fn trials(&self, study: &str) -> Result<Vec<FrozenTrial>>;

    /// Complete trials of the study, ordered by number.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the study does not exist.
    fn completed_trials(&self, study: &str) -> Result<Vec<FrozenTrial>> {
        let mut trials = self.trials(study)?;
        trials.retain(|t| t.state == TrialState::Complete);
        Ok(trials)
    }

    /// The complete trial with the lowest value; ties go to the lowest number.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoCompletedTrials`] if no trial has completed, or a
    /// store error.
    fn best_trial(&self, study: &str) -> Result<FrozenTrial> {
        let trials = self.trials(study)?;
        best_of(&trials).cloned().ok_or(Error::NoCompletedTrials)
    }
}

/// Where a study store lives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StorageUrl {
    /// `memory`
    Memory,
    /// `sqlite:///path/to/db.sqlite3`, or a bare path
    Sqlite(PathBuf),
    /// `journal:///path/to/study.jsonl`, or a bare path ending in `.jsonl`
    Journal(PathBuf),
}

impl StorageUrl {
    /// Open (creating if needed) the store this URL points at.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the `SQLite` database cannot be opened.
    pub fn open(&self) -> Result<Arc<dyn StudyStore>> {
        let store: Arc<dyn StudyStore> = match self {
            StorageUrl::Memory => Arc::new(MemoryStore::new()),
            StorageUrl::Sqlite(path) => Arc::new(SqliteStore::open(path)?),
            StorageUrl::Journal(path) => Arc::new(JournalStore::new(path)),
        };
        Ok(store)
    }
}

impl FromStr for StorageUrl {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::InvalidConfig("storage location is empty".into()));
        }
        if s == "memory" || s == "memory://" {
            return Ok(StorageUrl::Memory);
        }
        if let Some(path) = s.strip_prefix("sqlite:///") {
            return Ok(StorageUrl::Sqlite(PathBuf::from(path)));
        }
        if let Some(path) = s.strip_prefix("journal:///") {
            return Ok(StorageUrl::Journal(PathBuf::from(path)));
        }
        if s.contains("://") {
            return Err(Error::InvalidConfig(format!(
                "unsupported storage URL '{s}' (expected sqlite:///, journal:/// or memory)"
            )));
        }
        let path = PathBuf::from(s);
        if path.extension().is_some_and(|ext| ext == "jsonl") {
            Ok(StorageUrl::Journal(path))
        } else {
            Ok(StorageUrl::Sqlite(path))
        }
    }
}

impl fmt::Display for StorageUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageUrl::Memory => write!(f, "memory"),
            StorageUrl::Sqlite(p) => write!(f, "sqlite:///{}", p.display()),
            StorageUrl::Journal(p) => write!(f, "journal:///{}", p.display()),
        }
    }
}

fn check_transition(number: u64, from: TrialState, to: TrialState) -> Result<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(Error::InvalidTransition { number, from, to })
    }
}

fn check_value(number: u64, state: TrialState, value: Option<f64>) -> Result<()> {
    match (state, value) {
        (TrialState::Complete, Some(v)) if v.is_finite() => Ok(()),
        (TrialState::Complete, _) => Err(Error::Storage(format!(
            "complete trial {number} needs a finite value"
        ))),
        (_, Some(_)) => Err(Error::Storage(format!(
            "only complete trials carry a value (trial {number})"
        ))),
        (_, None) => Ok(()),
    }
}

/// Apply `Created -> Running` to an in-memory trial.
pub(crate) fn apply_start(
    trial: &mut FrozenTrial,
    params: &BTreeMap<String, f64>,
    at: DateTime<Utc>,
) -> Result<()> {
    check_transition(trial.number, trial.state, TrialState::Running)?;
    trial.state = TrialState::Running;
    trial.params.clone_from(params);
    trial.started_at = Some(at);
    Ok(())
}

/// Apply `Running -> Complete | Failed` to an in-memory trial.
pub(crate) fn apply_finish(
    trial: &mut FrozenTrial,
    state: TrialState,
    value: Option<f64>,
    attrs: &TrialAttrs,
    at: DateTime<Utc>,
) -> Result<()> {
    check_transition(trial.number, trial.state, state)?;
    check_value(trial.number, state, value)?;
    trial.state = state;
    trial.value = value;
    trial.attrs = attrs.clone();
    trial.completed_at = Some(at);
    Ok(())
}

/// Find trial `number` in a study's trial list, which is indexed by number.
pub(crate) fn trial_mut<'a>(
    trials: &'a mut [FrozenTrial],
    study: &str,
    number: u64,
) -> Result<&'a mut FrozenTrial> {
    usize::try_from(number)
        .ok()
        .and_then(|i| trials.get_mut(i))
        .filter(|t| t.number == number)
        .ok_or_else(|| Error::UnknownTrial {
            study: study.to_string(),
            number,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_storage_urls() {
        assert_eq!("memory".parse::<StorageUrl>().unwrap(), StorageUrl::Memory);
        assert_eq!(
            "sqlite:///db.sqlite3".parse::<StorageUrl>().unwrap(),
            StorageUrl::Sqlite("db.sqlite3".into())
        );
        assert_eq!(
            "sqlite:////tmp/abs.db".parse::<StorageUrl>().unwrap(),
            StorageUrl::Sqlite("/tmp/abs.db".into())
        );
        assert_eq!(
            "journal:///runs/ffm.jsonl".parse::<StorageUrl>().unwrap(),
            StorageUrl::Journal("runs/ffm.jsonl".into())
        );
        assert_eq!(
            "runs/ffm.jsonl".parse::<StorageUrl>().unwrap(),
            StorageUrl::Journal("runs/ffm.jsonl".into())
        );
        assert_eq!(
            "study.db".parse::<StorageUrl>().unwrap(),
            StorageUrl::Sqlite("study.db".into())
        );
        assert!("postgres://host/db".parse::<StorageUrl>().is_err());
        assert!("  ".parse::<StorageUrl>().is_err());
    }

    #[test]
    fn display_round_trips() {
        for url in [
            StorageUrl::Memory,
            StorageUrl::Sqlite("a/b.db".into()),
            StorageUrl::Journal("c.jsonl".into()),
        ] {
            assert_eq!(url.to_string().parse::<StorageUrl>().unwrap(), url);
        }
    }

    #[test]
    fn finish_requires_running_and_matching_value() {
        let now = Utc::now();
        let mut t = FrozenTrial::created(0);
        let attrs = TrialAttrs::default();
        assert!(matches!(
            apply_finish(&mut t, TrialState::Complete, Some(1.0), &attrs, now),
            Err(Error::InvalidTransition { .. })
        ));
        apply_start(&mut t, &BTreeMap::new(), now).unwrap();
        assert!(apply_finish(&mut t, TrialState::Complete, None, &attrs, now).is_err());
        assert!(apply_finish(&mut t, TrialState::Complete, Some(f64::NAN), &attrs, now).is_err());
        assert!(apply_finish(&mut t, TrialState::Failed, Some(1.0), &attrs, now).is_err());
        apply_finish(&mut t, TrialState::Complete, Some(0.5), &attrs, now).unwrap();
        assert!(matches!(
            apply_finish(&mut t, TrialState::Failed, None, &attrs, now),
            Err(Error::InvalidTransition { .. })
        ));
        assert_eq!(t.value, Some(0.5));
    }
}
