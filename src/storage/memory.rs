//! In-memory storage backend.

use std::collections::{BTreeMap, HashMap};

use chrono::Utc;
use parking_lot::Mutex;

use super::{StudyStore, apply_finish, apply_start, trial_mut};
use crate::error::{Error, Result};
use crate::trial::{FrozenTrial, TrialAttrs, TrialState};

/// In-memory study store.
///
/// Studies live in a `HashMap` behind one mutex, so every operation is
/// serialized. Useful for tests and throwaway runs.
pub struct MemoryStore {
    studies: Mutex<HashMap<String, Vec<FrozenTrial>>>,
}

impl MemoryStore {
    /// Creates a new, empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            studies: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn not_found(name: &str) -> Error {
    Error::NotFound(name.to_string())
}

impl StudyStore for MemoryStore {
    fn create_study(&self, name: &str) -> Result<()> {
        let mut studies = self.studies.lock();
        if studies.contains_key(name) {
            return Err(Error::AlreadyExists(name.to_string()));
        }
        studies.insert(name.to_string(), Vec::new());
        Ok(())
    }

    fn load_study(&self, name: &str) -> Result<()> {
        if self.studies.lock().contains_key(name) {
            Ok(())
        } else {
            Err(not_found(name))
        }
    }

    fn study_names(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.studies.lock().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn allocate_trial(&self, study: &str) -> Result<u64> {
        let mut studies = self.studies.lock();
        let trials = studies.get_mut(study).ok_or_else(|| not_found(study))?;
        let number = trials.last().map_or(0, |t| t.number + 1);
        trials.push(FrozenTrial::created(number));
        Ok(number)
    }

    fn start_trial(&self, study: &str, number: u64, params: &BTreeMap<String, f64>) -> Result<()> {
        let mut studies = self.studies.lock();
        let trials = studies.get_mut(study).ok_or_else(|| not_found(study))?;
        apply_start(trial_mut(trials, study, number)?, params, Utc::now())
    }

    fn record(
        &self,
        study: &str,
        number: u64,
        state: TrialState,
        value: Option<f64>,
        attrs: &TrialAttrs,
    ) -> Result<()> {
        let mut studies = self.studies.lock();
        let trials = studies.get_mut(study).ok_or_else(|| not_found(study))?;
        apply_finish(
            trial_mut(trials, study, number)?,
            state,
            value,
            attrs,
            Utc::now(),
        )
    }

    fn trials(&self, study: &str) -> Result<Vec<FrozenTrial>> {
        self.studies
            .lock()
            .get(study)
            .cloned()
            .ok_or_else(|| not_found(study))
    }
}
