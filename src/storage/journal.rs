//! JSONL-based journal storage backend.

use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::{StudyStore, apply_finish, apply_start, trial_mut};
use crate::error::{Error, Result};
use crate::trial::{FrozenTrial, TrialAttrs, TrialState};

/// One line of the journal.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum JournalOp {
    CreateStudy {
        study: String,
        at: DateTime<Utc>,
    },
    Allocate {
        study: String,
        number: u64,
    },
    Start {
        study: String,
        number: u64,
        params: BTreeMap<String, f64>,
        at: DateTime<Utc>,
    },
    Finish {
        study: String,
        number: u64,
        state: TrialState,
        value: Option<f64>,
        attrs: TrialAttrs,
        at: DateTime<Utc>,
    },
}

/// State rebuilt by replaying the journal.
#[derive(Default)]
struct Replay {
    studies: HashMap<String, Vec<FrozenTrial>>,
    /// Byte length of the journal without a skipped torn line, if one was
    /// skipped.
    torn_at: Option<usize>,
}

impl Replay {
    fn study_mut(&mut self, name: &str) -> Result<&mut Vec<FrozenTrial>> {
        self.studies
            .get_mut(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    fn study(&self, name: &str) -> Result<&Vec<FrozenTrial>> {
        self.studies
            .get(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    /// Apply `op`, validating it the same way a live store would.
    fn apply(&mut self, op: &JournalOp) -> Result<()> {
        match op {
            JournalOp::CreateStudy { study, .. } => {
                if self.studies.contains_key(study) {
                    return Err(Error::AlreadyExists(study.clone()));
                }
                self.studies.insert(study.clone(), Vec::new());
                Ok(())
            }
            JournalOp::Allocate { study, number } => {
                let trials = self.study_mut(study)?;
                let expected = trials.last().map_or(0, |t| t.number + 1);
                if *number != expected {
                    return Err(Error::Storage(format!(
                        "journal allocates trial {number} but {expected} is next"
                    )));
                }
                trials.push(FrozenTrial::created(*number));
                Ok(())
            }
            JournalOp::Start {
                study,
                number,
                params,
                at,
            } => {
                let trials = self.study_mut(study)?;
                apply_start(trial_mut(trials, study, *number)?, params, *at)
            }
            JournalOp::Finish {
                study,
                number,
                state,
                value,
                attrs,
                at,
            } => {
                let trials = self.study_mut(study)?;
                apply_finish(trial_mut(trials, study, *number)?, *state, *value, attrs, *at)
            }
        }
    }
}

/// Parse journal text. A final line without a newline is a torn write from a
/// crashed process and is skipped if it does not parse.
fn replay(text: &str) -> Result<Replay> {
    let mut state = Replay::default();
    let torn_tail = !text.is_empty() && !text.ends_with('\n');
    let lines: Vec<&str> = text.lines().collect();
    for (i, line) in lines.iter().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let op: JournalOp = match serde_json::from_str(line) {
            Ok(op) => op,
            Err(e) if torn_tail && i + 1 == lines.len() => {
                tracing::warn!(error = %e, "ignoring torn journal line");
                state.torn_at = Some(text.rfind('\n').map_or(0, |at| at + 1));
                continue;
            }
            Err(e) => return Err(Error::Storage(format!("journal line {}: {e}", i + 1))),
        };
        state.apply(&op)?;
    }
    Ok(state)
}

fn io_err(e: &std::io::Error) -> Error {
    Error::Storage(e.to_string())
}

/// A study store that appends every operation as a JSON line to a file.
///
/// The current state is rebuilt by replaying the file on each call, so
/// several processes can share one journal. Writes hold an exclusive file
/// lock across read-validate-append, which makes trial-number allocation
/// atomic; reads take a shared lock. Each append is synced to disk before
/// the lock is released. A torn final line left by a crashed writer is
/// ignored by readers and cut off by the next write.
///
/// # Examples
///
/// ```no_run
/// use ffm_tune::storage::{JournalStore, StudyStore};
///
/// let store = JournalStore::new("ffm-study.jsonl");
/// store.create_study("ffm-gp").unwrap();
/// ```
pub struct JournalStore {
    path: PathBuf,
    /// Serialise in-process writes so we only hold the file lock briefly.
    write_lock: Mutex<()>,
}

impl JournalStore {
    /// Creates a journal store backed by `path`.
    ///
    /// The file is created on the first write.
    #[must_use]
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    /// Path of the journal file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replay the journal under a shared lock.
    fn read(&self) -> Result<Replay> {
        let mut file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Replay::default()),
            Err(e) => return Err(io_err(&e)),
        };
        FileExt::lock_shared(&file).map_err(|e| io_err(&e))?;
        let mut text = String::new();
        let read = file.read_to_string(&mut text);
        FileExt::unlock(&file).map_err(|e| io_err(&e))?;
        read.map_err(|e| io_err(&e))?;
        replay(&text)
    }

    /// Under the exclusive lock, replay the journal, let `f` derive the next
    /// operation, validate it and append it.
    fn append<T>(&self, f: impl FnOnce(&Replay) -> Result<(JournalOp, T)>) -> Result<T> {
        let _guard = self.write_lock.lock();

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| io_err(&e))?;
        FileExt::lock_exclusive(&file).map_err(|e| io_err(&e))?;

        let result = Self::append_locked(&mut file, f);

        FileExt::unlock(&file).map_err(|e| io_err(&e))?;
        result
    }

    fn append_locked<T>(
        file: &mut File,
        f: impl FnOnce(&Replay) -> Result<(JournalOp, T)>,
    ) -> Result<T> {
        let mut text = String::new();
        file.read_to_string(&mut text).map_err(|e| io_err(&e))?;
        let mut state = replay(&text)?;

        let (op, out) = f(&state)?;
        state.apply(&op)?;

        let mut line = String::new();
        if let Some(len) = state.torn_at {
            // Cut the torn line so it never ends up in the middle of the file.
            let len = u64::try_from(len).map_err(|e| Error::Storage(e.to_string()))?;
            file.set_len(len).map_err(|e| io_err(&e))?;
            tracing::warn!(len, "truncated torn journal line");
        } else if !text.is_empty() && !text.ends_with('\n') {
            line.push('\n');
        }
        line.push_str(&serde_json::to_string(&op)?);
        line.push('\n');
        file.write_all(line.as_bytes()).map_err(|e| io_err(&e))?;
        file.sync_data().map_err(|e| io_err(&e))?;
        Ok(out)
    }
}

impl StudyStore for JournalStore {
    fn create_study(&self, name: &str) -> Result<()> {
        self.append(|_| {
            let op = JournalOp::CreateStudy {
                study: name.to_string(),
                at: Utc::now(),
            };
            Ok((op, ()))
        })
    }

    fn load_study(&self, name: &str) -> Result<()> {
        self.read()?.study(name).map(|_| ())
    }

    fn study_names(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.read()?.studies.into_keys().collect();
        names.sort();
        Ok(names)
    }

    fn allocate_trial(&self, study: &str) -> Result<u64> {
        self.append(|state| {
            let number = state.study(study)?.last().map_or(0, |t| t.number + 1);
            let op = JournalOp::Allocate {
                study: study.to_string(),
                number,
            };
            Ok((op, number))
        })
    }

    fn start_trial(&self, study: &str, number: u64, params: &BTreeMap<String, f64>) -> Result<()> {
        self.append(|_| {
            let op = JournalOp::Start {
                study: study.to_string(),
                number,
                params: params.clone(),
                at: Utc::now(),
            };
            Ok((op, ()))
        })
    }

    fn record(
        &self,
        study: &str,
        number: u64,
        state: TrialState,
        value: Option<f64>,
        attrs: &TrialAttrs,
    ) -> Result<()> {
        self.append(|_| {
            let op = JournalOp::Finish {
                study: study.to_string(),
                number,
                state,
                value,
                attrs: attrs.clone(),
                at: Utc::now(),
            };
            Ok((op, ()))
        })
    }

    fn trials(&self, study: &str) -> Result<Vec<FrozenTrial>> {
        self.read()?
            .studies
            .remove(study)
            .ok_or_else(|| Error::NotFound(study.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replay_skips_torn_final_line() {
        let text = concat!(
            r#"{"op":"create_study","study":"s","at":"2024-01-01T00:00:00Z"}"#,
            "\n",
            r#"{"op":"allocate","study":"s","number":0}"#,
            "\n",
            r#"{"op":"allocate","study":"s","num"#,
        );
        let state = replay(text).unwrap();
        assert_eq!(state.study("s").unwrap().len(), 1);
        assert_eq!(state.torn_at, Some(text.rfind('\n').unwrap() + 1));
    }

    #[test]
    fn replay_keeps_complete_final_line_without_newline() {
        let text = concat!(
            r#"{"op":"create_study","study":"s","at":"2024-01-01T00:00:00Z"}"#,
            "\n",
            r#"{"op":"allocate","study":"s","number":0}"#,
        );
        let state = replay(text).unwrap();
        assert_eq!(state.study("s").unwrap().len(), 1);
        assert_eq!(state.torn_at, None);
    }

    #[test]
    fn replay_rejects_corruption_in_the_middle() {
        let text = concat!(
            r#"{"op":"create_study","study":"s","at":"2024-01-01T00:00:00Z"}"#,
            "\n",
            "not json\n",
            r#"{"op":"allocate","study":"s","number":0}"#,
            "\n",
        );
        assert!(matches!(replay(text), Err(Error::Storage(_))));
    }

    #[test]
    fn replay_rejects_out_of_order_allocation() {
        let text = concat!(
            r#"{"op":"create_study","study":"s","at":"2024-01-01T00:00:00Z"}"#,
            "\n",
            r#"{"op":"allocate","study":"s","number":1}"#,
            "\n",
        );
        assert!(replay(text).is_err());
    }
}
