//! Reader and writer for the per-trial JSON result file written by `ffm-train`
//! (`--json-meta`).

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

use crate::error::{Error, Result};

const BEST_ITERATION: &str = "best_iteration";
const BEST_VA_LOSS: &str = "best_va_loss";

/// Result of one trainer run.
#[derive(Clone, Debug, PartialEq)]
pub struct ExternalResult {
    /// Iteration with the lowest validation loss.
    pub best_iteration: u64,
    /// Lowest validation loss; the trial's objective value.
    pub best_va_loss: f64,
    /// Every other top-level field, passed through unvalidated.
    pub extra: Map<String, Value>,
}

impl ExternalResult {
    /// A result with no extra fields.
    #[must_use]
    pub fn new(best_iteration: u64, best_va_loss: f64) -> Self {
        Self {
            best_iteration,
            best_va_loss,
            extra: Map::new(),
        }
    }

    /// Read and validate the result file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResultArtifact`] if the file cannot be read or is not a
    /// JSON object, [`Error::MissingResultField`] if a required field is
    /// absent, and [`Error::InvalidResultField`] if one has the wrong type.
    pub fn read(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| Error::ResultArtifact {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::parse(&text, path)
    }

    /// Parse result JSON; `path` is only used in error messages.
    ///
    /// # Errors
    ///
    /// Same as [`ExternalResult::read`], minus the I/O failure.
    pub fn parse(text: &str, path: &Path) -> Result<Self> {
        let value: Value = serde_json::from_str(text).map_err(|e| Error::ResultArtifact {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let Value::Object(mut fields) = value else {
            return Err(Error::ResultArtifact {
                path: path.to_path_buf(),
                reason: "top-level value is not an object".to_string(),
            });
        };

        let iteration = take_field(&mut fields, BEST_ITERATION, path)?;
        let loss = take_field(&mut fields, BEST_VA_LOSS, path)?;

        let best_iteration = iteration.as_u64().ok_or_else(|| Error::InvalidResultField {
            path: path.to_path_buf(),
            field: BEST_ITERATION,
            reason: format!("expected a non-negative integer, got {iteration}"),
        })?;
        let best_va_loss = loss.as_f64().ok_or_else(|| Error::InvalidResultField {
            path: path.to_path_buf(),
            field: BEST_VA_LOSS,
            reason: format!("expected a number, got {loss}"),
        })?;

        Ok(Self {
            best_iteration,
            best_va_loss,
            extra: fields,
        })
    }

    /// Serialize to a JSON object with the required fields first.
    #[must_use]
    pub fn to_json(&self) -> Value {
        let mut fields = Map::new();
        fields.insert(BEST_ITERATION.to_string(), Value::from(self.best_iteration));
        fields.insert(BEST_VA_LOSS.to_string(), Value::from(self.best_va_loss));
        for (k, v) in &self.extra {
            fields.entry(k.clone()).or_insert_with(|| v.clone());
        }
        Value::Object(fields)
    }

    /// Write the result file to `path`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResultArtifact`] if the file cannot be written.
    pub fn write(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(&self.to_json())?;
        fs::write(path, text).map_err(|e| Error::ResultArtifact {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }
}

/// A missing key and an explicit `null` are both treated as absent.
fn take_field(fields: &mut Map<String, Value>, field: &'static str, path: &Path) -> Result<Value> {
    match fields.remove(field) {
        Some(Value::Null) | None => Err(Error::MissingResultField {
            path: path.to_path_buf(),
            field,
        }),
        Some(v) => Ok(v),
    }
}

/// Result file location for a trial: `<dir>/ffm-meta-<number>.json`.
///
/// Distinct trial numbers always map to distinct paths.
#[must_use]
pub fn artifact_path(dir: &Path, trial_number: u64) -> PathBuf {
    dir.join(format!("ffm-meta-{trial_number}.json"))
}
