//! The `ffm-train` objective: builds the trainer command line for a trial,
//! runs it, and reads the validation loss from its result file.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::{Deserialize, Serialize};

use crate::distribution::{FloatDistribution, ParameterSpec};
use crate::error::{Error, Result};
use crate::objective::Objective;
use crate::result::{ExternalResult, artifact_path};
use crate::trial::Trial;

/// Name of the regularization parameter (`-l`).
pub const LAMBDA: &str = "lambda";
/// Name of the learning-rate parameter (`-r`).
pub const ETA: &str = "eta";

/// What to do when the trainer exits unsuccessfully.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitStatusPolicy {
    /// Log the status and read the result file anyway.
    #[default]
    Ignore,
    /// Fail the trial with [`Error::TrainerExitStatus`].
    Strict,
}

/// Fixed part of the trainer invocation plus the sampled parameter ranges.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    /// Trainer executable.
    pub program: PathBuf,
    /// Validation set (`-p`).
    pub valid_path: PathBuf,
    /// Training set, the last positional argument.
    pub train_path: PathBuf,
    /// Directory receiving `ffm-meta-<n>.json` result files.
    pub artifact_dir: PathBuf,
    /// Number of latent factors (`-k`).
    pub rank: u32,
    /// Maximum number of iterations (`-t`).
    pub max_iterations: u32,
    /// Iterations without improvement before auto-stop.
    pub auto_stop_threshold: u32,
    /// Range of the regularization parameter.
    pub lambda: FloatDistribution,
    /// Range of the learning rate.
    pub eta: FloatDistribution,
    /// Exit status handling.
    pub exit_status: ExitStatusPolicy,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        let range = FloatDistribution {
            low: 1e-6,
            high: 1.0,
            log: true,
        };
        Self {
            program: PathBuf::from("./ffm-train"),
            valid_path: PathBuf::from("./data/valid2.txt"),
            train_path: PathBuf::from("./data/train2.txt"),
            artifact_dir: PathBuf::from("./data/optuna"),
            rank: 4,
            max_iterations: 500,
            auto_stop_threshold: 3,
            lambda: range.clone(),
            eta: range,
            exit_status: ExitStatusPolicy::Ignore,
        }
    }
}

impl TrainerConfig {
    /// Check the parameter ranges and counts.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] for an empty program or zero counts,
    /// and a bounds error for an invalid range.
    pub fn validate(&self) -> Result<()> {
        if self.program.as_os_str().is_empty() {
            return Err(Error::InvalidConfig("trainer program is empty".into()));
        }
        if self.rank == 0 || self.max_iterations == 0 {
            return Err(Error::InvalidConfig(
                "trainer rank and max_iterations must be positive".into(),
            ));
        }
        self.lambda.validate()?;
        self.eta.validate()
    }
}

/// Objective that trains a field-aware factorization machine with an external
/// `ffm-train` process and minimizes its best validation loss.
///
/// Each trial writes its result to its own file under
/// [`TrainerConfig::artifact_dir`], so any number of trials can run at once.
#[derive(Clone, Debug)]
pub struct FfmObjective {
    config: TrainerConfig,
}

impl FfmObjective {
    /// Creates the objective after validating `config`.
    ///
    /// # Errors
    ///
    /// Returns the error of [`TrainerConfig::validate`].
    pub fn new(config: TrainerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Returns the trainer configuration.
    #[must_use]
    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    /// Arguments passed to the trainer for one trial, program excluded.
    ///
    /// # Examples
    ///
    /// ```
    /// use ffm_tune::evaluator::{FfmObjective, TrainerConfig};
    ///
    /// let objective = FfmObjective::new(TrainerConfig::default()).unwrap();
    /// let args = objective.args(7, 0.5, 0.25);
    /// assert_eq!(args[0], "-p");
    /// assert_eq!(args.last().unwrap(), "./data/train2.txt");
    /// ```
    #[must_use]
    pub fn args(&self, trial_number: u64, lambda: f64, eta: f64) -> Vec<String> {
        let c = &self.config;
        let artifact = artifact_path(&c.artifact_dir, trial_number);
        vec![
            "-p".to_string(),
            path_arg(&c.valid_path),
            "--auto-stop".to_string(),
            "--auto-stop-threshold".to_string(),
            c.auto_stop_threshold.to_string(),
            "-l".to_string(),
            format!("{lambda}"),
            "-r".to_string(),
            format!("{eta}"),
            "-k".to_string(),
            c.rank.to_string(),
            "-t".to_string(),
            c.max_iterations.to_string(),
            "--json-meta".to_string(),
            path_arg(&artifact),
            path_arg(&c.train_path),
        ]
    }

    /// Full argv for one trial, program first.
    #[must_use]
    pub fn invocation(&self, trial_number: u64, lambda: f64, eta: f64) -> Vec<String> {
        let mut argv = vec![path_arg(&self.config.program)];
        argv.extend(self.args(trial_number, lambda, eta));
        argv
    }

    fn prepare_artifact(&self, artifact: &Path) -> Result<()> {
        fs::create_dir_all(&self.config.artifact_dir).map_err(|e| Error::ResultArtifact {
            path: self.config.artifact_dir.clone(),
            reason: e.to_string(),
        })?;
        match fs::remove_file(artifact) {
            Ok(()) => {
                tracing::debug!(path = %artifact.display(), "removed stale result file");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::ResultArtifact {
                path: artifact.to_path_buf(),
                reason: e.to_string(),
            }),
        }
    }

    fn run_trainer(&self, args: &[String]) -> Result<()> {
        let program = path_arg(&self.config.program);
        let output = Command::new(&self.config.program)
            .args(args)
            .output()
            .map_err(|source| Error::ExternalProcessLaunch { program, source })?;

        tracing::debug!(stdout = %String::from_utf8_lossy(&output.stdout), "trainer stdout");
        tracing::trace!(stderr = %String::from_utf8_lossy(&output.stderr), "trainer stderr");

        if !output.status.success() {
            match self.config.exit_status {
                ExitStatusPolicy::Strict => {
                    return Err(Error::TrainerExitStatus {
                        status: output.status.to_string(),
                    });
                }
                ExitStatusPolicy::Ignore => {
                    tracing::warn!(status = %output.status, "trainer exited unsuccessfully");
                }
            }
        }
        Ok(())
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn require_param(trial: &Trial, name: &str) -> Result<f64> {
    trial.param(name).ok_or_else(|| {
        Error::InvalidConfig(format!(
            "trial {} has no '{name}' parameter",
            trial.number()
        ))
    })
}

impl Objective for FfmObjective {
    fn search_space(&self) -> Vec<ParameterSpec> {
        vec![
            ParameterSpec::new(LAMBDA, self.config.lambda.clone()),
            ParameterSpec::new(ETA, self.config.eta.clone()),
        ]
    }

    fn evaluate(&self, trial: &mut Trial) -> Result<f64> {
        let number = trial.number();
        let lambda = require_param(trial, LAMBDA)?;
        let eta = require_param(trial, ETA)?;

        let artifact = artifact_path(&self.config.artifact_dir, number);
        self.prepare_artifact(&artifact)?;

        let args = self.args(number, lambda, eta);
        trial.set_invocation(self.invocation(number, lambda, eta));
        tracing::debug!(trial = number, args = ?args, "launching trainer");

        self.run_trainer(&args)?;

        let result = ExternalResult::read(&artifact)?;
        trial.set_best_iteration(result.best_iteration);
        for (key, value) in result.extra {
            trial.set_extra_attr(key, value);
        }
        Ok(result.best_va_loss)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn trial(number: u64) -> Trial {
        Trial::new(
            number,
            BTreeMap::from([(LAMBDA.to_string(), 0.001), (ETA.to_string(), 0.2)]),
        )
    }

    fn scratch_dir(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("ffm_tune_eval_{tag}_{}", std::process::id()))
    }

    #[test]
    fn invocation_matches_trainer_flags() {
        let objective = FfmObjective::new(TrainerConfig::default()).unwrap();
        assert_eq!(
            objective.invocation(12, 0.001, 0.2),
            vec![
                "./ffm-train",
                "-p",
                "./data/valid2.txt",
                "--auto-stop",
                "--auto-stop-threshold",
                "3",
                "-l",
                "0.001",
                "-r",
                "0.2",
                "-k",
                "4",
                "-t",
                "500",
                "--json-meta",
                "./data/optuna/ffm-meta-12.json",
                "./data/train2.txt",
            ]
        );
    }

    #[test]
    fn search_space_is_lambda_then_eta() {
        let objective = FfmObjective::new(TrainerConfig::default()).unwrap();
        let names: Vec<_> = objective
            .search_space()
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(names, vec![LAMBDA, ETA]);
    }

    #[test]
    fn rejects_bad_ranges() {
        let config = TrainerConfig {
            lambda: FloatDistribution {
                low: 0.0,
                high: 1.0,
                log: true,
            },
            ..TrainerConfig::default()
        };
        assert!(matches!(
            FfmObjective::new(config),
            Err(Error::InvalidLogBounds(_))
        ));
        let config = TrainerConfig {
            rank: 0,
            ..TrainerConfig::default()
        };
        assert!(matches!(
            FfmObjective::new(config),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn launch_failure_keeps_invocation() {
        let config = TrainerConfig {
            program: PathBuf::from("/nonexistent/ffm-train"),
            artifact_dir: scratch_dir("launch"),
            ..TrainerConfig::default()
        };
        let objective = FfmObjective::new(config).unwrap();
        let mut t = trial(0);
        let err = objective.evaluate(&mut t).unwrap_err();
        assert!(matches!(err, Error::ExternalProcessLaunch { .. }));
        assert_eq!(
            t.attrs().invocation.as_ref().map(|argv| argv[0].as_str()),
            Some("/nonexistent/ffm-train")
        );
    }

    #[test]
    fn missing_parameter_is_rejected() {
        let objective = FfmObjective::new(TrainerConfig::default()).unwrap();
        let mut t = Trial::new(0, BTreeMap::new());
        assert!(matches!(
            objective.evaluate(&mut t),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn strict_mode_fails_on_nonzero_exit() {
        let dir = scratch_dir("strict");
        let strict = TrainerConfig {
            program: PathBuf::from("false"),
            artifact_dir: dir.clone(),
            exit_status: ExitStatusPolicy::Strict,
            ..TrainerConfig::default()
        };
        let err = FfmObjective::new(strict)
            .unwrap()
            .evaluate(&mut trial(0))
            .unwrap_err();
        assert!(matches!(err, Error::TrainerExitStatus { .. }));

        // Lenient mode goes on to read the (absent) result file.
        let lenient = TrainerConfig {
            program: PathBuf::from("false"),
            artifact_dir: dir.clone(),
            ..TrainerConfig::default()
        };
        let err = FfmObjective::new(lenient)
            .unwrap()
            .evaluate(&mut trial(0))
            .unwrap_err();
        assert!(matches!(err, Error::ResultArtifact { .. }));
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn stale_result_file_is_removed() {
        let dir = scratch_dir("stale");
        let config = TrainerConfig {
            program: PathBuf::from("/nonexistent/ffm-train"),
            artifact_dir: dir.clone(),
            ..TrainerConfig::default()
        };
        let objective = FfmObjective::new(config).unwrap();
        fs::create_dir_all(&dir).unwrap();
        let stale = artifact_path(&dir, 3);
        ExternalResult::new(1, 0.1).write(&stale).unwrap();

        assert!(objective.evaluate(&mut trial(3)).is_err());
        assert!(!stale.exists());
        fs::remove_dir_all(&dir).ok();
    }
}
