//! Command-line interface of the `ffm-tune` binary.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use crate::config::TunerSettings;
use crate::coordinator::FailurePolicy;
use crate::driver::{BestTrialReport, StudyDriver};
use crate::evaluator::ExitStatusPolicy;

#[derive(Parser, Debug)]
#[command(name = "ffm-tune", version, about = "Hyperparameter search for ffm-train")]
pub struct Cli {
    /// YAML configuration file
    #[arg(long, global = true, env = "FFM_TUNE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Storage location: sqlite:///path, journal:///path, memory, or a path
    #[arg(long, global = true)]
    pub storage: Option<String>,

    /// Study name
    #[arg(long, global = true)]
    pub study_name: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create an empty study
    CreateStudy,
    /// Run trials and print the best one
    Optimize(OptimizeArgs),
    /// Print the best trial of a study
    BestTrial,
    /// List the trials of a study as JSON lines
    Trials,
    /// List study names
    Studies,
}

#[derive(Args, Debug, Default)]
pub struct OptimizeArgs {
    /// Number of trials to run
    #[arg(long)]
    pub n_trials: Option<usize>,

    /// Number of concurrent workers (default: cores - 1)
    #[arg(long)]
    pub n_jobs: Option<usize>,

    /// What to do after a failed trial: abort or skip
    #[arg(long)]
    pub failure_policy: Option<FailurePolicy>,

    /// Create the study if it does not exist
    #[arg(long)]
    pub create_if_missing: bool,

    /// Fail trials whose trainer exits unsuccessfully
    #[arg(long)]
    pub strict_exit_status: bool,
}

impl OptimizeArgs {
    fn apply(&self, settings: &mut TunerSettings) {
        if let Some(n) = self.n_trials {
            settings.n_trials = n;
        }
        if let Some(n) = self.n_jobs {
            settings.n_jobs = Some(n);
        }
        if let Some(policy) = self.failure_policy {
            settings.failure_policy = policy;
        }
        if self.create_if_missing {
            settings.create_if_missing = true;
        }
        if self.strict_exit_status {
            settings.trainer.exit_status = ExitStatusPolicy::Strict;
        }
    }
}

impl Cli {
    /// Load configuration layers and apply command-line overrides.
    ///
    /// # Errors
    ///
    /// Fails if the config file is missing, a layer cannot be parsed, or the
    /// merged settings are invalid.
    pub fn settings(&self) -> Result<TunerSettings> {
        let figment = TunerSettings::figment(self.config.as_deref())?;
        let mut settings: TunerSettings = figment
            .extract()
            .context("failed to load configuration")?;
        if let Some(storage) = &self.storage {
            settings.storage.clone_from(storage);
        }
        if let Some(name) = &self.study_name {
            settings.study_name.clone_from(name);
        }
        if let Commands::Optimize(args) = &self.command {
            args.apply(&mut settings);
        }
        settings.validate()?;
        Ok(settings)
    }
}

/// Execute the parsed command.
///
/// # Errors
///
/// Fails if the settings or store cannot be loaded, or the command itself
/// fails.
pub async fn execute(cli: Cli) -> Result<()> {
    let settings = cli.settings()?;
    let driver = StudyDriver::new(settings).context("failed to open study storage")?;

    match cli.command {
        Commands::CreateStudy => {
            let study = driver.create_study()?;
            println!("created study {}", study.name());
        }
        Commands::Optimize(_) => {
            let report: BestTrialReport = driver
                .run()
                .await
                .with_context(|| format!("study '{}' did not finish", driver.settings().study_name))?;
            println!("{report}");
        }
        Commands::BestTrial => println!("{}", driver.best_trial()?),
        Commands::Trials => {
            for trial in driver.trials()? {
                println!("{}", serde_json::to_string(&trial)?);
            }
        }
        Commands::Studies => {
            for name in driver.store().study_names()? {
                println!("{name}");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_optimize_flags() {
        let cli = Cli::try_parse_from([
            "ffm-tune",
            "--storage",
            "memory",
            "optimize",
            "--n-trials",
            "3",
            "--n-jobs",
            "1",
            "--failure-policy",
            "skip",
            "--strict-exit-status",
        ])
        .unwrap();
        let settings = cli.settings().unwrap();
        assert_eq!(settings.storage, "memory");
        assert_eq!(settings.n_trials, 3);
        assert_eq!(settings.n_jobs, Some(1));
        assert_eq!(settings.failure_policy, FailurePolicy::SkipAndContinue);
        assert_eq!(settings.trainer.exit_status, ExitStatusPolicy::Strict);
    }

    #[test]
    fn global_flags_follow_subcommand() {
        let cli = Cli::try_parse_from(["ffm-tune", "best-trial", "--study-name", "s1"]).unwrap();
        assert!(matches!(cli.command, Commands::BestTrial));
        assert_eq!(cli.study_name.as_deref(), Some("s1"));
    }

    #[test]
    fn zero_trials_is_rejected() {
        let cli = Cli::try_parse_from(["ffm-tune", "optimize", "--n-trials", "0"]).unwrap();
        assert!(cli.settings().is_err());
    }
}
