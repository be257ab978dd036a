//! Study and parallel runner tests with in-process objectives.

use core::sync::atomic::{AtomicUsize, Ordering};
use core::time::Duration;
use std::collections::HashSet;
use std::sync::Arc;

use ffm_tune::sampler::{GpSampler, RandomSampler};
use ffm_tune::storage::{MemoryStore, StudyStore};
use ffm_tune::{
    Error, FailurePolicy, FloatDistribution, Objective, ParameterSpec, Result, RunOptions, Study,
    Trial, TrialState,
};

/// Minimum at `lambda = 1e-3`, `eta = 1e-1`.
struct LogQuadratic {
    calls: AtomicUsize,
}

impl LogQuadratic {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }
}

fn space() -> Vec<ParameterSpec> {
    let d = FloatDistribution::log_uniform(1e-6, 1.0).unwrap();
    vec![
        ParameterSpec::new("lambda", d.clone()),
        ParameterSpec::new("eta", d),
    ]
}

impl Objective for LogQuadratic {
    fn search_space(&self) -> Vec<ParameterSpec> {
        space()
    }

    fn evaluate(&self, trial: &mut Trial) -> Result<f64> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(2));
        let l = trial.param("lambda").unwrap().log10() + 3.0;
        let e = trial.param("eta").unwrap().log10() + 1.0;
        trial.set_best_iteration(trial.number() + 1);
        Ok(l * l + e * e)
    }
}

/// Fails every trial whose number is in `fail_on`.
struct FailOn {
    fail_on: HashSet<u64>,
}

impl Objective for FailOn {
    fn search_space(&self) -> Vec<ParameterSpec> {
        space()
    }

    fn evaluate(&self, trial: &mut Trial) -> Result<f64> {
        if self.fail_on.contains(&trial.number()) {
            return Err(Error::TrainerExitStatus {
                status: "exit status: 1".into(),
            });
        }
        Ok(f64::from(u32::try_from(trial.number()).unwrap()))
    }
}

fn memory_study(name: &str) -> Study {
    let store: Arc<dyn StudyStore> = Arc::new(MemoryStore::new());
    Study::create(name, store, Arc::new(RandomSampler::with_seed(42))).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_run_allocates_each_number_once() {
    let study = memory_study("parallel");
    let objective = Arc::new(LogQuadratic::new());
    let summary = study
        .optimize(objective.clone(), RunOptions::new(40).n_jobs(6))
        .await
        .unwrap();

    assert_eq!(summary.completed, 40);
    assert_eq!(summary.failed, 0);
    assert_eq!(objective.calls.load(Ordering::SeqCst), 40);

    let trials = study.trials().unwrap();
    let numbers: Vec<u64> = trials.iter().map(|t| t.number).collect();
    assert_eq!(numbers, (0..40).collect::<Vec<_>>());
    assert!(trials.iter().all(|t| t.state == TrialState::Complete));
    assert!(
        trials
            .iter()
            .all(|t| t.attrs.best_iteration == Some(t.number + 1))
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn best_value_is_minimum_of_completed() {
    let study = memory_study("best");
    study
        .optimize(Arc::new(LogQuadratic::new()), RunOptions::new(20).n_jobs(2))
        .await
        .unwrap();

    let best = study.best_trial().unwrap();
    let min = study
        .trials()
        .unwrap()
        .iter()
        .filter_map(|t| t.value)
        .fold(f64::INFINITY, f64::min);
    assert_eq!(study.best_value().unwrap(), min);
    assert_eq!(study.best_params().unwrap(), best.params);
    for name in ["lambda", "eta"] {
        let v = best.param(name).unwrap();
        assert!((1e-6..=1.0).contains(&v));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn resumed_study_continues_after_previous_trials() {
    let store: Arc<dyn StudyStore> = Arc::new(MemoryStore::new());
    let first = Study::create("resume", Arc::clone(&store), Arc::new(RandomSampler::new())).unwrap();
    first
        .optimize(Arc::new(LogQuadratic::new()), RunOptions::new(3).n_jobs(1))
        .await
        .unwrap();

    let again = Study::load("resume", store, Arc::new(RandomSampler::new())).unwrap();
    again
        .optimize(Arc::new(LogQuadratic::new()), RunOptions::new(2).n_jobs(2))
        .await
        .unwrap();
    let numbers: Vec<u64> = again.trials().unwrap().iter().map(|t| t.number).collect();
    assert_eq!(numbers, vec![0, 1, 2, 3, 4]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn abort_stops_new_trials_and_returns_error() {
    let study = memory_study("abort");
    let objective = Arc::new(FailOn {
        fail_on: HashSet::from([2]),
    });
    let err = study
        .optimize(objective, RunOptions::new(10).n_jobs(1))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::TrainerExitStatus { .. }));

    let trials = study.trials().unwrap();
    assert_eq!(trials.len(), 3);
    assert_eq!(trials[0].state, TrialState::Complete);
    assert_eq!(trials[1].state, TrialState::Complete);
    assert_eq!(trials[2].state, TrialState::Failed);
    assert!(trials[2].attrs.fail_reason.is_some());
    assert_eq!(study.best_trial().unwrap().number, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn skip_policy_runs_whole_budget() {
    let study = memory_study("skip");
    let objective = Arc::new(FailOn {
        fail_on: HashSet::from([0, 3, 4]),
    });
    let summary = study
        .optimize(
            objective,
            RunOptions::new(8)
                .n_jobs(3)
                .failure_policy(FailurePolicy::SkipAndContinue),
        )
        .await
        .unwrap();
    assert_eq!(summary.completed, 5);
    assert_eq!(summary.failed, 3);
    assert_eq!(study.n_trials().unwrap(), 8);
    assert_eq!(study.best_trial().unwrap().number, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn all_failures_leave_no_best_trial() {
    let study = memory_study("none");
    let objective = Arc::new(FailOn {
        fail_on: (0..4).collect(),
    });
    study
        .optimize(
            objective,
            RunOptions::new(4)
                .n_jobs(2)
                .failure_policy(FailurePolicy::SkipAndContinue),
        )
        .await
        .unwrap();
    assert!(matches!(study.best_trial(), Err(Error::NoCompletedTrials)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn gp_sampler_improves_on_startup_trials() {
    let store: Arc<dyn StudyStore> = Arc::new(MemoryStore::new());
    let sampler = GpSampler::builder().n_startup_trials(8).seed(5).build();
    let study = Study::create("gp", store, Arc::new(sampler)).unwrap();
    study
        .optimize(Arc::new(LogQuadratic::new()), RunOptions::new(30).n_jobs(1))
        .await
        .unwrap();

    let trials = study.trials().unwrap();
    let startup_best = trials[..8]
        .iter()
        .filter_map(|t| t.value)
        .fold(f64::INFINITY, f64::min);
    assert!(study.best_value().unwrap() <= startup_best);
    assert!(study.best_value().unwrap() < 4.0);
}
