//! Fans a trial budget out across a bounded pool of blocking workers.

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::Instrument;

use crate::coordinator::{TrialCoordinator, TrialOutcome};
use crate::error::{Error, Result};

/// Default worker count: one less than the available cores, at least one.
#[must_use]
pub fn default_n_jobs() -> usize {
    std::thread::available_parallelism()
        .map_or(1, |n| n.get().saturating_sub(1))
        .max(1)
}

/// Counts of what a run did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Trials that reached `Complete`.
    pub completed: usize,
    /// Trials that reached `Failed` and were skipped.
    pub failed: usize,
}

impl RunSummary {
    fn merge(&mut self, other: RunSummary) {
        self.completed += other.completed;
        self.failed += other.failed;
    }
}

/// Shared trial budget and abort flag.
struct Budget {
    limit: usize,
    started: AtomicUsize,
    aborted: AtomicBool,
}

impl Budget {
    /// Claim one trial slot; `false` once the budget is spent.
    fn claim(&self) -> bool {
        self.started
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.limit).then_some(n + 1)
            })
            .is_ok()
    }

    fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }
}

/// Runs trials on up to `n_jobs` workers until `n_trials` have been started.
///
/// Each worker is a tokio task that hands one trial at a time to the
/// blocking pool. Workers share nothing but the study store and an atomic
/// budget counter. After an aborting failure no worker starts another trial;
/// trials already running finish and are recorded, then the first error is
/// returned.
#[derive(Clone, Copy, Debug)]
pub struct ParallelRunner {
    n_jobs: usize,
}

impl ParallelRunner {
    /// Creates a runner with `n_jobs` workers (at least one).
    #[must_use]
    pub fn new(n_jobs: usize) -> Self {
        Self {
            n_jobs: n_jobs.max(1),
        }
    }

    /// Returns the number of workers.
    #[must_use]
    pub fn n_jobs(&self) -> usize {
        self.n_jobs
    }

    /// Run `n_trials` trials through `coordinator`.
    ///
    /// Must be called from within a multi-threaded tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns the first error any worker hit, after every worker has stopped.
    pub async fn run(&self, coordinator: TrialCoordinator, n_trials: usize) -> Result<RunSummary> {
        let budget = Arc::new(Budget {
            limit: n_trials,
            started: AtomicUsize::new(0),
            aborted: AtomicBool::new(false),
        });

        let mut workers = JoinSet::new();
        for worker in 0..self.n_jobs.min(n_trials) {
            let coordinator = coordinator.clone();
            let budget = Arc::clone(&budget);
            workers.spawn(
                run_worker(coordinator, budget)
                    .instrument(tracing::debug_span!("worker", id = worker)),
            );
        }

        let mut summary = RunSummary::default();
        let mut first_error: Option<Error> = None;
        while let Some(joined) = workers.join_next().await {
            let result = joined.map_err(|e| Error::TaskError(e.to_string())).and_then(|r| r);
            match result {
                Ok(tally) => summary.merge(tally),
                Err(e) => {
                    budget.abort();
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }
}

async fn run_worker(coordinator: TrialCoordinator, budget: Arc<Budget>) -> Result<RunSummary> {
    let mut tally = RunSummary::default();
    while !budget.is_aborted() && budget.claim() {
        let c = coordinator.clone();
        let span = tracing::Span::current();
        let outcome = tokio::task::spawn_blocking(move || span.in_scope(|| c.run()))
            .await
            .map_err(|e| Error::TaskError(e.to_string()))
            .and_then(|r| r);
        match outcome {
            Ok(TrialOutcome::Complete { .. }) => tally.completed += 1,
            Ok(TrialOutcome::Failed { .. }) => tally.failed += 1,
            Err(e) => {
                budget.abort();
                return Err(e);
            }
        }
    }
    Ok(tally)
}
