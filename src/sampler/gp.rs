//! Gaussian Process (GP) sampler with Expected Improvement acquisition.
//!
//! Builds a GP surrogate with a **Matérn 5/2 kernel** (ARD lengthscales) over
//! every parameter seen so far and picks the next point by maximizing
//! **Expected Improvement (EI)**. Suited to expensive objectives with a handful
//! of continuous parameters, such as a trainer run that takes minutes.
//!
//! # Algorithm overview
//!
//! 1. **Startup phase**: until `n_startup_trials` complete trials exist, points
//!    are drawn independently at random (log-uniform for log-scale parameters).
//! 2. **Fit GP**: inputs are mapped to `[0, 1]` in internal (log) space,
//!    outputs are standardized, and the GP is fitted by Cholesky decomposition.
//! 3. **Maximize EI**: random candidates, half of them drawn near the current
//!    best point, are scored under the posterior; the best is returned.
//!
//! All parameters of one trial are proposed jointly in
//! [`Sampler::before_trial`], which announces the whole search space, and
//! handed out one name at a time by `suggest`. Without that call the first
//! `suggest` of a trial proposes every parameter seen so far. Values are
//! always minimized.
//!
//! # Configuration
//!
//! | Option | Default | Description |
//! |--------|---------|-------------|
//! | `n_startup_trials` | 10 | Random trials before GP-guided sampling begins |
//! | `n_candidates` | 1000 | Candidates scored per trial |
//! | `noise_variance` | 1e-6 | Observation noise added to the kernel diagonal |
//! | `seed` | random | RNG seed for reproducibility |
//!
//! # Examples
//!
//! ```
//! use ffm_tune::sampler::GpSampler;
//!
//! let sampler = GpSampler::builder()
//!     .n_startup_trials(5)
//!     .n_candidates(500)
//!     .seed(42)
//!     .build();
//! ```

use std::collections::HashMap;

use nalgebra::{DMatrix, DVector};
use parking_lot::Mutex;

use crate::distribution::{FloatDistribution, ParameterSpec};
use crate::sampler::{Sampler, f64_range, sample_independent};
use crate::trial::FrozenTrial;

/// Gaussian Process sampler for Bayesian optimization.
pub struct GpSampler {
    state: Mutex<GpState>,
}

impl GpSampler {
    /// Creates a new GP sampler with a random seed.
    #[must_use]
    pub fn new() -> Self {
        GpSamplerBuilder::new().build()
    }

    /// Creates a new GP sampler with a fixed seed for reproducibility.
    #[must_use]
    pub fn with_seed(seed: u64) -> Self {
        GpSamplerBuilder::new().seed(seed).build()
    }

    /// Creates a builder for configuring a `GpSampler`.
    #[must_use]
    pub fn builder() -> GpSamplerBuilder {
        GpSamplerBuilder::new()
    }
}

impl Default for GpSampler {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for configuring a [`GpSampler`].
#[derive(Debug, Clone, Default)]
pub struct GpSamplerBuilder {
    n_startup_trials: Option<usize>,
    n_candidates: Option<usize>,
    noise_variance: Option<f64>,
    seed: Option<u64>,
}

impl GpSamplerBuilder {
    /// Creates a new builder with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the number of random trials before GP-guided sampling begins.
    ///
    /// Default: 10.
    #[must_use]
    pub fn n_startup_trials(mut self, n: usize) -> Self {
        self.n_startup_trials = Some(n);
        self
    }

    /// Sets the number of candidate points scored per trial.
    ///
    /// Default: 1000.
    #[must_use]
    pub fn n_candidates(mut self, n: usize) -> Self {
        self.n_candidates = Some(n);
        self
    }

    /// Sets the observation noise variance added to the kernel diagonal.
    ///
    /// Default: 1e-6.
    #[must_use]
    pub fn noise_variance(mut self, v: f64) -> Self {
        self.noise_variance = Some(v);
        self
    }

    /// Sets the random seed for reproducibility.
    #[must_use]
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Builds the configured [`GpSampler`].
    #[must_use]
    pub fn build(self) -> GpSampler {
        GpSampler {
            state: Mutex::new(GpState {
                rng: self
                    .seed
                    .map_or_else(fastrand::Rng::new, fastrand::Rng::with_seed),
                n_startup_trials: self.n_startup_trials.unwrap_or(DEFAULT_N_STARTUP),
                n_candidates: self.n_candidates.unwrap_or(DEFAULT_N_CANDIDATES).max(1),
                noise_variance: self.noise_variance.unwrap_or(DEFAULT_NOISE_VAR),
                space: Vec::new(),
                pending: HashMap::new(),
            }),
        }
    }
}

const DEFAULT_N_STARTUP: usize = 10;
const DEFAULT_N_CANDIDATES: usize = 1000;
const DEFAULT_NOISE_VAR: f64 = 1e-6;

/// Caps GP fitting at O(`MAX_TRAIN_POINTS`^3) per trial.
const MAX_TRAIN_POINTS: usize = 200;

/// Upper bound on trials with unconsumed proposals.
const MAX_PENDING: usize = 1024;

/// Width (in normalized units) of the local search around the incumbent.
const LOCAL_SCALE: f64 = 0.1;

const SQRT_5: f64 = 2.236_067_977_499_79;

struct GpState {
    rng: fastrand::Rng,
    n_startup_trials: usize,
    n_candidates: usize,
    noise_variance: f64,
    /// Parameters in discovery order.
    space: Vec<(String, FloatDistribution)>,
    /// Proposed values not yet handed out, per trial number.
    pending: HashMap<u64, HashMap<String, f64>>,
}

impl GpState {
    fn register(&mut self, name: &str, distribution: &FloatDistribution) {
        match self.space.iter_mut().find(|(n, _)| n == name) {
            Some((_, d)) => {
                if d != distribution {
                    *d = distribution.clone();
                }
            }
            None => self.space.push((name.to_owned(), distribution.clone())),
        }
    }

    /// Propose values for every known parameter.
    fn propose(&mut self, history: &[FrozenTrial]) -> HashMap<String, f64> {
        let (x_train, y_train) = build_training_data(history, &self.space);
        let model = if y_train.len() >= self.n_startup_trials.max(1) {
            fit_gp(&x_train, &y_train, self.noise_variance)
        } else {
            None
        };

        let Some(model) = model else {
            return self
                .space
                .iter()
                .map(|(name, d)| (name.clone(), sample_independent(&mut self.rng, d)))
                .collect();
        };

        let incumbent = y_train
            .iter()
            .enumerate()
            .min_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| x_train[i].clone());
        let x = optimize_acquisition(
            &model,
            self.space.len(),
            self.n_candidates,
            incumbent.as_deref(),
            &mut self.rng,
        );

        self.space
            .iter()
            .zip(x)
            .map(|((name, d), u)| {
                let (lo, hi) = d.internal_bounds();
                (name.clone(), d.from_internal(lo + u * (hi - lo)))
            })
            .collect()
    }
}

impl GpState {
    /// Store a joint proposal for `trial_number`, evicting the oldest one if
    /// too many are outstanding.
    fn stash(&mut self, trial_number: u64, values: HashMap<String, f64>) {
        if values.is_empty() {
            return;
        }
        if self.pending.len() >= MAX_PENDING
            && let Some(oldest) = self.pending.keys().min().copied()
        {
            self.pending.remove(&oldest);
        }
        self.pending.insert(trial_number, values);
    }
}

impl Sampler for GpSampler {
    fn before_trial(&self, trial_number: u64, space: &[ParameterSpec], history: &[FrozenTrial]) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        for spec in space {
            state.register(&spec.name, &spec.distribution);
        }
        let values = state.propose(history);
        state.stash(trial_number, values);
    }

    fn suggest(
        &self,
        trial_number: u64,
        name: &str,
        distribution: &FloatDistribution,
        history: &[FrozenTrial],
    ) -> f64 {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.register(name, distribution);

        if let Some(values) = state.pending.get_mut(&trial_number) {
            let value = values.remove(name);
            if values.is_empty() {
                state.pending.remove(&trial_number);
            }
            return match value {
                Some(v) if distribution.contains(v) => v,
                // Parameter first seen mid-trial, or its bounds changed.
                _ => sample_independent(&mut state.rng, distribution),
            };
        }

        let mut values = state.propose(history);
        let value = values
            .remove(name)
            .unwrap_or_else(|| sample_independent(&mut state.rng, distribution));
        state.stash(trial_number, values);
        value
    }

    fn after_trial(&self, trial_number: u64) {
        self.state.lock().pending.remove(&trial_number);
    }
}

// ---------------------------------------------------------------------------
// Training data
// ---------------------------------------------------------------------------

/// Normalize complete trials that carry every parameter in `space`.
///
/// Uses the most recent [`MAX_TRAIN_POINTS`] usable trials.
fn build_training_data(
    history: &[FrozenTrial],
    space: &[(String, FloatDistribution)],
) -> (Vec<Vec<f64>>, Vec<f64>) {
    let mut rows: Vec<(Vec<f64>, f64)> = history
        .iter()
        .filter_map(|trial| {
            let y = trial.completed_value().filter(|v| v.is_finite())?;
            let x = space
                .iter()
                .map(|(name, d)| {
                    let v = trial.param(name)?;
                    let (lo, hi) = d.internal_bounds();
                    Some(to_normalized(d.to_internal(v.clamp(d.low, d.high)), lo, hi))
                })
                .collect::<Option<Vec<f64>>>()?;
            Some((x, y))
        })
        .collect();

    let start = rows.len().saturating_sub(MAX_TRAIN_POINTS);
    rows.drain(..start);
    rows.into_iter().unzip()
}

fn to_normalized(value: f64, lo: f64, hi: f64) -> f64 {
    if (hi - lo).abs() < 1e-15 {
        0.5
    } else {
        (value - lo) / (hi - lo)
    }
}

// ---------------------------------------------------------------------------
// Matérn 5/2 kernel
// ---------------------------------------------------------------------------

/// `k(x1, x2) = σ² (1 + √5 r + 5/3 r²) exp(-√5 r)`,
/// `r = sqrt(Σ ((x1_i - x2_i) / l_i)²)`.
fn matern52(x1: &[f64], x2: &[f64], lengthscales: &[f64], signal_var: f64) -> f64 {
    let r_sq: f64 = x1
        .iter()
        .zip(x2)
        .zip(lengthscales)
        .map(|((a, b), l)| ((a - b) / l).powi(2))
        .sum();
    let sqrt5_r = SQRT_5 * r_sq.sqrt();
    signal_var * (1.0 + sqrt5_r + 5.0 / 3.0 * r_sq) * (-sqrt5_r).exp()
}

struct GpModel {
    cholesky: nalgebra::linalg::Cholesky<f64, nalgebra::Dyn>,
    /// `(K + σ²I)^{-1} y`.
    alpha: DVector<f64>,
    x_train: Vec<Vec<f64>>,
    lengthscales: Vec<f64>,
    signal_var: f64,
    /// Best observed standardized value.
    f_best: f64,
}

/// Fit a GP to standardized targets. `None` if the kernel matrix is not
/// positive definite.
#[allow(clippy::cast_precision_loss)]
fn fit_gp(x_train: &[Vec<f64>], y_train: &[f64], noise_var: f64) -> Option<GpModel> {
    let n = y_train.len();
    let d = x_train.first()?.len();

    let y_mean = y_train.iter().sum::<f64>() / n as f64;
    let y_var = if n > 1 {
        y_train.iter().map(|y| (y - y_mean).powi(2)).sum::<f64>() / (n - 1) as f64
    } else {
        1.0
    };
    let y_std = y_var.sqrt().max(1e-10);
    let y: Vec<f64> = y_train.iter().map(|v| (v - y_mean) / y_std).collect();
    let f_best = y.iter().copied().fold(f64::INFINITY, f64::min);

    let lengthscales: Vec<f64> = (0..d)
        .map(|j| {
            let mean = x_train.iter().map(|x| x[j]).sum::<f64>() / n as f64;
            let var = x_train.iter().map(|x| (x[j] - mean).powi(2)).sum::<f64>() / n as f64;
            var.sqrt().clamp(0.05, 1.0)
        })
        .collect();
    let signal_var = 1.0;

    let k = DMatrix::from_fn(n, n, |i, j| {
        let k = matern52(&x_train[i], &x_train[j], &lengthscales, signal_var);
        if i == j { k + noise_var } else { k }
    });
    let cholesky = nalgebra::linalg::Cholesky::new(k)?;
    let alpha = cholesky.solve(&DVector::from_column_slice(&y));

    Some(GpModel {
        cholesky,
        alpha,
        x_train: x_train.to_vec(),
        lengthscales,
        signal_var,
        f_best,
    })
}

/// Posterior mean and standard deviation at `x`.
fn predict(model: &GpModel, x: &[f64]) -> (f64, f64) {
    let k_star = DVector::from_fn(model.x_train.len(), |i, _| {
        matern52(x, &model.x_train[i], &model.lengthscales, model.signal_var)
    });
    let mean = k_star.dot(&model.alpha);
    let v = model.cholesky.solve(&k_star);
    let var = (model.signal_var - k_star.dot(&v)).max(0.0);
    (mean, var.sqrt())
}

// ---------------------------------------------------------------------------
// Expected Improvement
// ---------------------------------------------------------------------------

fn norm_pdf(x: f64) -> f64 {
    const INV_SQRT_2PI: f64 = 0.398_942_280_401_432_7;
    INV_SQRT_2PI * (-0.5 * x * x).exp()
}

/// Standard normal CDF (Abramowitz-Stegun 26.2.17).
fn norm_cdf(x: f64) -> f64 {
    if x < -8.0 {
        return 0.0;
    }
    if x > 8.0 {
        return 1.0;
    }
    let t = 1.0 / (1.0 + 0.231_641_9 * x.abs());
    let poly = t
        * (0.319_381_530
            + t * (-0.356_563_782 + t * (1.781_477_937 + t * (-1.821_255_978 + t * 1.330_274_429))));
    let cdf = 1.0 - norm_pdf(x.abs()) * poly;
    if x >= 0.0 { cdf } else { 1.0 - cdf }
}

/// `EI(x) = (f_best - μ) Φ(z) + σ φ(z)`, `z = (f_best - μ) / σ`.
fn expected_improvement(mean: f64, std: f64, f_best: f64) -> f64 {
    if std < 1e-12 {
        return (f_best - mean).max(0.0);
    }
    let z = (f_best - mean) / std;
    ((f_best - mean) * norm_cdf(z) + std * norm_pdf(z)).max(0.0)
}

/// Find a point in `[0, 1]^d` with high EI. Half of the candidates are
/// uniform, the other half are Gaussian perturbations of `incumbent`.
fn optimize_acquisition(
    model: &GpModel,
    n_dims: usize,
    n_candidates: usize,
    incumbent: Option<&[f64]>,
    rng: &mut fastrand::Rng,
) -> Vec<f64> {
    let mut best_ei = f64::NEG_INFINITY;
    let mut best_x = vec![0.5; n_dims];

    for i in 0..n_candidates {
        let x: Vec<f64> = match incumbent {
            Some(center) if i % 2 == 1 => center
                .iter()
                .map(|c| (c + LOCAL_SCALE * standard_normal(rng)).clamp(0.0, 1.0))
                .collect(),
            _ => (0..n_dims).map(|_| f64_range(rng, 0.0, 1.0)).collect(),
        };
        let (mean, std) = predict(model, &x);
        let ei = expected_improvement(mean, std, model.f_best);
        if ei > best_ei {
            best_ei = ei;
            best_x = x;
        }
    }
    best_x
}

/// Box-Muller transform.
fn standard_normal(rng: &mut fastrand::Rng) -> f64 {
    let u1 = rng.f64().max(f64::MIN_POSITIVE);
    let u2 = rng.f64();
    (-2.0 * u1.ln()).sqrt() * (core::f64::consts::TAU * u2).cos()
}
