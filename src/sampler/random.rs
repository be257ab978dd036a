//! Random sampler implementation.

use parking_lot::Mutex;

use crate::distribution::FloatDistribution;
use crate::sampler::{Sampler, sample_independent};
use crate::trial::FrozenTrial;

/// A sampler that draws every value independently at random.
///
/// Log-scale distributions are sampled uniformly in log space. History is
/// ignored; [`GpSampler`](super::GpSampler) uses the same draw for its
/// startup trials.
///
/// # Examples
///
/// ```
/// use ffm_tune::sampler::{RandomSampler, Sampler};
/// use ffm_tune::FloatDistribution;
///
/// let sampler = RandomSampler::with_seed(42);
/// let d = FloatDistribution::log_uniform(1e-6, 1.0).unwrap();
/// let v = sampler.suggest(0, "lambda", &d, &[]);
/// assert!((1e-6..=1.0).contains(&v));
/// ```
pub struct RandomSampler {
    rng: Mutex<fastrand::Rng>,
}

impl RandomSampler {
    /// Creates a new random sampler with a default random seed.
    #[must_use]
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(fastrand::Rng::new()),
        }
    }

    /// Creates a new random sampler with a fixed seed for reproducibility.
    #[must_use]
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(fastrand::Rng::with_seed(seed)),
        }
    }
}

impl Default for RandomSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl Sampler for RandomSampler {
    fn suggest(
        &self,
        _trial_number: u64,
        _name: &str,
        distribution: &FloatDistribution,
        _history: &[FrozenTrial],
    ) -> f64 {
        sample_independent(&mut self.rng.lock(), distribution)
    }
}

#[cfg(test)]
#[allow(clippy::cast_precision_loss)]
mod tests {
    use super::*;

    #[test]
    fn log_uniform_stays_in_bounds() {
        let sampler = RandomSampler::with_seed(7);
        let d = FloatDistribution::log_uniform(1e-5, 1.0).unwrap();
        for i in 0..1000 {
            let v = sampler.suggest(i, "x", &d, &[]);
            assert!((1e-5..=1.0).contains(&v), "{v} out of bounds");
        }
    }

    #[test]
    fn log_uniform_mean_of_logs_matches_analytic_mean() {
        let sampler = RandomSampler::with_seed(42);
        let d = FloatDistribution::log_uniform(1e-6, 1.0).unwrap();
        let n = 10_000;
        let mean = (0..n)
            .map(|i| sampler.suggest(i, "lambda", &d, &[]).ln())
            .sum::<f64>()
            / n as f64;

        let expected = (1e-6_f64.ln() + 1.0_f64.ln()) / 2.0;
        // Standard error of the mean is (ln range)/sqrt(12 n) ~ 0.04.
        assert!(
            (mean - expected).abs() < 0.2,
            "mean {mean} too far from {expected}"
        );
    }

    #[test]
    fn uniform_stays_in_bounds() {
        let sampler = RandomSampler::with_seed(3);
        let d = FloatDistribution::uniform(-2.0, 3.0).unwrap();
        for i in 0..1000 {
            let v = sampler.suggest(i, "x", &d, &[]);
            assert!((-2.0..=3.0).contains(&v));
        }
    }

    #[test]
    fn same_seed_same_sequence() {
        let d = FloatDistribution::log_uniform(1e-6, 1.0).unwrap();
        let a = RandomSampler::with_seed(11);
        let b = RandomSampler::with_seed(11);
        for i in 0..20 {
            assert_eq!(a.suggest(i, "x", &d, &[]), b.suggest(i, "x", &d, &[]));
        }
    }
}
