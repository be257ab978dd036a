//! Sampler trait and implementations for parameter sampling.

pub mod gp;
pub mod random;

pub use gp::{GpSampler, GpSamplerBuilder};
pub use random::RandomSampler;

use crate::distribution::{FloatDistribution, ParameterSpec};
use crate::trial::FrozenTrial;

/// Trait for pluggable parameter sampling strategies.
///
/// A sampler is called once per parameter while a trial is still `Created`,
/// before it starts running. The calls for one trial are bracketed by
/// [`Sampler::before_trial`] and [`Sampler::after_trial`]. `history` holds
/// the study's complete trials as of the call; it may lag concurrent workers
/// by a trial or two.
///
/// The trait requires `Send + Sync` because one sampler is shared by all
/// workers of a parallel run.
pub trait Sampler: Send + Sync {
    /// Suggest a value for parameter `name` of trial `trial_number`.
    ///
    /// The returned value must lie within `[distribution.low, distribution.high]`.
    fn suggest(
        &self,
        trial_number: u64,
        name: &str,
        distribution: &FloatDistribution,
        history: &[FrozenTrial],
    ) -> f64;

    /// Announce the full search space of trial `trial_number` before any
    /// [`Sampler::suggest`] call for it.
    ///
    /// Samplers that propose parameters jointly use this to see every
    /// parameter up front. The default does nothing.
    fn before_trial(
        &self,
        _trial_number: u64,
        _space: &[ParameterSpec],
        _history: &[FrozenTrial],
    ) {}

    /// Called once all parameters of `trial_number` have been suggested.
    fn after_trial(&self, _trial_number: u64) {}
}

/// Generate a random `f64` in the range `[low, high)`.
#[inline]
pub(crate) fn f64_range(rng: &mut fastrand::Rng, low: f64, high: f64) -> f64 {
    low + rng.f64() * (high - low)
}

/// Draw from `distribution` without looking at history.
pub(crate) fn sample_independent(rng: &mut fastrand::Rng, distribution: &FloatDistribution) -> f64 {
    let (lo, hi) = distribution.internal_bounds();
    distribution.from_internal(f64_range(rng, lo, hi))
}
