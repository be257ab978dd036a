//! The [`Objective`] trait defines what gets optimized.
//!
//! An objective declares its search space up front and evaluates one trial at
//! a time. Parameters are sampled by the study before
//! [`evaluate`](Objective::evaluate) is called, so the objective only reads
//! them from the [`Trial`] handle.
//!
//! ```
//! use ffm_tune::{FloatDistribution, Objective, ParameterSpec, Result, Trial};
//!
//! struct Quadratic;
//!
//! impl Objective for Quadratic {
//!     fn search_space(&self) -> Vec<ParameterSpec> {
//!         vec![ParameterSpec::new("x", FloatDistribution::uniform(-10.0, 10.0).unwrap())]
//!     }
//!
//!     fn evaluate(&self, trial: &mut Trial) -> Result<f64> {
//!         let x = trial.param("x").unwrap_or_default();
//!         Ok((x - 3.0).powi(2))
//!     }
//! }
//! ```

use crate::distribution::ParameterSpec;
use crate::error::Result;
use crate::trial::Trial;

/// A black-box function to minimize.
///
/// Evaluation is blocking and may take minutes; the runner calls it from the
/// tokio blocking pool, one trial per worker. Implementations are shared by
/// all workers and therefore must be `Send + Sync`.
pub trait Objective: Send + Sync {
    /// The parameters sampled for every trial, in sampling order.
    fn search_space(&self) -> Vec<ParameterSpec>;

    /// Evaluate one trial and return its objective value.
    ///
    /// Attributes set on `trial` are persisted whether this returns `Ok` or
    /// `Err`.
    ///
    /// # Errors
    ///
    /// Any error fails the trial; its message is stored as the failure reason.
    fn evaluate(&self, trial: &mut Trial) -> Result<f64>;
}
