//! Parameter distribution types.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Distribution for floating-point parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FloatDistribution {
    /// Lower bound (inclusive).
    pub low: f64,
    /// Upper bound (inclusive).
    pub high: f64,
    /// Whether to sample in log space.
    pub log: bool,
}

impl FloatDistribution {
    /// Log-uniform distribution over `[low, high]`: `ln(x)` is uniform over
    /// `[ln(low), ln(high)]`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidBounds`] unless `low < high` and both are
    /// finite, and [`Error::InvalidLogBounds`] if `low <= 0`.
    ///
    /// # Examples
    ///
    /// ```
    /// use ffm_tune::FloatDistribution;
    ///
    /// assert!(FloatDistribution::log_uniform(1e-6, 1.0).is_ok());
    /// assert!(FloatDistribution::log_uniform(0.0, 1.0).is_err());
    /// ```
    pub fn log_uniform(low: f64, high: f64) -> Result<Self> {
        let d = Self {
            low,
            high,
            log: true,
        };
        d.validate()?;
        Ok(d)
    }

    /// Uniform distribution over `[low, high]`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidBounds`] unless `low < high` and both are
    /// finite.
    pub fn uniform(low: f64, high: f64) -> Result<Self> {
        let d = Self {
            low,
            high,
            log: false,
        };
        d.validate()?;
        Ok(d)
    }

    /// Check the bounds: finite, `low < high`, and `low > 0` in log space.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidBounds`] or [`Error::InvalidLogBounds`].
    pub fn validate(&self) -> Result<()> {
        if !self.low.is_finite() || !self.high.is_finite() || self.low >= self.high {
            return Err(Error::InvalidBounds {
                low: self.low,
                high: self.high,
            });
        }
        if self.log && self.low <= 0.0 {
            return Err(Error::InvalidLogBounds(self.low));
        }
        Ok(())
    }

    /// Bounds in the sampler's internal space (`ln` for log scale).
    #[must_use]
    pub fn internal_bounds(&self) -> (f64, f64) {
        if self.log {
            (self.low.ln(), self.high.ln())
        } else {
            (self.low, self.high)
        }
    }

    /// Map a value into internal space.
    #[must_use]
    pub fn to_internal(&self, value: f64) -> f64 {
        if self.log { value.ln() } else { value }
    }

    /// Map an internal-space value back, clamped to the bounds.
    #[must_use]
    pub fn from_internal(&self, value: f64) -> f64 {
        let v = if self.log { value.exp() } else { value };
        v.clamp(self.low, self.high)
    }

    /// Returns `true` if `value` lies within `[low, high]`.
    #[must_use]
    pub fn contains(&self, value: f64) -> bool {
        (self.low..=self.high).contains(&value)
    }
}

/// A named parameter of the search space.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    /// Parameter name, unique within a trial.
    pub name: String,
    /// Distribution the sampler draws from.
    pub distribution: FloatDistribution,
}

impl ParameterSpec {
    /// A parameter named `name` drawn from `distribution`.
    #[must_use]
    pub fn new(name: impl Into<String>, distribution: FloatDistribution) -> Self {
        Self {
            name: name.into(),
            distribution,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_inverted_bounds() {
        assert!(matches!(
            FloatDistribution::uniform(1.0, 0.5),
            Err(Error::InvalidBounds { .. })
        ));
        assert!(matches!(
            FloatDistribution::log_uniform(1.0, 1.0),
            Err(Error::InvalidBounds { .. })
        ));
    }

    #[test]
    fn rejects_non_positive_log_low() {
        assert!(matches!(
            FloatDistribution::log_uniform(-1.0, 1.0),
            Err(Error::InvalidLogBounds(_))
        ));
    }

    #[test]
    fn internal_round_trip_is_clamped() {
        let d = FloatDistribution::log_uniform(1e-6, 1.0).unwrap();
        let (lo, hi) = d.internal_bounds();
        assert!((lo - 1e-6_f64.ln()).abs() < 1e-12);
        assert_eq!(hi, 0.0);
        assert_eq!(d.from_internal(5.0), 1.0);
        assert_eq!(d.from_internal(-100.0), 1e-6);
        let v = d.from_internal(d.to_internal(0.01));
        assert!((v - 0.01).abs() < 1e-15);
    }
}
