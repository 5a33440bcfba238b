use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq)]
pub enum CostError {
    #[error("invalid privacy cost (epsilon={epsilon}, delta={delta}): {reason}")]
    Invalid {
        epsilon: f64,
        delta: f64,
        reason: &'static str,
    },
}

/// One unit of privacy loss, `(epsilon, delta)`.
///
/// Fields are public so costs can be deserialized from journals and configs;
/// every entry point that acts on a cost calls [`PrivacyCost::validate`].
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PrivacyCost {
    pub epsilon: f64,
    pub delta: f64,
}

impl PrivacyCost {
    pub const ZERO: PrivacyCost = PrivacyCost {
        epsilon: 0.0,
        delta: 0.0,
    };

    pub fn new(epsilon: f64, delta: f64) -> Result<Self, CostError> {
        let cost = Self { epsilon, delta };
        cost.validate()?;
        Ok(cost)
    }

    /// Pure `epsilon`-DP cost.
    pub fn pure(epsilon: f64) -> Result<Self, CostError> {
        Self::new(epsilon, 0.0)
    }

    pub fn validate(&self) -> Result<(), CostError> {
        let invalid = |reason| CostError::Invalid {
            epsilon: self.epsilon,
            delta: self.delta,
            reason,
        };
        if !self.epsilon.is_finite() {
            return Err(invalid("epsilon must be finite"));
        }
        if self.epsilon < 0.0 {
            return Err(invalid("epsilon must be non-negative"));
        }
        if !self.delta.is_finite() || !(0.0..1.0).contains(&self.delta) {
            return Err(invalid("delta must be within [0, 1)"));
        }
        if self.epsilon == 0.0 && self.delta > 0.0 {
            return Err(invalid("epsilon must be > 0 when delta > 0"));
        }
        Ok(())
    }

    /// Validates a cost that must actually spend budget (epsilon > 0).
    pub fn validate_chargeable(&self) -> Result<(), CostError> {
        self.validate()?;
        if self.epsilon <= 0.0 {
            return Err(CostError::Invalid {
                epsilon: self.epsilon,
                delta: self.delta,
                reason: "epsilon must be > 0",
            });
        }
        Ok(())
    }

    pub fn is_zero(&self) -> bool {
        self.epsilon == 0.0 && self.delta == 0.0
    }

    pub fn is_pure(&self) -> bool {
        self.delta == 0.0
    }

    /// Component-wise `self <= limit`.
    pub fn fits_within(&self, limit: &PrivacyCost) -> bool {
        self.epsilon <= limit.epsilon && self.delta <= limit.delta
    }

    /// Component-wise `self - spent`, clamped at zero.
    pub fn saturating_sub(&self, spent: &PrivacyCost) -> PrivacyCost {
        PrivacyCost {
            epsilon: (self.epsilon - spent.epsilon).max(0.0),
            delta: (self.delta - spent.delta).max(0.0),
        }
    }
}

impl fmt::Display for PrivacyCost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(epsilon={:.6}, delta={:.3e})", self.epsilon, self.delta)
    }
}
