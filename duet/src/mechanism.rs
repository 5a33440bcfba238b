//! Noise mechanisms. Every function here is pure: randomness comes in through
//! the caller's `Rng` and no ledger state is read or written.
//!
//! Gaussian noise uses the classic calibration
//! `sigma = bound * sqrt(2 ln(1.25 / delta)) / epsilon`, valid for
//! `epsilon <= 1`. The composition calculator charges each Gaussian release
//! at exactly the requested `(epsilon, delta)`, matching that calibration.

use std::fmt;

use rand::Rng;
use rand_distr::{Distribution, Geometric, Normal};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::{
    cost::{CostError, PrivacyCost},
    sensitivity::{QueryKind, SensitivityDescriptor, SensitivityMetric},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MechanismKind {
    Laplace,
    Gaussian,
    /// Two-sided geometric noise for integer-valued answers.
    Geometric,
    /// Keeps a boolean answer with probability `e^eps / (1 + e^eps)`.
    RandomizedResponse,
    /// Exact release at cost (0, 0). Must be declared explicitly.
    Exact,
}

impl fmt::Display for MechanismKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MechanismKind::Laplace => "laplace",
            MechanismKind::Gaussian => "gaussian",
            MechanismKind::Geometric => "geometric",
            MechanismKind::RandomizedResponse => "randomized_response",
            MechanismKind::Exact => "exact",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum MechanismError {
    #[error(transparent)]
    InvalidCost(#[from] CostError),
    #[error("{mechanism} mechanism needs {expected} sensitivity, got {found}")]
    MetricMismatch {
        mechanism: MechanismKind,
        expected: SensitivityMetric,
        found: SensitivityMetric,
    },
    #[error("sensitivity bound {0} is not usable")]
    InvalidSensitivity(f64),
    #[error("{mechanism} mechanism cannot noise a {shape} answer")]
    UnsupportedAnswer {
        mechanism: MechanismKind,
        shape: &'static str,
    },
    #[error("noise sampling failed: {0}")]
    Sampling(String),
}

/// Exact query result produced by the numeric kernel.
///
/// Deliberately not `Serialize` and redacted in `Debug`; the only way out is
/// through [`apply`].
pub enum TrueAnswer {
    Scalar(f64),
    Vector(Vec<f64>),
    Binary(bool),
}

impl TrueAnswer {
    pub fn shape(&self) -> &'static str {
        match self {
            TrueAnswer::Scalar(_) => "scalar",
            TrueAnswer::Vector(_) => "vector",
            TrueAnswer::Binary(_) => "binary",
        }
    }
}

impl fmt::Debug for TrueAnswer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TrueAnswer::{}(<redacted>)", self.shape())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoisedAnswer {
    Scalar(f64),
    Vector(Vec<f64>),
    Binary(bool),
}

impl NoisedAnswer {
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            NoisedAnswer::Scalar(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_vector(&self) -> Option<&[f64]> {
        match self {
            NoisedAnswer::Vector(values) => Some(values),
            _ => None,
        }
    }

    pub fn as_binary(&self) -> Option<bool> {
        match self {
            NoisedAnswer::Binary(bit) => Some(*bit),
            _ => None,
        }
    }
}

impl MechanismKind {
    /// Declared mechanism wins; otherwise indicators use randomized response
    /// and numeric queries pick Laplace or Gaussian from `delta`.
    pub fn select(declared: Option<MechanismKind>, kind: &QueryKind, cost: &PrivacyCost) -> Self {
        if let Some(mechanism) = declared {
            return mechanism;
        }
        match kind {
            QueryKind::Indicator { .. } => MechanismKind::RandomizedResponse,
            _ if cost.delta > 0.0 => MechanismKind::Gaussian,
            _ => MechanismKind::Laplace,
        }
    }

    pub fn metric(self) -> SensitivityMetric {
        match self {
            MechanismKind::Gaussian => SensitivityMetric::L2,
            _ => SensitivityMetric::L1,
        }
    }

    /// Checks `cost` against this mechanism's assumptions. Runs before any
    /// budget is reserved.
    pub fn validate(self, cost: &PrivacyCost) -> Result<(), CostError> {
        let invalid = |reason| CostError::Invalid {
            epsilon: cost.epsilon,
            delta: cost.delta,
            reason,
        };
        match self {
            MechanismKind::Exact => {
                cost.validate()?;
                if !cost.is_zero() {
                    return Err(invalid("exact release is only permitted at cost (0, 0)"));
                }
            }
            MechanismKind::Laplace
            | MechanismKind::Geometric
            | MechanismKind::RandomizedResponse => {
                cost.validate_chargeable()?;
                if cost.delta > 0.0 {
                    return Err(invalid("delta > 0 supplied to a pure epsilon mechanism"));
                }
            }
            MechanismKind::Gaussian => {
                cost.validate_chargeable()?;
                if cost.delta == 0.0 {
                    return Err(invalid("gaussian mechanism requires delta > 0"));
                }
                if cost.epsilon > 1.0 {
                    return Err(invalid("classic gaussian calibration requires epsilon <= 1"));
                }
            }
        }
        Ok(())
    }
}

pub fn laplace_scale(bound: f64, epsilon: f64) -> f64 {
    bound / epsilon
}

pub fn gaussian_sigma(bound: f64, cost: &PrivacyCost) -> f64 {
    bound * (2.0 * (1.25 / cost.delta).ln()).sqrt() / cost.epsilon
}

/// Geometric draws at or beyond this magnitude no longer fit an f64 exactly.
const MAX_EXACT_DRAW: u64 = 1 << 53;

pub fn randomized_response_truth_probability(epsilon: f64) -> f64 {
    1.0 / (1.0 + (-epsilon).exp())
}

/// Adds noise calibrated to `descriptor` and `cost`, consuming the true answer.
pub fn apply<R: Rng + ?Sized>(
    mechanism: MechanismKind,
    answer: TrueAnswer,
    descriptor: &SensitivityDescriptor,
    cost: &PrivacyCost,
    rng: &mut R,
) -> Result<NoisedAnswer, MechanismError> {
    mechanism.validate(cost)?;
    if !descriptor.bound.is_finite() || descriptor.bound < 0.0 {
        return Err(MechanismError::InvalidSensitivity(descriptor.bound));
    }
    if mechanism != MechanismKind::Exact && descriptor.metric != mechanism.metric() {
        return Err(MechanismError::MetricMismatch {
            mechanism,
            expected: mechanism.metric(),
            found: descriptor.metric,
        });
    }
    let unsupported = |answer: &TrueAnswer| MechanismError::UnsupportedAnswer {
        mechanism,
        shape: answer.shape(),
    };

    match mechanism {
        MechanismKind::Exact => Ok(match answer {
            TrueAnswer::Scalar(value) => NoisedAnswer::Scalar(value),
            TrueAnswer::Vector(values) => NoisedAnswer::Vector(values),
            TrueAnswer::Binary(bit) => NoisedAnswer::Binary(bit),
        }),
        MechanismKind::Laplace => {
            let scale = laplace_scale(descriptor.bound, cost.epsilon);
            debug!("laplace calibration bound={} scale={}", descriptor.bound, scale);
            if !scale.is_finite() {
                return Err(MechanismError::Sampling(format!(
                    "laplace scale {scale} is not finite for epsilon={}",
                    cost.epsilon
                )));
            }
            map_numeric(answer, unsupported, |value| {
                Ok(value + sample_laplace(&mut *rng, scale))
            })
        }
        MechanismKind::Gaussian => {
            let sigma = gaussian_sigma(descriptor.bound, cost);
            debug!("gaussian calibration bound={} sigma={}", descriptor.bound, sigma);
            if !sigma.is_finite() {
                return Err(MechanismError::Sampling(format!(
                    "gaussian sigma {sigma} is not finite for epsilon={}",
                    cost.epsilon
                )));
            }
            let normal =
                Normal::new(0.0, sigma).map_err(|err| MechanismError::Sampling(err.to_string()))?;
            map_numeric(answer, unsupported, |value| Ok(value + normal.sample(&mut *rng)))
        }
        MechanismKind::Geometric => {
            if descriptor.bound.fract() != 0.0 {
                return Err(MechanismError::InvalidSensitivity(descriptor.bound));
            }
            if descriptor.bound == 0.0 {
                return map_numeric(answer, unsupported, |value| Ok(value.round()));
            }
            let alpha = (-cost.epsilon / descriptor.bound).exp();
            debug!("geometric calibration bound={} alpha={}", descriptor.bound, alpha);
            if !(alpha < 1.0) {
                return Err(MechanismError::Sampling(format!(
                    "geometric alpha rounds to {alpha} for epsilon={}",
                    cost.epsilon
                )));
            }
            let geometric = Geometric::new(1.0 - alpha)
                .map_err(|err| MechanismError::Sampling(err.to_string()))?;
            map_numeric(answer, unsupported, |value| {
                let up = geometric.sample(&mut *rng);
                let down = geometric.sample(&mut *rng);
                if up >= MAX_EXACT_DRAW || down >= MAX_EXACT_DRAW {
                    return Err(MechanismError::Sampling(format!(
                        "geometric draw exceeds exact f64 range for epsilon={}",
                        cost.epsilon
                    )));
                }
                Ok(value.round() + up as f64 - down as f64)
            })
        }
        MechanismKind::RandomizedResponse => match answer {
            TrueAnswer::Binary(bit) => {
                let keep = randomized_response_truth_probability(cost.epsilon);
                debug!("randomized response truth_probability={}", keep);
                Ok(NoisedAnswer::Binary(if rng.gen_bool(keep) { bit } else { !bit }))
            }
            other => Err(unsupported(&other)),
        },
    }
}

fn map_numeric<U, F>(answer: TrueAnswer, unsupported: U, mut noise: F) -> Result<NoisedAnswer, MechanismError>
where
    U: Fn(&TrueAnswer) -> MechanismError,
    F: FnMut(f64) -> Result<f64, MechanismError>,
{
    match answer {
        TrueAnswer::Scalar(value) => Ok(NoisedAnswer::Scalar(noise(value)?)),
        TrueAnswer::Vector(values) => values
            .into_iter()
            .map(&mut noise)
            .collect::<Result<Vec<_>, _>>()
            .map(NoisedAnswer::Vector),
        other @ TrueAnswer::Binary(_) => Err(unsupported(&other)),
    }
}

/// Inverse-CDF draw from Laplace(0, scale).
fn sample_laplace<R: Rng + ?Sized>(rng: &mut R, scale: f64) -> f64 {
    if scale == 0.0 {
        return 0.0;
    }
    let u: f64 = rng.gen::<f64>() - 0.5;
    let sign = if u >= 0.0 { 1.0 } else { -1.0 };
    let magnitude = (1.0 - 2.0 * u.abs()).max(f64::MIN_POSITIVE);
    -scale * sign * magnitude.ln()
}
