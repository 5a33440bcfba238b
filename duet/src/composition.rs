//! Composition of per-query costs into a cumulative privacy loss.
//!
//! ## Basic composition
//! `(Σ eps_i, Σ delta_i)`, delta capped at 1. Always available.
//!
//! ## Advanced composition
//! Heterogeneous bound with slack `δ'` (Dwork-Rothblum-Vadhan and
//! Kairouz-Oh-Viswanath):
//!
//! ```text
//! eps_drv = Σ eps_i·tanh(eps_i/2) + sqrt(2 ln(1/δ') Σ eps_i²)
//! eps_kov = Σ eps_i·tanh(eps_i/2) + sqrt(2 Σ eps_i² · ln(e + sqrt(Σ eps_i²)/δ'))
//! ```
//!
//! The tighter of the two is reported with delta `Σ delta_i + δ'`, unless it
//! does not beat basic composition, in which case the basic total is returned.

use std::{f64::consts::E, fmt};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cost::PrivacyCost;

const BISECTION_STEPS: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum CompositionMode {
    Basic,
    Advanced { slack: f64 },
}

impl Default for CompositionMode {
    fn default() -> Self {
        CompositionMode::Basic
    }
}

impl fmt::Display for CompositionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompositionMode::Basic => f.write_str("basic"),
            CompositionMode::Advanced { slack } => write!(f, "advanced(slack={slack:e})"),
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq)]
pub enum CompositionError {
    #[error("advanced composition slack must be within (0, 1), got {0}")]
    InvalidSlack(f64),
}

impl CompositionMode {
    pub fn validate(&self) -> Result<(), CompositionError> {
        match *self {
            CompositionMode::Basic => Ok(()),
            CompositionMode::Advanced { slack } => {
                if slack.is_finite() && slack > 0.0 && slack < 1.0 {
                    Ok(())
                } else {
                    Err(CompositionError::InvalidSlack(slack))
                }
            }
        }
    }

    /// Extra delta this mode may add on top of the summed deltas.
    pub fn slack(&self) -> f64 {
        match *self {
            CompositionMode::Basic => 0.0,
            CompositionMode::Advanced { slack } => slack,
        }
    }
}

pub fn basic_composition<'a, I>(costs: I) -> PrivacyCost
where
    I: IntoIterator<Item = &'a PrivacyCost>,
{
    let (epsilon, delta) = costs
        .into_iter()
        .fold((0.0, 0.0), |(eps, delta), cost| (eps + cost.epsilon, delta + cost.delta));
    PrivacyCost {
        epsilon,
        delta: delta.min(1.0),
    }
}

/// Total privacy loss of `costs` under `mode`.
pub fn cumulative_cost<'a, I>(mode: CompositionMode, costs: I) -> PrivacyCost
where
    I: IntoIterator<Item = &'a PrivacyCost>,
{
    let slack = match mode {
        CompositionMode::Basic => return basic_composition(costs),
        CompositionMode::Advanced { slack } => slack,
    };

    let mut epsilon_sum = 0.0;
    let mut delta_sum = 0.0;
    let mut tanh_sum = 0.0;
    let mut square_sum = 0.0;
    for cost in costs {
        epsilon_sum += cost.epsilon;
        delta_sum += cost.delta;
        tanh_sum += cost.epsilon * (cost.epsilon / 2.0).tanh();
        square_sum += cost.epsilon * cost.epsilon;
    }
    let basic = PrivacyCost {
        epsilon: epsilon_sum,
        delta: delta_sum.min(1.0),
    };
    if square_sum == 0.0 {
        return basic;
    }

    let drv = tanh_sum + (2.0 * square_sum * (1.0 / slack).ln()).sqrt();
    let kov = tanh_sum + (2.0 * square_sum * (E + square_sum.sqrt() / slack).ln()).sqrt();
    let tight = drv.min(kov);
    if tight.is_finite() && tight < basic.epsilon {
        PrivacyCost {
            epsilon: tight,
            delta: (delta_sum + slack).min(1.0),
        }
    } else {
        basic
    }
}

/// Largest per-query cost such that `k` further identical queries on top of
/// `spent` still fit within `total`.
pub fn remaining_for(
    mode: CompositionMode,
    total: &PrivacyCost,
    spent: &[PrivacyCost],
    k: usize,
) -> PrivacyCost {
    let composed = cumulative_cost(mode, spent);
    let headroom = total.saturating_sub(&composed);
    if k == 0 {
        return headroom;
    }
    if !composed.fits_within(total) || headroom.epsilon <= 0.0 {
        return PrivacyCost::ZERO;
    }

    let summed_delta: f64 = spent.iter().map(|cost| cost.delta).sum();
    let delta_room = (total.delta - summed_delta - mode.slack()).max(0.0);
    // Shave a relative 1e-9 so the re-summed deltas cannot round past the limit.
    let delta = if total.delta > 0.0 {
        delta_room / k as f64 * (1.0 - 1e-9)
    } else {
        0.0
    };

    let fits = |epsilon: f64| {
        let candidate = PrivacyCost { epsilon, delta };
        let mut history: Vec<PrivacyCost> = spent.to_vec();
        history.extend(std::iter::repeat(candidate).take(k));
        cumulative_cost(mode, &history).fits_within(total)
    };

    let (mut lo, mut hi) = (0.0, total.epsilon);
    if fits(hi) {
        return PrivacyCost {
            epsilon: hi,
            delta,
        };
    }
    for _ in 0..BISECTION_STEPS {
        let mid = (lo + hi) / 2.0;
        if fits(mid) {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    // Candidates below one ulp of the total vanish when summed into it.
    if lo <= total.epsilon * f64::EPSILON {
        return PrivacyCost::ZERO;
    }
    PrivacyCost { epsilon: lo, delta }
}
