//! The differential-privacy noise mechanism.
//!
//! Aggregated utilities are perturbed with Laplace noise drawn from a
//! per-round RNG whose seed is persisted with the round, so a committed
//! round's noise can be reproduced after the fact.

use rand::Rng;
use rand_chacha::ChaCha20Rng;

/// The noise mechanism applied to a round's aggregates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NoiseMechanism {
    /// Release aggregates unperturbed.
    None,
    /// Additive Laplace noise with scale `sensitivity / epsilon`.
    Laplace { epsilon: f64, sensitivity: f64 },
}

impl NoiseMechanism {
    /// The mechanism for a round with privacy budget `epsilon`. An ε of
    /// zero disables noise.
    pub fn for_round(epsilon: f64, sensitivity: f64) -> Self {
        if epsilon > 0.0 {
            NoiseMechanism::Laplace {
                epsilon,
                sensitivity,
            }
        } else {
            NoiseMechanism::None
        }
    }

    /// The Laplace scale `Δ/ε`, when noise is enabled.
    pub fn scale(&self) -> Option<f64> {
        match *self {
            NoiseMechanism::None => None,
            NoiseMechanism::Laplace {
                epsilon,
                sensitivity,
            } => Some(sensitivity / epsilon),
        }
    }

    /// Perturbs a utility value, clamping the result at zero.
    pub fn perturb(&self, value: f64, rng: &mut ChaCha20Rng) -> f64 {
        match self.scale() {
            None => value,
            Some(scale) => (value + laplace_sample(scale, rng)).max(0.0),
        }
    }
}

/// Draws one `Lap(0, scale)` sample by inverting the CDF of a uniform
/// draw on `[-1/2, 1/2)`.
fn laplace_sample(scale: f64, rng: &mut ChaCha20Rng) -> f64 {
    let u: f64 = rng.gen::<f64>() - 0.5;
    -scale * u.signum() * (1.0 - 2.0 * u.abs()).ln()
}
