use rand::Rng;
use rand_distr::{Distribution, Normal};

use super::FederatedError;

/// Gaussian mechanism over an L2-clipped vector.
///
/// The clipping bound is the sensitivity, so
/// `sigma = C * sqrt(2 ln(1.25 / delta)) / epsilon`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GaussianMechanism {
    epsilon: f64,
    delta: f64,
    clip_norm: f64,
}

impl GaussianMechanism {
    pub fn new(epsilon: f64, delta: f64, clip_norm: f64) -> Result<Self, FederatedError> {
        if !(epsilon > 0.0) {
            return Err(FederatedError::InvalidEpsilon(epsilon));
        }
        if !(delta > 0.0 && delta < 1.0) {
            return Err(FederatedError::InvalidDelta(delta));
        }
        if !(clip_norm > 0.0) {
            return Err(FederatedError::InvalidClipNorm(clip_norm));
        }
        Ok(Self {
            epsilon,
            delta,
            clip_norm,
        })
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    pub fn delta(&self) -> f64 {
        self.delta
    }

    pub fn sigma(&self) -> f64 {
        self.clip_norm * (2.0_f64 * (1.25_f64 / self.delta).ln()).sqrt() / self.epsilon
    }

    /// Scale `values` down to the clipping norm; returns the norm before clipping.
    pub fn clip(&self, values: &mut [f32]) -> f64 {
        let norm = values
            .iter()
            .map(|v| f64::from(*v) * f64::from(*v))
            .sum::<f64>()
            .sqrt();
        if norm > self.clip_norm {
            let scale = (self.clip_norm / norm) as f32;
            values.iter_mut().for_each(|v| *v *= scale);
        }
        norm
    }

    /// Clipped copy of `values` with fresh noise on every element.
    pub fn privatize<R: Rng + ?Sized>(&self, values: &[f32], rng: &mut R) -> Result<Vec<f32>, FederatedError> {
        let normal =
            Normal::new(0.0, self.sigma()).map_err(|err| FederatedError::Noise(err.to_string()))?;
        let mut out = values.to_vec();
        self.clip(&mut out);
        for v in out.iter_mut() {
            *v += normal.sample(rng) as f32;
        }
        Ok(out)
    }
}
