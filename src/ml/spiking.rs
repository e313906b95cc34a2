use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Single-layer leaky integrate-and-fire network, one output neuron per class.
///
/// `weights` is row-major `outputs x inputs`; weights stay within `[0, w_max]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpikingModel {
    pub inputs: usize,
    pub outputs: usize,
    pub weights: Vec<f32>,
    pub thresholds: Vec<f32>,
}

/// Threshold every neuron starts from.
pub const INITIAL_THRESHOLD: f32 = 1.0;
/// Homeostasis never lowers a threshold below this.
pub const MIN_THRESHOLD: f32 = 0.05;

impl SpikingModel {
    pub fn new(inputs: usize, outputs: usize, w_max: f32, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed ^ 0x5eed_5eed);
        let weights = (0..inputs * outputs)
            .map(|_| rng.random_range(0.1..0.5) * w_max)
            .collect();
        Self {
            inputs,
            outputs,
            weights,
            thresholds: vec![INITIAL_THRESHOLD; outputs],
        }
    }

    pub fn weight(&self, post: usize, pre: usize) -> f32 {
        self.weights[post * self.inputs + pre]
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.weights.len() != self.inputs * self.outputs {
            return Err("weights length mismatch".to_string());
        }
        if self.thresholds.len() != self.outputs {
            return Err("thresholds length mismatch".to_string());
        }
        if self.weights.iter().chain(&self.thresholds).any(|v| !v.is_finite()) {
            return Err("weights or thresholds contain non-finite values".to_string());
        }
        Ok(())
    }

    /// Deterministic rate readout: expected drive per output neuron relative
    /// to its threshold. Backs [`crate::ml::ModelState::classify_spiking`].
    pub fn rate_response(&self, features: &[f32], max_spike_prob: f32) -> Vec<f32> {
        (0..self.outputs)
            .map(|post| {
                let drive: f32 = features
                    .iter()
                    .take(self.inputs)
                    .enumerate()
                    .map(|(pre, x)| spike_probability(*x, max_spike_prob) * self.weight(post, pre))
                    .sum();
                drive / self.thresholds[post].max(MIN_THRESHOLD)
            })
            .collect()
    }
}

/// Per-step firing probability for a rate-coded input.
pub fn spike_probability(feature: f32, max_spike_prob: f32) -> f32 {
    if !feature.is_finite() {
        return 0.0;
    }
    (feature.abs() * max_spike_prob).min(max_spike_prob)
}
