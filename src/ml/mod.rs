//! Local classifier families trained on-device.
//!
//! [`ModelState`] is the complete learnable state the inference engine reads:
//! a feed-forward network and a rate-coded spiking network over the same
//! feature vectors and class vocabulary.

mod feedforward;
pub mod metrics;
mod spiking;

use serde::{Deserialize, Serialize};

use feedforward::argmax;
pub use feedforward::{FeedForwardModel, ForwardCache};
pub use spiking::{INITIAL_THRESHOLD, MIN_THRESHOLD, SpikingModel, spike_probability};

use crate::settings::{ModelSettings, SpikingSettings};

/// Both classifier families plus the class vocabulary they share.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelState {
    pub classes: Vec<String>,
    pub ann: FeedForwardModel,
    pub snn: SpikingModel,
}

impl ModelState {
    pub fn initial(model: &ModelSettings, spiking: &SpikingSettings) -> Self {
        let classes = model.classes.len();
        Self {
            classes: model.classes.clone(),
            ann: FeedForwardModel::new(model.feature_len, model.hidden_size, classes, model.seed),
            snn: SpikingModel::new(model.feature_len, classes, spiking.w_max, model.seed),
        }
    }

    pub fn feature_len(&self) -> usize {
        self.ann.input_len
    }

    pub fn class_index(&self, label: &str) -> Option<usize> {
        self.classes.iter().position(|class| class == label)
    }

    /// Predicted class name from the feed-forward network.
    pub fn classify(&self, features: &[f32]) -> Option<&str> {
        if features.len() != self.feature_len() {
            return None;
        }
        self.classes
            .get(self.ann.predict_class_index(features))
            .map(String::as_str)
    }

    /// Predicted class name from the spiking network's rate readout.
    pub fn classify_spiking(&self, features: &[f32], max_spike_prob: f32) -> Option<&str> {
        if features.len() != self.feature_len() {
            return None;
        }
        let response = self.snn.rate_response(features, max_spike_prob);
        self.classes.get(argmax(&response)).map(String::as_str)
    }

    pub fn validate(&self) -> Result<(), String> {
        self.ann.validate()?;
        self.snn.validate()?;
        if self.ann.classes != self.classes.len() || self.snn.outputs != self.classes.len() {
            return Err("class count differs between models and vocabulary".to_string());
        }
        if self.snn.inputs != self.ann.input_len {
            return Err("feature length differs between models".to_string());
        }
        Ok(())
    }
}

pub(crate) fn softmax_inplace(raw: &[f32], out: &mut [f32]) {
    if raw.is_empty() || out.is_empty() {
        return;
    }
    let max = raw
        .iter()
        .copied()
        .fold(f32::NEG_INFINITY, |a, b| a.max(b));
    let mut sum = 0.0f32;
    for (o, &v) in out.iter_mut().zip(raw) {
        let e = (v - max).exp();
        *o = e;
        sum += e;
    }
    if sum == 0.0 {
        let uniform = 1.0 / (raw.len() as f32);
        out.iter_mut().for_each(|v| *v = uniform);
        return;
    }
    out.iter_mut().for_each(|v| *v /= sum);
}

/// Softmax of `raw / temperature`.
pub(crate) fn softmax_with_temperature(raw: &[f32], temperature: f32, out: &mut [f32]) {
    let t = temperature.max(1e-3);
    let scaled: Vec<f32> = raw.iter().map(|v| v / t).collect();
    softmax_inplace(&scaled, out);
}
