use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::softmax_inplace;

/// One-hidden-layer ReLU classifier with all parameters in a single buffer.
///
/// Layout of `params`: `w1[hidden * input] | b1[hidden] | w2[classes * hidden] | b2[classes]`.
/// Keeping one flat buffer lets the anti-forgetting penalty, Fisher
/// statistics and federated deltas address every parameter by index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedForwardModel {
    pub input_len: usize,
    pub hidden_size: usize,
    pub classes: usize,
    params: Vec<f32>,
}

/// Activations kept from a forward pass for backpropagation.
#[derive(Debug, Clone, Default)]
pub struct ForwardCache {
    hidden_pre: Vec<f32>,
    hidden_act: Vec<f32>,
    pub logits: Vec<f32>,
}

impl FeedForwardModel {
    pub fn new(input_len: usize, hidden_size: usize, classes: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut model = Self {
            input_len,
            hidden_size,
            classes,
            params: vec![0.0; Self::param_count_for(input_len, hidden_size, classes)],
        };
        let scale1 = (2.0 / input_len.max(1) as f32).sqrt();
        for w in model.w1_mut() {
            *w = (rng.random::<f32>() - 0.5) * 2.0 * scale1;
        }
        let scale2 = (2.0 / hidden_size.max(1) as f32).sqrt();
        for w in model.w2_mut() {
            *w = (rng.random::<f32>() - 0.5) * 2.0 * scale2;
        }
        model
    }

    pub fn param_count_for(input_len: usize, hidden_size: usize, classes: usize) -> usize {
        hidden_size * input_len + hidden_size + classes * hidden_size + classes
    }

    pub fn param_count(&self) -> usize {
        self.params.len()
    }

    pub fn params(&self) -> &[f32] {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut [f32] {
        &mut self.params
    }

    pub fn validate(&self) -> Result<(), String> {
        let expected = Self::param_count_for(self.input_len, self.hidden_size, self.classes);
        if self.params.len() != expected {
            return Err(format!(
                "parameter length {} does not match layout ({expected})",
                self.params.len()
            ));
        }
        if self.classes < 2 {
            return Err("Need at least 2 classes".to_string());
        }
        if self.params.iter().any(|p| !p.is_finite()) {
            return Err("parameters contain non-finite values".to_string());
        }
        Ok(())
    }

    fn offsets(&self) -> (usize, usize, usize) {
        let b1 = self.hidden_size * self.input_len;
        let w2 = b1 + self.hidden_size;
        let b2 = w2 + self.classes * self.hidden_size;
        (b1, w2, b2)
    }

    fn w1_mut(&mut self) -> &mut [f32] {
        let (b1, _, _) = self.offsets();
        &mut self.params[..b1]
    }

    fn w2_mut(&mut self) -> &mut [f32] {
        let (_, w2, b2) = self.offsets();
        &mut self.params[w2..b2]
    }

    /// Run the network, leaving activations and logits in `cache`.
    pub fn forward(&self, features: &[f32], cache: &mut ForwardCache) {
        let input = self.input_len;
        let hidden = self.hidden_size;
        let (b1_off, w2_off, b2_off) = self.offsets();
        let p = &self.params;

        cache.hidden_pre.resize(hidden, 0.0);
        cache.hidden_act.resize(hidden, 0.0);
        cache.logits.resize(self.classes, 0.0);

        for h in 0..hidden {
            let row = &p[h * input..(h + 1) * input];
            let sum = p[b1_off + h]
                + row
                    .iter()
                    .zip(features)
                    .map(|(w, x)| w * x)
                    .sum::<f32>();
            cache.hidden_pre[h] = sum;
            cache.hidden_act[h] = sum.max(0.0);
        }
        for c in 0..self.classes {
            let row = &p[w2_off + c * hidden..w2_off + (c + 1) * hidden];
            cache.logits[c] = p[b2_off + c]
                + row
                    .iter()
                    .zip(&cache.hidden_act)
                    .map(|(w, a)| w * a)
                    .sum::<f32>();
        }
    }

    /// Accumulate `scale * dL/dparams` into `grad` given `dL/dlogits`.
    pub fn backward(
        &self,
        features: &[f32],
        cache: &ForwardCache,
        d_logits: &[f32],
        scale: f32,
        grad: &mut [f32],
    ) {
        let input = self.input_len;
        let hidden = self.hidden_size;
        let (b1_off, w2_off, b2_off) = self.offsets();
        let p = &self.params;

        let mut d_hidden = vec![0.0f32; hidden];
        for c in 0..self.classes {
            let dz = d_logits[c] * scale;
            grad[b2_off + c] += dz;
            let base = w2_off + c * hidden;
            for h in 0..hidden {
                grad[base + h] += dz * cache.hidden_act[h];
                d_hidden[h] += dz * p[base + h];
            }
        }
        for h in 0..hidden {
            if cache.hidden_pre[h] <= 0.0 {
                continue;
            }
            grad[b1_off + h] += d_hidden[h];
            let base = h * input;
            for (i, x) in features.iter().enumerate().take(input) {
                grad[base + i] += d_hidden[h] * x;
            }
        }
    }

    pub fn predict_proba(&self, features: &[f32]) -> Vec<f32> {
        if features.len() != self.input_len || self.classes == 0 {
            return Vec::new();
        }
        let mut cache = ForwardCache::default();
        self.forward(features, &mut cache);
        let mut out = vec![0.0; self.classes];
        softmax_inplace(&cache.logits, &mut out);
        out
    }

    pub fn predict_class_index(&self, features: &[f32]) -> usize {
        argmax(&self.predict_proba(features))
    }
}

pub(crate) fn argmax(values: &[f32]) -> usize {
    let mut best = 0usize;
    let mut best_val = f32::NEG_INFINITY;
    for (idx, &v) in values.iter().enumerate() {
        if v > best_val {
            best_val = v;
            best = idx;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probabilities_sum_to_one() {
        let model = FeedForwardModel::new(6, 4, 3, 1);
        let out = model.predict_proba(&[0.1, 0.2, 0.3, 0.4, 0.5, 0.6]);
        assert_eq!(out.len(), 3);
        let sum: f32 = out.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
    }

    #[test]
    fn wrong_feature_length_predicts_nothing() {
        let model = FeedForwardModel::new(6, 4, 3, 1);
        assert!(model.predict_proba(&[0.0; 5]).is_empty());
    }

    #[test]
    fn backward_matches_finite_difference_on_output_bias() {
        let model = FeedForwardModel::new(3, 4, 2, 9);
        let x = [0.5, -0.2, 0.8];
        let mut cache = ForwardCache::default();
        model.forward(&x, &mut cache);
        let mut grad = vec![0.0; model.param_count()];
        model.backward(&x, &cache, &[1.0, 0.0], 1.0, &mut grad);

        // d(logit_0)/d(b2_0) == 1 and d(logit_0)/d(b2_1) == 0.
        let b2 = model.param_count() - 2;
        assert!((grad[b2] - 1.0).abs() < 1e-6);
        assert_eq!(grad[b2 + 1], 0.0);
    }

    #[test]
    fn validate_rejects_layout_mismatch() {
        let mut model = FeedForwardModel::new(3, 2, 2, 0);
        assert!(model.validate().is_ok());
        model.params.pop();
        assert!(model.validate().is_err());
    }
}
