use serde::{Deserialize, Serialize};

use crate::ml::{FeedForwardModel, ForwardCache, softmax_inplace};

/// Upper bound on a single Fisher entry. Keeps the penalty finite and the
/// consolidation pull stable at every mode's learning rate.
pub const MAX_FISHER: f32 = 100.0;

/// Elastic weight consolidation statistics for the feed-forward network.
///
/// `fisher[i]` is the diagonal Fisher information of parameter `i` and
/// `optimal[i]` its value at the last committed checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EwcState {
    pub fisher: Vec<f32>,
    pub optimal: Vec<f32>,
}

impl EwcState {
    /// No importance yet; the penalty is zero until the first session commits.
    pub fn empty(model: &FeedForwardModel) -> Self {
        Self {
            fisher: vec![0.0; model.param_count()],
            optimal: model.params().to_vec(),
        }
    }

    pub fn matches(&self, model: &FeedForwardModel) -> bool {
        self.fisher.len() == model.param_count() && self.optimal.len() == model.param_count()
    }

    pub fn is_finite(&self) -> bool {
        self.fisher.iter().chain(&self.optimal).all(|v| v.is_finite())
    }

    /// `0.5 * sum(F_i * (theta_i - theta*_i)^2)`.
    pub fn penalty(&self, params: &[f32]) -> f32 {
        0.5 * params
            .iter()
            .zip(&self.optimal)
            .zip(&self.fisher)
            .map(|((p, o), f)| f * (p - o) * (p - o))
            .sum::<f32>()
    }

    /// Add `lambda * dPenalty/dtheta` into `grad`.
    pub fn add_gradient(&self, params: &[f32], lambda: f32, grad: &mut [f32]) {
        for (((g, p), o), f) in grad
            .iter_mut()
            .zip(params)
            .zip(&self.optimal)
            .zip(&self.fisher)
        {
            *g += lambda * f * (p - o);
        }
    }

    /// Re-estimate the Fisher diagonal on `samples` and anchor to the
    /// model's current parameters.
    pub fn consolidate(&mut self, model: &FeedForwardModel, samples: &[(&[f32], usize)], decay: f32) {
        let fresh = estimate_fisher(model, samples);
        let decay = decay.clamp(0.0, 1.0);
        if self.fisher.len() != fresh.len() {
            self.fisher = fresh;
        } else {
            for (old, new) in self.fisher.iter_mut().zip(fresh) {
                *old = decay * *old + (1.0 - decay) * new;
            }
        }
        self.optimal = model.params().to_vec();
    }
}

/// Mean squared gradient of the log-likelihood of the true label.
///
/// Squares are summed in f64 and each entry is capped at [`MAX_FISHER`];
/// non-finite gradients contribute the cap.
fn estimate_fisher(model: &FeedForwardModel, samples: &[(&[f32], usize)]) -> Vec<f32> {
    if samples.is_empty() {
        return vec![0.0; model.param_count()];
    }
    let mut sums = vec![0.0f64; model.param_count()];
    let mut cache = ForwardCache::default();
    let mut probs = vec![0.0f32; model.classes];
    let mut grad = vec![0.0f32; model.param_count()];
    for &(features, label) in samples {
        model.forward(features, &mut cache);
        softmax_inplace(&cache.logits, &mut probs);
        let d_logits: Vec<f32> = probs
            .iter()
            .enumerate()
            .map(|(c, p)| if c == label { p - 1.0 } else { *p })
            .collect();
        grad.iter_mut().for_each(|g| *g = 0.0);
        model.backward(features, &cache, &d_logits, 1.0, &mut grad);
        for (sum, g) in sums.iter_mut().zip(&grad) {
            let g = f64::from(*g);
            *sum += if g.is_finite() { g * g } else { f64::from(MAX_FISHER) };
        }
    }
    let n = samples.len() as f64;
    sums.into_iter()
        .map(|sum| {
            let mean = sum / n;
            if mean.is_finite() {
                mean.min(f64::from(MAX_FISHER)) as f32
            } else {
                MAX_FISHER
            }
        })
        .collect()
}
