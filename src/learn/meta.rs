use serde::{Deserialize, Serialize};

use crate::settings::LearnerSettings;

const LR_SCALE_RANGE: (f32, f32) = (0.25, 4.0);
/// Coefficients may move within this factor of their configured value.
const COEFFICIENT_SPAN: f32 = 2.0;

/// Hyper-parameters adapted across intensive sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaState {
    /// Multiplier on the mode's learning rate.
    pub lr_scale: f32,
    pub ewc_lambda: f32,
    pub distill_mu: f32,
    /// Composite loss of the last intensive session.
    pub last_loss: Option<f32>,
    pub adaptations: u32,
}

impl MetaState {
    pub fn from_settings(settings: &LearnerSettings) -> Self {
        Self {
            lr_scale: 1.0,
            ewc_lambda: settings.ewc_lambda,
            distill_mu: settings.distill_mu,
            last_loss: None,
            adaptations: 0,
        }
    }
}

/// Result of the meta-parameter phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaPhaseResult {
    pub lr_scale: f32,
    pub ewc_lambda: f32,
    pub distill_mu: f32,
    /// Change in composite loss since the previous adaptation; `None` on the first.
    pub loss_delta: Option<f32>,
}

/// Adjusts [`MetaState`] from the loss trajectory.
///
/// Improving loss speeds learning up and relaxes the anti-forgetting terms;
/// worsening loss slows it down and tightens them.
#[derive(Debug, Clone)]
pub struct MetaTuner {
    base_lambda: f32,
    base_mu: f32,
}

impl MetaTuner {
    pub fn new(settings: &LearnerSettings) -> Self {
        Self {
            base_lambda: settings.ewc_lambda,
            base_mu: settings.distill_mu,
        }
    }

    pub fn adapt(&self, meta: &mut MetaState, session_loss: f32) -> MetaPhaseResult {
        let loss_delta = meta.last_loss.map(|previous| session_loss - previous);
        match loss_delta {
            Some(delta) if delta < 0.0 => {
                meta.lr_scale *= 1.1;
                meta.ewc_lambda *= 0.95;
                meta.distill_mu *= 0.95;
            }
            Some(_) => {
                meta.lr_scale *= 0.7;
                meta.ewc_lambda *= 1.2;
                meta.distill_mu *= 1.1;
            }
            None => {}
        }
        meta.lr_scale = meta.lr_scale.clamp(LR_SCALE_RANGE.0, LR_SCALE_RANGE.1);
        meta.ewc_lambda = clamp_around(meta.ewc_lambda, self.base_lambda);
        meta.distill_mu = clamp_around(meta.distill_mu, self.base_mu);
        meta.last_loss = Some(session_loss);
        meta.adaptations += 1;
        MetaPhaseResult {
            lr_scale: meta.lr_scale,
            ewc_lambda: meta.ewc_lambda,
            distill_mu: meta.distill_mu,
            loss_delta,
        }
    }
}

fn clamp_around(value: f32, base: f32) -> f32 {
    if base <= 0.0 {
        return base.max(0.0);
    }
    value.clamp(base / COEFFICIENT_SPAN, base * COEFFICIENT_SPAN)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn improving_loss_raises_learning_rate() {
        let settings = LearnerSettings::default();
        let tuner = MetaTuner::new(&settings);
        let mut meta = MetaState::from_settings(&settings);

        let first = tuner.adapt(&mut meta, 1.0);
        assert_eq!(first.loss_delta, None);
        assert_eq!(meta.lr_scale, 1.0);

        let second = tuner.adapt(&mut meta, 0.8);
        assert!(second.loss_delta.unwrap() < 0.0);
        assert!(meta.lr_scale > 1.0);
        assert!(meta.ewc_lambda < settings.ewc_lambda);
    }

    #[test]
    fn worsening_loss_tightens_within_bounds() {
        let settings = LearnerSettings::default();
        let tuner = MetaTuner::new(&settings);
        let mut meta = MetaState::from_settings(&settings);
        let mut loss = 1.0;
        for _ in 0..20 {
            tuner.adapt(&mut meta, loss);
            loss += 0.5;
        }
        assert_eq!(meta.lr_scale, LR_SCALE_RANGE.0);
        assert!((meta.ewc_lambda - settings.ewc_lambda * COEFFICIENT_SPAN).abs() < 1e-6);
        assert!(meta.distill_mu <= settings.distill_mu * COEFFICIENT_SPAN + 1e-6);
        assert_eq!(meta.adaptations, 20);
    }
}
