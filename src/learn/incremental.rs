use std::time::Instant;

use rand::Rng;

use super::{AnnPhaseResult, EwcState, LearnError, MetaState, TrainingConfig, check_batch};
use crate::ml::metrics::{ConfusionMatrix, accuracy, recall_by_class};
use crate::ml::{FeedForwardModel, ForwardCache, softmax_inplace, softmax_with_temperature};
use crate::replay::{ReplayBuffer, ReplayEntry};

const PROB_FLOOR: f32 = 1e-12;

/// State the feed-forward learner is pulled back toward.
pub struct Anchors<'a> {
    /// Frozen network from the last committed checkpoint.
    pub reference: &'a FeedForwardModel,
    pub ewc: &'a EwcState,
    /// Supplies the learning-rate scale and loss coefficients.
    pub meta: &'a MetaState,
    pub temperature: f32,
}

/// Train `model` on `batch` mixed with replayed examples.
///
/// Loss per example is cross-entropy plus `mu * T^2 * KL(q_ref || q_cur)`;
/// the epoch loss adds `lambda * ewc_penalty`. Gradients accumulate over the
/// epoch's mini-batches and one step is taken per epoch. The new batch is
/// appended to `replay` only when every epoch succeeds.
pub fn train_incremental<R: Rng + ?Sized>(
    model: &mut FeedForwardModel,
    batch: &[ReplayEntry],
    replay: &mut ReplayBuffer,
    anchors: &Anchors<'_>,
    config: &TrainingConfig,
    rng: &mut R,
) -> Result<AnnPhaseResult, LearnError> {
    let started = Instant::now();
    check_batch(batch, model.input_len, model.classes)?;
    if !anchors.ewc.matches(model) || anchors.reference.param_count() != model.param_count() {
        return Err(LearnError::AnchorMismatch);
    }

    let lr = config.learning_rate * anchors.meta.lr_scale;
    let lambda = anchors.meta.ewc_lambda;
    let mu = anchors.meta.distill_mu;
    let temperature = anchors.temperature.max(1e-3);
    let batch_size = config.batch_size.max(1);
    let replay_per_batch = batch_size / 2;

    let mut scratch = Scratch::new(model.classes);
    let mut grad = vec![0.0f32; model.param_count()];
    let mut final_loss = 0.0f32;
    let mut replay_samples = 0usize;

    for epoch in 0..config.epochs.max(1) {
        grad.fill(0.0);
        let mut loss_sum = 0.0f32;
        let mut seen = 0usize;
        for chunk in batch.chunks(batch_size) {
            let drawn: Vec<ReplayEntry> = replay
                .sample(replay_per_batch, rng)
                .into_iter()
                .cloned()
                .collect();
            replay_samples += drawn.len();
            for entry in chunk.iter().chain(drawn.iter()) {
                let loss = scratch.accumulate(model, anchors.reference, entry, mu, temperature, &mut grad);
                if !loss.is_finite() {
                    return Err(non_finite("loss", epoch));
                }
                loss_sum += loss;
                seen += 1;
            }
        }

        let n = seen as f32;
        grad.iter_mut().for_each(|g| *g /= n);
        anchors.ewc.add_gradient(model.params(), lambda, &mut grad);
        let loss = loss_sum / n + lambda * anchors.ewc.penalty(model.params());
        if !loss.is_finite() {
            return Err(non_finite("loss", epoch));
        }
        if grad.iter().any(|g| !g.is_finite()) {
            return Err(non_finite("gradient", epoch));
        }
        for (param, g) in model.params_mut().iter_mut().zip(&grad) {
            *param -= lr * g;
        }
        if model.params().iter().any(|p| !p.is_finite()) {
            return Err(non_finite("parameters", epoch));
        }
        final_loss = loss;
        tracing::debug!(epoch, loss, samples = seen, "feed-forward epoch");
    }

    let mut confusion = ConfusionMatrix::new(model.classes);
    for entry in batch {
        confusion.add(entry.label, model.predict_class_index(&entry.features));
    }
    replay.extend(batch.iter().cloned());

    Ok(AnnPhaseResult {
        loss: final_loss,
        accuracy: accuracy(&confusion),
        per_class_recall: recall_by_class(&confusion),
        duration: started.elapsed(),
        samples_processed: batch.len(),
        replay_samples,
    })
}

fn non_finite(what: &'static str, epoch: usize) -> LearnError {
    LearnError::NonFinite {
        phase: "feed-forward",
        what,
        epoch,
    }
}

/// Per-example buffers reused across the session.
struct Scratch {
    cache: ForwardCache,
    reference_cache: ForwardCache,
    probs: Vec<f32>,
    soft_current: Vec<f32>,
    soft_reference: Vec<f32>,
    d_logits: Vec<f32>,
}

impl Scratch {
    fn new(classes: usize) -> Self {
        Self {
            cache: ForwardCache::default(),
            reference_cache: ForwardCache::default(),
            probs: vec![0.0; classes],
            soft_current: vec![0.0; classes],
            soft_reference: vec![0.0; classes],
            d_logits: vec![0.0; classes],
        }
    }

    /// Add one example's gradient into `grad` and return its loss.
    fn accumulate(
        &mut self,
        model: &FeedForwardModel,
        reference: &FeedForwardModel,
        entry: &ReplayEntry,
        mu: f32,
        temperature: f32,
        grad: &mut [f32],
    ) -> f32 {
        model.forward(&entry.features, &mut self.cache);
        if self.cache.logits.iter().any(|v| !v.is_finite()) {
            return f32::NAN;
        }
        reference.forward(&entry.features, &mut self.reference_cache);
        softmax_inplace(&self.cache.logits, &mut self.probs);
        softmax_with_temperature(&self.cache.logits, temperature, &mut self.soft_current);
        softmax_with_temperature(&self.reference_cache.logits, temperature, &mut self.soft_reference);

        let task = -self.probs[entry.label].max(PROB_FLOOR).ln();
        let distill = kl_divergence(&self.soft_reference, &self.soft_current);
        for (c, d) in self.d_logits.iter_mut().enumerate() {
            let target = if c == entry.label { 1.0 } else { 0.0 };
            *d = self.probs[c] - target
                + mu * temperature * (self.soft_current[c] - self.soft_reference[c]);
        }
        model.backward(&entry.features, &self.cache, &self.d_logits, 1.0, grad);
        task + mu * temperature * temperature * distill
    }
}

/// `KL(p || q)`; zero-probability terms of `p` contribute nothing.
fn kl_divergence(p: &[f32], q: &[f32]) -> f32 {
    p.iter()
        .zip(q)
        .filter(|(pi, _)| **pi > 0.0)
        .map(|(pi, qi)| pi * (pi.ln() - qi.max(PROB_FLOOR).ln()))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::learn::TrainingMode;
    use crate::settings::LearnerSettings;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use time::OffsetDateTime;

    fn entry(features: Vec<f32>, label: usize) -> ReplayEntry {
        ReplayEntry {
            features,
            label,
            timestamp: OffsetDateTime::UNIX_EPOCH,
        }
    }

    fn toy_batch() -> Vec<ReplayEntry> {
        (0..8)
            .map(|i| {
                if i % 2 == 0 {
                    entry(vec![1.0, 0.0], 0)
                } else {
                    entry(vec![0.0, 1.0], 1)
                }
            })
            .collect()
    }

    fn free_meta() -> MetaState {
        MetaState {
            lr_scale: 1.0,
            ewc_lambda: 0.0,
            distill_mu: 0.0,
            last_loss: None,
            adaptations: 0,
        }
    }

    #[test]
    fn learns_a_separable_problem() {
        let mut model = FeedForwardModel::new(2, 8, 2, 11);
        let reference = model.clone();
        let ewc = EwcState::empty(&model);
        let meta = free_meta();
        let anchors = Anchors {
            reference: &reference,
            ewc: &ewc,
            meta: &meta,
            temperature: 2.0,
        };
        let config = TrainingConfig {
            learning_rate: 0.5,
            epochs: 200,
            ..*TrainingMode::Light.config()
        };
        let mut replay = ReplayBuffer::new(100);
        let mut rng = StdRng::seed_from_u64(1);
        let batch = toy_batch();

        let result =
            train_incremental(&mut model, &batch, &mut replay, &anchors, &config, &mut rng).unwrap();
        assert_eq!(result.accuracy, 1.0);
        assert_eq!(result.samples_processed, 8);
        assert_eq!(replay.len(), 8);
        assert!(result.loss < std::f32::consts::LN_2);
    }

    #[test]
    fn replay_is_mixed_into_later_sessions() {
        let mut model = FeedForwardModel::new(2, 4, 2, 3);
        let reference = model.clone();
        let ewc = EwcState::empty(&model);
        let meta = MetaState::from_settings(&LearnerSettings::default());
        let anchors = Anchors {
            reference: &reference,
            ewc: &ewc,
            meta: &meta,
            temperature: 2.0,
        };
        let config = TrainingMode::Light.config();
        let mut replay = ReplayBuffer::new(100);
        let mut rng = StdRng::seed_from_u64(2);
        let batch = toy_batch();

        let first = train_incremental(&mut model, &batch, &mut replay, &anchors, config, &mut rng).unwrap();
        assert_eq!(first.replay_samples, 0);
        let second = train_incremental(&mut model, &batch, &mut replay, &anchors, config, &mut rng).unwrap();
        // Two mini-batches of four, each drawing two replayed examples.
        assert_eq!(second.replay_samples, 4);
        assert_eq!(replay.len(), 16);
    }

    #[test]
    fn distillation_vanishes_when_models_agree() {
        let p = [0.2, 0.3, 0.5];
        assert!(kl_divergence(&p, &p).abs() < 1e-7);
        assert!(kl_divergence(&[1.0, 0.0, 0.0], &p) > 0.0);
    }

    #[test]
    fn overflowing_activations_abort_without_touching_replay() {
        let mut model = FeedForwardModel::new(1, 8, 2, 5);
        model.params_mut().fill(0.5);
        let reference = model.clone();
        let ewc = EwcState::empty(&model);
        let meta = MetaState::from_settings(&LearnerSettings::default());
        let anchors = Anchors {
            reference: &reference,
            ewc: &ewc,
            meta: &meta,
            temperature: 2.0,
        };
        let mut replay = ReplayBuffer::new(10);
        let mut rng = StdRng::seed_from_u64(0);
        let batch = vec![entry(vec![f32::MAX], 0), entry(vec![f32::MAX], 1)];

        let err = train_incremental(
            &mut model,
            &batch,
            &mut replay,
            &anchors,
            TrainingMode::Light.config(),
            &mut rng,
        )
        .unwrap_err();
        assert!(matches!(err, LearnError::NonFinite { .. }));
        assert!(replay.is_empty());
    }

    #[test]
    fn rejects_unknown_labels_and_wrong_lengths() {
        let mut model = FeedForwardModel::new(2, 4, 2, 3);
        let reference = model.clone();
        let ewc = EwcState::empty(&model);
        let meta = free_meta();
        let anchors = Anchors {
            reference: &reference,
            ewc: &ewc,
            meta: &meta,
            temperature: 2.0,
        };
        let config = TrainingMode::Light.config();
        let mut replay = ReplayBuffer::new(10);
        let mut rng = StdRng::seed_from_u64(0);

        let bad_label = [entry(vec![0.0, 1.0], 5)];
        assert!(matches!(
            train_incremental(&mut model, &bad_label, &mut replay, &anchors, config, &mut rng),
            Err(LearnError::LabelOutOfRange { label: 5, .. })
        ));
        let bad_len = [entry(vec![0.0], 0)];
        assert!(matches!(
            train_incremental(&mut model, &bad_len, &mut replay, &anchors, config, &mut rng),
            Err(LearnError::FeatureLength { expected: 2, found: 1 })
        ));
        assert!(matches!(
            train_incremental(&mut model, &[], &mut replay, &anchors, config, &mut rng),
            Err(LearnError::EmptyBatch)
        ));
    }
}
