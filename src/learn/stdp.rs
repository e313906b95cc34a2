use std::time::Instant;

use rand::Rng;

use super::{LearnError, SnnPhaseResult, TrainingConfig, check_batch};
use crate::ml::{MIN_THRESHOLD, SpikingModel, spike_probability};
use crate::replay::ReplayEntry;
use crate::settings::SpikingSettings;

/// Learning rate the STDP amplitudes are calibrated for.
const REFERENCE_LEARNING_RATE: f32 = 1e-3;

/// Present each example as a rate-coded spike train and adapt the weights
/// with trace-based pair STDP.
///
/// A pre spike depresses each synapse by `a_minus` times the post trace and a
/// post spike potentiates it by `a_plus` times the pre trace; traces decay
/// with `exp(-step/tau)`. Weights are updated in place and clamped to
/// `[0, w_max]`. After every example each threshold moves toward the target
/// firing rate.
pub fn train_stdp<R: Rng + ?Sized>(
    model: &mut SpikingModel,
    batch: &[ReplayEntry],
    settings: &SpikingSettings,
    config: &TrainingConfig,
    rng: &mut R,
) -> Result<SnnPhaseResult, LearnError> {
    let started = Instant::now();
    check_batch(batch, model.inputs, model.outputs)?;

    let steps = settings.time_steps.max(1);
    let trace_decay = (-settings.step_ms / settings.tau_ms.max(f32::EPSILON)).exp();
    let amplitude = config.learning_rate / REFERENCE_LEARNING_RATE;
    let a_plus = settings.a_plus * amplitude;
    let a_minus = settings.a_minus * amplitude;
    let expected = (2.0 * settings.target_rate * steps as f32).round().max(1.0);

    let mut membrane = vec![0.0f32; model.outputs];
    let mut pre_trace = vec![0.0f32; model.inputs];
    let mut post_trace = vec![0.0f32; model.outputs];
    let mut counts = vec![0u32; model.outputs];
    let mut pre_spikes: Vec<usize> = Vec::with_capacity(model.inputs);
    let mut probabilities = vec![0.0f32; model.inputs];
    let mut spike_count = 0u64;
    let mut proximity_sum = 0.0f32;

    for entry in batch {
        membrane.fill(0.0);
        pre_trace.fill(0.0);
        post_trace.fill(0.0);
        counts.fill(0);
        for (p, x) in probabilities.iter_mut().zip(&entry.features) {
            *p = spike_probability(*x, settings.max_spike_prob);
        }

        for _ in 0..steps {
            pre_trace.iter_mut().for_each(|t| *t *= trace_decay);
            post_trace.iter_mut().for_each(|t| *t *= trace_decay);

            pre_spikes.clear();
            for (pre, p) in probabilities.iter().enumerate() {
                if *p > 0.0 && rng.random::<f32>() < *p {
                    pre_spikes.push(pre);
                }
            }
            for &pre in &pre_spikes {
                pre_trace[pre] += 1.0;
                for post in 0..model.outputs {
                    let w = &mut model.weights[post * model.inputs + pre];
                    *w = (*w - a_minus * post_trace[post]).clamp(0.0, settings.w_max);
                }
            }

            for post in 0..model.outputs {
                let row = &model.weights[post * model.inputs..(post + 1) * model.inputs];
                let drive: f32 = pre_spikes.iter().map(|&pre| row[pre]).sum();
                let teaching = if post == entry.label {
                    settings.teaching_current
                } else {
                    0.0
                };
                membrane[post] = settings.membrane_decay * membrane[post] + drive + teaching;
                if membrane[post] < model.thresholds[post] {
                    continue;
                }
                membrane[post] = 0.0;
                counts[post] += 1;
                post_trace[post] += 1.0;
                let row = &mut model.weights[post * model.inputs..(post + 1) * model.inputs];
                for (w, trace) in row.iter_mut().zip(&pre_trace) {
                    *w = (*w + a_plus * trace).clamp(0.0, settings.w_max);
                }
            }
        }

        for (threshold, count) in model.thresholds.iter_mut().zip(&counts) {
            let rate = *count as f32 / steps as f32;
            *threshold = (*threshold + settings.homeostasis_rate * (rate - settings.target_rate))
                .max(MIN_THRESHOLD);
        }
        spike_count += counts.iter().map(|c| u64::from(*c)).sum::<u64>();
        proximity_sum += count_proximity(counts[entry.label] as f32, expected);
    }

    if model.weights.iter().chain(&model.thresholds).any(|v| !v.is_finite()) {
        return Err(LearnError::NonFinite {
            phase: "spiking",
            what: "weights",
            epoch: 0,
        });
    }
    model.validate().map_err(|message| LearnError::InvalidModel {
        phase: "spiking",
        message,
    })?;

    let accuracy = proximity_sum / batch.len() as f32;
    tracing::debug!(spike_count, accuracy, samples = batch.len(), "spiking phase");
    Ok(SnnPhaseResult {
        accuracy,
        duration: started.elapsed(),
        spike_count,
        samples_processed: batch.len(),
    })
}

/// 1.0 when `count == expected`, falling toward 0 as they diverge.
fn count_proximity(count: f32, expected: f32) -> f32 {
    let scale = count.max(expected);
    if scale <= 0.0 {
        return 1.0;
    }
    1.0 - (count - expected).abs() / scale
}
