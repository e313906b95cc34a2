//! Learners that update the local models from a session batch.
//!
//! The feed-forward learner guards against forgetting with replay, an
//! elastic weight consolidation penalty and distillation against the last
//! committed network. The spiking learner applies pair-based STDP with
//! homeostatic thresholds.

pub mod config;
mod ewc;
mod incremental;
mod meta;
mod stdp;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use config::{TrainingConfig, TrainingMode};
pub use ewc::EwcState;
pub use incremental::{Anchors, train_incremental};
pub use meta::{MetaPhaseResult, MetaState, MetaTuner};
pub use stdp::train_stdp;

/// Errors that abort a learner phase.
#[derive(Debug, Error)]
pub enum LearnError {
    #[error("Training batch is empty")]
    EmptyBatch,
    #[error("Feature vector has length {found}, expected {expected}")]
    FeatureLength { expected: usize, found: usize },
    #[error("Label index {label} is outside the {classes} known classes")]
    LabelOutOfRange { label: usize, classes: usize },
    #[error("Consolidation state does not match the model layout")]
    AnchorMismatch,
    #[error("Non-finite {what} during {phase} epoch {epoch}")]
    NonFinite {
        phase: &'static str,
        what: &'static str,
        epoch: usize,
    },
    #[error("Model invalid after {phase}: {message}")]
    InvalidModel {
        phase: &'static str,
        message: String,
    },
}

/// Outcome of the feed-forward phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnPhaseResult {
    /// Composite loss averaged over the final epoch.
    pub loss: f32,
    /// Accuracy on the new samples after training.
    pub accuracy: f32,
    pub per_class_recall: Vec<f32>,
    pub duration: Duration,
    pub samples_processed: usize,
    /// Replay draws mixed in over all epochs.
    pub replay_samples: usize,
}

/// Outcome of the spiking phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnnPhaseResult {
    pub accuracy: f32,
    pub duration: Duration,
    pub spike_count: u64,
    pub samples_processed: usize,
}

fn check_batch(
    batch: &[crate::replay::ReplayEntry],
    feature_len: usize,
    classes: usize,
) -> Result<(), LearnError> {
    if batch.is_empty() {
        return Err(LearnError::EmptyBatch);
    }
    for entry in batch {
        if entry.features.len() != feature_len {
            return Err(LearnError::FeatureLength {
                expected: feature_len,
                found: entry.features.len(),
            });
        }
        if entry.features.iter().any(|x| !x.is_finite()) {
            return Err(LearnError::NonFinite {
                phase: "input",
                what: "features",
                epoch: 0,
            });
        }
        if entry.label >= classes {
            return Err(LearnError::LabelOutOfRange {
                label: entry.label,
                classes,
            });
        }
    }
    Ok(())
}
