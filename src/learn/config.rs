use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Training intensity chosen from the device's resource headroom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingMode {
    Light,
    Balanced,
    Intensive,
}

/// Immutable per-mode session budget and optimizer settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub mode: TrainingMode,
    pub max_battery_drain_percent: f32,
    pub max_memory_mb: u64,
    pub max_duration: Duration,
    pub min_samples: usize,
    pub learning_rate: f32,
    pub batch_size: usize,
    pub epochs: usize,
    /// Most queued samples a single session consumes.
    pub max_session_samples: usize,
}

const LIGHT: TrainingConfig = TrainingConfig {
    mode: TrainingMode::Light,
    max_battery_drain_percent: 1.0,
    max_memory_mb: 64,
    max_duration: Duration::from_secs(5 * 60),
    min_samples: 20,
    learning_rate: 1e-4,
    batch_size: 4,
    epochs: 1,
    max_session_samples: 200,
};

const BALANCED: TrainingConfig = TrainingConfig {
    mode: TrainingMode::Balanced,
    max_battery_drain_percent: 2.0,
    max_memory_mb: 128,
    max_duration: Duration::from_secs(10 * 60),
    min_samples: 50,
    learning_rate: 1e-3,
    batch_size: 8,
    epochs: 3,
    max_session_samples: 500,
};

const INTENSIVE: TrainingConfig = TrainingConfig {
    mode: TrainingMode::Intensive,
    max_battery_drain_percent: 5.0,
    max_memory_mb: 256,
    max_duration: Duration::from_secs(20 * 60),
    min_samples: 100,
    learning_rate: 1e-2,
    batch_size: 16,
    epochs: 5,
    max_session_samples: 1000,
};

impl TrainingMode {
    pub const ALL: [TrainingMode; 3] = [
        TrainingMode::Light,
        TrainingMode::Balanced,
        TrainingMode::Intensive,
    ];

    pub fn config(self) -> &'static TrainingConfig {
        match self {
            Self::Light => &LIGHT,
            Self::Balanced => &BALANCED,
            Self::Intensive => &INTENSIVE,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Light => "light",
            Self::Balanced => "balanced",
            Self::Intensive => "intensive",
        }
    }

    /// The spiking phase is skipped in light mode.
    pub fn runs_spiking_phase(self) -> bool {
        self != Self::Light
    }

    pub fn runs_meta_phase(self) -> bool {
        self == Self::Intensive
    }
}

impl fmt::Display for TrainingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TrainingConfig {
    /// Samples that fit the mode's memory budget, given the model size.
    pub fn memory_sample_cap(&self, feature_len: usize, param_count: usize) -> usize {
        const BYTES_PER_F32: usize = 4;
        // Live params, reference copy, gradient, Fisher and optimal params.
        let model_bytes = param_count.saturating_mul(BYTES_PER_F32 * 5);
        let budget = (self.max_memory_mb as usize) * 1024 * 1024;
        let per_sample = (feature_len.max(1) + 16) * BYTES_PER_F32 * 2;
        budget.saturating_sub(model_bytes) / per_sample
    }
}
