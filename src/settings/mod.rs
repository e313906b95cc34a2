//! Persistent configuration for the training subsystem.
//!
//! Every field carries a serde default so older or partial `vigil.toml`
//! files keep loading as new knobs are added.

mod io;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::resources::ResourceThresholds;
use crate::scheduler::TrainingWindow;

pub use io::{load_from_path, load_or_default, save, save_to_path, settings_path};

/// Default filename used to store the settings.
pub const SETTINGS_FILE_NAME: &str = "vigil.toml";

/// Hard ceiling on the per-step input spike probability.
pub const MAX_SPIKE_PROB: f32 = 0.1;

/// Errors that may occur while loading, validating or saving settings.
#[derive(Debug, Error)]
pub enum SettingsError {
    /// The app directory could not be resolved.
    #[error("Settings directory unavailable: {0}")]
    Directory(#[from] crate::app_dirs::AppDirError),
    /// Failed to read the settings file.
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    /// Failed to write the settings file.
    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    /// Failed to parse TOML.
    #[error("Invalid settings at {path}: {source}")]
    ParseToml {
        path: PathBuf,
        source: toml::de::Error,
    },
    /// Failed to serialize TOML.
    #[error("Failed to serialize settings for {path}: {source}")]
    SerializeToml {
        path: PathBuf,
        source: toml::ser::Error,
    },
    /// Values parsed but are unusable.
    #[error("Invalid setting `{field}`: {message}")]
    Invalid {
        field: &'static str,
        message: String,
    },
}

/// Top-level settings document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VigilSettings {
    #[serde(default)]
    pub resources: ResourceThresholds,
    #[serde(default)]
    pub schedule: ScheduleSettings,
    #[serde(default)]
    pub queue: QueueSettings,
    #[serde(default)]
    pub replay: ReplaySettings,
    #[serde(default)]
    pub model: ModelSettings,
    #[serde(default)]
    pub learner: LearnerSettings,
    #[serde(default)]
    pub spiking: SpikingSettings,
    #[serde(default)]
    pub federated: FederatedSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

impl VigilSettings {
    /// Reject combinations the subsystem cannot run with.
    pub fn validate(&self) -> Result<(), SettingsError> {
        let invalid = |field: &'static str, message: &str| SettingsError::Invalid {
            field,
            message: message.to_string(),
        };
        if self.model.feature_len == 0 {
            return Err(invalid("model.feature_len", "must be positive"));
        }
        if self.model.hidden_size == 0 {
            return Err(invalid("model.hidden_size", "must be positive"));
        }
        if self.model.classes.len() < 2 {
            return Err(invalid("model.classes", "need at least two classes"));
        }
        let mut unique = self.model.classes.clone();
        unique.sort();
        unique.dedup();
        if unique.len() != self.model.classes.len() {
            return Err(invalid("model.classes", "class names must be unique"));
        }
        if self.queue.capacity == 0 {
            return Err(invalid("queue.capacity", "must be positive"));
        }
        if !(self.queue.retention_ratio > 0.0 && self.queue.retention_ratio <= 1.0) {
            return Err(invalid("queue.retention_ratio", "must be in (0, 1]"));
        }
        if self.replay.capacity == 0 {
            return Err(invalid("replay.capacity", "must be positive"));
        }
        if self.spiking.time_steps == 0 {
            return Err(invalid("spiking.time_steps", "must be positive"));
        }
        if !(self.model.max_feature_magnitude > 0.0 && self.model.max_feature_magnitude.is_finite()) {
            return Err(invalid("model.max_feature_magnitude", "must be positive and finite"));
        }
        if !(0.0..=1.0).contains(&self.learner.fisher_decay) {
            return Err(invalid("learner.fisher_decay", "must be in [0, 1]"));
        }
        if self.spiking.tau_ms <= 0.0 {
            return Err(invalid("spiking.tau_ms", "must be positive"));
        }
        if !(self.spiking.max_spike_prob > 0.0 && self.spiking.max_spike_prob <= MAX_SPIKE_PROB) {
            return Err(invalid("spiking.max_spike_prob", "must be in (0, 0.1]"));
        }
        if !(self.spiking.target_rate > 0.0 && self.spiking.target_rate <= 1.0) {
            return Err(invalid("spiking.target_rate", "must be in (0, 1]"));
        }
        let positive = [
            ("spiking.homeostasis_rate", self.spiking.homeostasis_rate),
            ("spiking.w_max", self.spiking.w_max),
        ];
        for (field, value) in positive {
            if !(value > 0.0 && value.is_finite()) {
                return Err(invalid(field, "must be positive and finite"));
            }
        }
        for window in &self.schedule.windows {
            if window.start_hour > 23 || window.end_hour > 24 {
                return Err(invalid("schedule.windows", "hours must be within 0-24"));
            }
        }
        self.federated.validate()?;
        Ok(())
    }
}

/// Session cadence and time-of-day policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleSettings {
    #[serde(default = "default_windows")]
    pub windows: Vec<TrainingWindow>,
    /// How often the service looks for a training opportunity.
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
    /// How often the resource snapshot is refreshed.
    #[serde(default = "default_resource_refresh_secs")]
    pub resource_refresh_secs: u64,
    /// Minimum gap between two sessions.
    #[serde(default = "default_min_session_interval_hours")]
    pub min_session_interval_hours: u64,
    /// Minimum gap before a critical sample may trigger another session.
    #[serde(default = "default_urgent_min_interval_minutes")]
    pub urgent_min_interval_minutes: u64,
    /// Minimum queued samples before a session is considered.
    #[serde(default = "default_min_queued_samples")]
    pub min_queued_samples: usize,
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            windows: default_windows(),
            check_interval_secs: default_check_interval_secs(),
            resource_refresh_secs: default_resource_refresh_secs(),
            min_session_interval_hours: default_min_session_interval_hours(),
            urgent_min_interval_minutes: default_urgent_min_interval_minutes(),
            min_queued_samples: default_min_queued_samples(),
        }
    }
}

fn default_windows() -> Vec<TrainingWindow> {
    crate::scheduler::default_windows()
}

fn default_check_interval_secs() -> u64 {
    300
}

fn default_resource_refresh_secs() -> u64 {
    30
}

fn default_min_session_interval_hours() -> u64 {
    6
}

fn default_urgent_min_interval_minutes() -> u64 {
    30
}

fn default_min_queued_samples() -> usize {
    20
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSettings {
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,
    /// Share of `capacity` kept when the queue overflows.
    #[serde(default = "default_retention_ratio")]
    pub retention_ratio: f32,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            capacity: default_queue_capacity(),
            retention_ratio: default_retention_ratio(),
        }
    }
}

fn default_queue_capacity() -> usize {
    1000
}

fn default_retention_ratio() -> f32 {
    0.8
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplaySettings {
    #[serde(default = "default_replay_capacity")]
    pub capacity: usize,
}

impl Default for ReplaySettings {
    fn default() -> Self {
        Self {
            capacity: default_replay_capacity(),
        }
    }
}

fn default_replay_capacity() -> usize {
    1000
}

/// Shape of the local classifiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSettings {
    /// Length of every feature vector produced by the inference engine.
    #[serde(default = "default_feature_len")]
    pub feature_len: usize,
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,
    /// Label vocabulary; samples with other labels are refused.
    #[serde(default = "default_classes")]
    pub classes: Vec<String>,
    /// Seed for initial weights and sampling.
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Largest absolute feature value accepted at ingestion.
    #[serde(default = "default_max_feature_magnitude")]
    pub max_feature_magnitude: f32,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            feature_len: default_feature_len(),
            hidden_size: default_hidden_size(),
            classes: default_classes(),
            seed: default_seed(),
            max_feature_magnitude: default_max_feature_magnitude(),
        }
    }
}

fn default_feature_len() -> usize {
    32
}

fn default_hidden_size() -> usize {
    24
}

fn default_classes() -> Vec<String> {
    vec!["benign".into(), "suspicious".into(), "malicious".into()]
}

fn default_seed() -> u64 {
    7
}

fn default_max_feature_magnitude() -> f32 {
    1.0e4
}

/// Anti-forgetting coefficients for the incremental learner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearnerSettings {
    /// Weight of the elastic weight consolidation penalty.
    #[serde(default = "default_ewc_lambda")]
    pub ewc_lambda: f32,
    /// Weight of the distillation term against the frozen reference.
    #[serde(default = "default_distill_mu")]
    pub distill_mu: f32,
    #[serde(default = "default_distill_temperature")]
    pub distill_temperature: f32,
    /// Share of the previous Fisher estimate kept when re-estimating.
    #[serde(default = "default_fisher_decay")]
    pub fisher_decay: f32,
}

impl Default for LearnerSettings {
    fn default() -> Self {
        Self {
            ewc_lambda: default_ewc_lambda(),
            distill_mu: default_distill_mu(),
            distill_temperature: default_distill_temperature(),
            fisher_decay: default_fisher_decay(),
        }
    }
}

fn default_ewc_lambda() -> f32 {
    0.1
}

fn default_distill_mu() -> f32 {
    0.3
}

fn default_distill_temperature() -> f32 {
    2.0
}

fn default_fisher_decay() -> f32 {
    0.5
}

/// Spike-timing learner dynamics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpikingSettings {
    #[serde(default = "default_time_steps")]
    pub time_steps: usize,
    #[serde(default = "default_step_ms")]
    pub step_ms: f32,
    /// STDP decay window.
    #[serde(default = "default_tau_ms")]
    pub tau_ms: f32,
    #[serde(default = "default_a_plus")]
    pub a_plus: f32,
    #[serde(default = "default_a_minus")]
    pub a_minus: f32,
    /// Firing rate homeostasis steers toward.
    #[serde(default = "default_target_rate")]
    pub target_rate: f32,
    #[serde(default = "default_homeostasis_rate")]
    pub homeostasis_rate: f32,
    /// Per-step cap on input spike probability.
    #[serde(default = "default_max_spike_prob")]
    pub max_spike_prob: f32,
    #[serde(default = "default_membrane_decay")]
    pub membrane_decay: f32,
    /// Current injected into the label neuron during training.
    #[serde(default = "default_teaching_current")]
    pub teaching_current: f32,
    #[serde(default = "default_w_max")]
    pub w_max: f32,
}

impl Default for SpikingSettings {
    fn default() -> Self {
        Self {
            time_steps: default_time_steps(),
            step_ms: default_step_ms(),
            tau_ms: default_tau_ms(),
            a_plus: default_a_plus(),
            a_minus: default_a_minus(),
            target_rate: default_target_rate(),
            homeostasis_rate: default_homeostasis_rate(),
            max_spike_prob: default_max_spike_prob(),
            membrane_decay: default_membrane_decay(),
            teaching_current: default_teaching_current(),
            w_max: default_w_max(),
        }
    }
}

fn default_time_steps() -> usize {
    100
}

fn default_step_ms() -> f32 {
    1.0
}

fn default_tau_ms() -> f32 {
    20.0
}

fn default_a_plus() -> f32 {
    0.01
}

fn default_a_minus() -> f32 {
    0.0105
}

fn default_target_rate() -> f32 {
    0.05
}

fn default_homeostasis_rate() -> f32 {
    0.5
}

fn default_max_spike_prob() -> f32 {
    MAX_SPIKE_PROB
}

fn default_membrane_decay() -> f32 {
    0.9
}

fn default_teaching_current() -> f32 {
    0.3
}

fn default_w_max() -> f32 {
    1.0
}

/// Opt-in federated contribution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FederatedSettings {
    #[serde(default)]
    pub enabled: bool,
    /// Aggregator URL receiving the JSON payload.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Per-contribution privacy loss.
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,
    #[serde(default = "default_delta")]
    pub delta: f64,
    /// L2 clipping bound, which is also the sensitivity of the delta.
    #[serde(default = "default_clip_norm")]
    pub clip_norm: f64,
    /// Total epsilon this install may ever spend.
    #[serde(default = "default_epsilon_budget")]
    pub epsilon_budget: f64,
    /// Sessions with fewer samples do not contribute.
    #[serde(default = "default_min_contribution_samples")]
    pub min_samples: usize,
}

impl Default for FederatedSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: None,
            epsilon: default_epsilon(),
            delta: default_delta(),
            clip_norm: default_clip_norm(),
            epsilon_budget: default_epsilon_budget(),
            min_samples: default_min_contribution_samples(),
        }
    }
}

impl FederatedSettings {
    fn validate(&self) -> Result<(), SettingsError> {
        let invalid = |field: &'static str, message: String| SettingsError::Invalid { field, message };
        if !(self.epsilon > 0.0) {
            return Err(invalid("federated.epsilon", "must be positive".into()));
        }
        if !(self.delta > 0.0 && self.delta < 1.0) {
            return Err(invalid("federated.delta", "must be in (0, 1)".into()));
        }
        if !(self.clip_norm > 0.0) {
            return Err(invalid("federated.clip_norm", "must be positive".into()));
        }
        if let Some(endpoint) = &self.endpoint {
            let parsed = url::Url::parse(endpoint)
                .map_err(|err| invalid("federated.endpoint", err.to_string()))?;
            if !matches!(parsed.scheme(), "https" | "http") {
                return Err(invalid(
                    "federated.endpoint",
                    format!("unsupported scheme `{}`", parsed.scheme()),
                ));
            }
        }
        Ok(())
    }
}

fn default_epsilon() -> f64 {
    1.0
}

fn default_delta() -> f64 {
    1e-5
}

fn default_clip_norm() -> f64 {
    1.0
}

fn default_epsilon_budget() -> f64 {
    10.0
}

fn default_min_contribution_samples() -> usize {
    50
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
    #[serde(default = "default_true")]
    pub stdout: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
            stdout: true,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    10
}

fn default_true() -> bool {
    true
}
