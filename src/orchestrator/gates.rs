use std::fmt;

use time::{Duration, OffsetDateTime};

use crate::learn::TrainingMode;
use crate::resources::{ResourceGate, ResourceSnapshot, ResourceThresholds};

/// Why a session did not start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateReason {
    Resource(ResourceGate),
    TrainedTooRecently,
    InsufficientData,
    OutsideWindow,
    AlreadyTraining,
}

impl GateReason {
    pub fn reason(self) -> &'static str {
        match self {
            Self::Resource(gate) => gate.reason(),
            Self::TrainedTooRecently => "Trained too recently",
            Self::InsufficientData => "Insufficient training data",
            Self::OutsideWindow => "Outside training window",
            Self::AlreadyTraining => "Training already in progress",
        }
    }
}

impl fmt::Display for GateReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.reason())
    }
}

/// Inputs to the ordered eligibility check.
#[derive(Debug, Clone, Copy)]
pub(crate) struct GateInputs<'a> {
    pub thresholds: &'a ResourceThresholds,
    pub snapshot: &'a ResourceSnapshot,
    pub now: OffsetDateTime,
    pub last_training: Option<OffsetDateTime>,
    /// Shorter for urgent attempts than for scheduled or manual ones.
    pub min_interval: Duration,
    pub queued: usize,
    pub min_queued: usize,
}

/// Resource gates, then time since the last session, then queue size.
/// Returns the mode to train in, or the first gate that fails.
pub(crate) fn evaluate(inputs: GateInputs<'_>) -> Result<TrainingMode, GateReason> {
    if let Some(gate) = inputs.thresholds.first_failing(inputs.snapshot) {
        return Err(GateReason::Resource(gate));
    }
    if let Some(last) = inputs.last_training
        && inputs.now - last < inputs.min_interval
    {
        return Err(GateReason::TrainedTooRecently);
    }
    if inputs.queued < inputs.min_queued {
        return Err(GateReason::InsufficientData);
    }
    inputs
        .thresholds
        .mode_for(inputs.snapshot)
        .ok_or(GateReason::Resource(ResourceGate::BatterySufficient))
}

/// Duration and battery limits checked between phases.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SessionBudget {
    pub max_duration: std::time::Duration,
    pub start_battery: f32,
    pub max_drain_percent: f32,
}

impl SessionBudget {
    pub fn exhausted(&self, elapsed: std::time::Duration, battery_now: f32) -> bool {
        elapsed >= self.max_duration || self.start_battery - battery_now >= self.max_drain_percent
    }
}
