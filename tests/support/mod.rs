#![allow(dead_code)]

pub mod vigil_env;

use std::sync::{Arc, Mutex};

use time::OffsetDateTime;
use time::macros::datetime;
use vigil::checkpoint::{CheckpointManager, TrainableState};
use vigil::clock::{Clock, ManualClock};
use vigil::federated::{FederatedClient, FederatedError, FederatedTransport, FederatedUpdate};
use vigil::history::TrainingHistory;
use vigil::orchestrator::{OrchestratorParts, TrainingOrchestrator};
use vigil::queue::Priority;
use vigil::resources::{ResourceMonitor, ResourceReading, StaticProbe};
use vigil::settings::VigilSettings;

/// Noon: outside both default training windows.
pub const NOON: OffsetDateTime = datetime!(2026-03-02 12:00 UTC);

/// Unplugged at 70 % with 800 MB free: every gate passes and Balanced is
/// the heaviest affordable mode.
pub fn balanced_reading() -> ResourceReading {
    ResourceReading {
        battery_percent: 70.0,
        is_charging: false,
        temperature_c: 30.0,
        available_memory_mb: 800,
        user_active: false,
        network_unmetered: true,
    }
}

pub struct Harness {
    pub orchestrator: TrainingOrchestrator,
    pub probe: Arc<StaticProbe>,
    pub clock: ManualClock,
}

impl Harness {
    pub fn new(reading: ResourceReading) -> Self {
        Self::with_settings(reading, VigilSettings::default())
    }

    pub fn with_settings(reading: ResourceReading, settings: VigilSettings) -> Self {
        Self::build(reading, settings, |parts| parts)
    }

    /// Build with a chance to swap collaborators before the orchestrator is
    /// assembled.
    pub fn build(
        reading: ResourceReading,
        settings: VigilSettings,
        customize: impl FnOnce(OrchestratorParts) -> OrchestratorParts,
    ) -> Self {
        let clock = ManualClock::new(NOON);
        let shared_clock: Arc<dyn Clock> = Arc::new(clock.clone());
        let probe = Arc::new(StaticProbe::new(reading));
        let monitor = ResourceMonitor::new(probe.clone(), Arc::clone(&shared_clock), settings.resources.clone());
        let parts = OrchestratorParts {
            checkpoints: CheckpointManager::in_memory(TrainableState::initial(&settings), NOON),
            history: TrainingHistory::in_memory(),
            federated: FederatedClient::from_settings(&settings.federated),
            settings,
            clock: shared_clock,
            monitor,
        };
        Self {
            orchestrator: TrainingOrchestrator::new(customize(parts)),
            probe,
            clock,
        }
    }

    /// Queue `count` separable samples; labels cycle through the vocabulary.
    pub fn fill(&mut self, count: usize, priority: Priority) {
        for i in 0..count {
            let (features, label) = sample(i);
            let outcome = self
                .orchestrator
                .add_training_data(features, label, priority)
                .expect("sample accepted");
            assert!(outcome.is_none(), "non-critical ingestion never trains");
        }
    }
}

const LABELS: [&str; 3] = ["benign", "suspicious", "malicious"];

/// Deterministic sample whose features cluster by label.
pub fn sample(i: usize) -> (Vec<f32>, &'static str) {
    let class = i % LABELS.len();
    let features = (0..32)
        .map(|k| {
            let centre = if k % LABELS.len() == class { 0.8 } else { 0.1 };
            centre + ((i + k) % 5) as f32 * 0.01
        })
        .collect();
    (features, LABELS[class])
}

/// Transport that keeps every update it is handed.
#[derive(Clone, Default)]
pub struct RecordingTransport {
    pub sent: Arc<Mutex<Vec<FederatedUpdate>>>,
    pub fail: bool,
}

impl RecordingTransport {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn sent(&self) -> Vec<FederatedUpdate> {
        self.sent.lock().unwrap().clone()
    }
}

impl FederatedTransport for RecordingTransport {
    fn send(&self, update: &FederatedUpdate) -> Result<(), FederatedError> {
        if self.fail {
            return Err(FederatedError::Transport {
                endpoint: "test://aggregator".into(),
                message: "connection refused".into(),
            });
        }
        self.sent.lock().unwrap().push(update.clone());
        Ok(())
    }
}
