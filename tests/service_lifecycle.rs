mod support;

use std::sync::Arc;

use support::{Harness, NOON, balanced_reading, sample, vigil_env::VigilEnvGuard};

use tempfile::TempDir;
use vigil::clock::{Clock, ManualClock};
use vigil::orchestrator::{GateReason, TrainingOrchestrator, TrainingOutcome};
use vigil::queue::Priority;
use vigil::resources::{ResourceMonitor, StaticProbe};
use vigil::service::TrainingService;
use vigil::settings::VigilSettings;

fn open_orchestrator() -> TrainingOrchestrator {
    let settings = VigilSettings::default();
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(NOON));
    let monitor = ResourceMonitor::new(
        Arc::new(StaticProbe::new(balanced_reading())),
        Arc::clone(&clock),
        settings.resources.clone(),
    );
    TrainingOrchestrator::open(settings, monitor, clock).expect("open orchestrator")
}

#[test]
fn committed_state_and_history_survive_restart() {
    let temp = TempDir::new().unwrap();
    let _env = VigilEnvGuard::set_home(temp.path().to_path_buf());

    let committed_model = {
        let mut orchestrator = open_orchestrator();
        for i in 0..100 {
            let (features, label) = sample(i);
            orchestrator.add_training_data(features, label, Priority::Normal).unwrap();
        }
        assert!(orchestrator.train_incrementally().succeeded());
        orchestrator.checkpoint().state.model.clone()
    };

    let mut reopened = open_orchestrator();
    assert_eq!(reopened.checkpoint().version, 1);
    assert_eq!(reopened.checkpoint().state.model, committed_model);
    assert_eq!(*reopened.model_snapshot(), committed_model);
    assert_eq!(reopened.history().sessions().len(), 1);

    let metrics = reopened.training_metrics();
    assert_eq!(metrics.total_sessions, 1);
    assert_eq!(metrics.total_samples, 100);
    assert_eq!(metrics.last_training_time, Some(NOON));

    for i in 0..30 {
        let (features, label) = sample(i);
        reopened.add_training_data(features, label, Priority::Normal).unwrap();
    }
    assert_eq!(reopened.can_train_now(), Err(GateReason::TrainedTooRecently));
    assert!(temp.path().join(".vigil/checkpoints/current.json").is_file());
    assert!(temp.path().join(".vigil/history.db").is_file());
}

#[test]
fn service_ingests_and_trains_on_worker() {
    let h = Harness::new(balanced_reading());
    let service = TrainingService::start(h.orchestrator).unwrap();

    for i in 0..80 {
        let (features, label) = sample(i);
        service.add_training_data(features, label, Priority::Normal);
    }
    let outcome = service.train_now().expect("worker running");
    assert!(outcome.succeeded(), "{outcome:?}");

    let metrics = service.training_metrics();
    assert_eq!(metrics.total_sessions, 1);
    assert_eq!(metrics.total_samples, 80);
    assert_eq!(metrics.queue_size, 0);
    assert!(!metrics.is_training);
    assert_eq!(service.status().generation(), 1);

    // A second request inside the minimum interval is deferred, not queued.
    for i in 0..30 {
        let (features, label) = sample(i);
        service.add_training_data(features, label, Priority::Normal);
    }
    assert_eq!(
        service.train_now(),
        Some(TrainingOutcome::Deferred {
            reason: GateReason::TrainedTooRecently
        })
    );
    service.shutdown();
}
