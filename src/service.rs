//! Background runtime: one worker thread owns the orchestrator, two polling
//! threads feed it.
//!
//! The schedule loop asks for a session every `check_interval_secs`; the
//! resource loop refreshes the shared snapshot every `resource_refresh_secs`.
//! Train requests carry the session generation they were issued in and are
//! dropped by the worker when a session finished in between.

use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::ml::ModelState;
use crate::orchestrator::{GateReason, TrainingMetrics, TrainingOrchestrator, TrainingOutcome, TrainingStatus};
use crate::queue::Priority;
use crate::resources::ResourceMonitor;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TrainRequest {
    Scheduled,
    Manual,
}

enum ServiceCommand {
    Ingest {
        features: Vec<f32>,
        label: String,
        priority: Priority,
    },
    Train {
        generation: u64,
        request: TrainRequest,
        reply: Option<Sender<TrainingOutcome>>,
    },
    Shutdown,
}

struct Ticker {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

/// Handle onto the running training subsystem.
pub struct TrainingService {
    commands: Sender<ServiceCommand>,
    status: Arc<TrainingStatus>,
    monitor: ResourceMonitor,
    worker: Option<JoinHandle<()>>,
    tickers: Vec<Ticker>,
}

impl TrainingService {
    /// Move `orchestrator` onto the worker thread and start both loops.
    pub fn start(orchestrator: TrainingOrchestrator) -> Result<Self, ServiceError> {
        let status = orchestrator.status();
        let monitor = orchestrator.monitor().clone();
        let schedule = orchestrator.settings().schedule.clone();
        let (commands, command_rx) = mpsc::channel();

        let worker = thread::Builder::new()
            .name("vigil-worker".into())
            .spawn(move || run_worker(orchestrator, command_rx))
            .map_err(|source| ServiceError::Spawn {
                name: "worker",
                source,
            })?;
        let mut service = Self {
            commands,
            status,
            monitor,
            worker: Some(worker),
            tickers: Vec::new(),
        };

        let schedule_tx = service.commands.clone();
        let schedule_status = Arc::clone(&service.status);
        let schedule_ticker = spawn_ticker(
            "schedule",
            Duration::from_secs(schedule.check_interval_secs.max(1)),
            move || {
                if schedule_status.is_training() {
                    return;
                }
                let _ = schedule_tx.send(ServiceCommand::Train {
                    generation: schedule_status.generation(),
                    request: TrainRequest::Scheduled,
                    reply: None,
                });
            },
        )?;
        service.tickers.push(schedule_ticker);

        let refresh_monitor = service.monitor.clone();
        let resource_ticker = spawn_ticker(
            "resources",
            Duration::from_secs(schedule.resource_refresh_secs.max(1)),
            move || {
                refresh_monitor.refresh();
            },
        )?;
        service.tickers.push(resource_ticker);

        info!(
            check_interval_secs = schedule.check_interval_secs,
            resource_refresh_secs = schedule.resource_refresh_secs,
            "training service started"
        );
        Ok(service)
    }

    /// Fire-and-forget ingestion.
    pub fn add_training_data(&self, features: Vec<f32>, label: impl Into<String>, priority: Priority) {
        let command = ServiceCommand::Ingest {
            features,
            label: label.into(),
            priority,
        };
        if self.commands.send(command).is_err() {
            warn!("training worker stopped; sample dropped");
        }
    }

    /// Request a session and wait for its outcome. `None` once the worker
    /// has stopped.
    pub fn train_now(&self) -> Option<TrainingOutcome> {
        if self.status.is_training() {
            return Some(TrainingOutcome::Deferred {
                reason: GateReason::AlreadyTraining,
            });
        }
        let (reply_tx, reply_rx) = mpsc::channel();
        self.commands
            .send(ServiceCommand::Train {
                generation: self.status.generation(),
                request: TrainRequest::Manual,
                reply: Some(reply_tx),
            })
            .ok()?;
        reply_rx.recv().ok()
    }

    pub fn record_user_activity(&self) {
        self.monitor.record_user_activity();
    }

    pub fn training_metrics(&self) -> TrainingMetrics {
        self.status.metrics()
    }

    pub fn model_snapshot(&self) -> Arc<ModelState> {
        self.status.model_snapshot()
    }

    pub fn status(&self) -> Arc<TrainingStatus> {
        Arc::clone(&self.status)
    }

    /// Stop both loops, let the worker finish its current command and join.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        for ticker in self.tickers.drain(..) {
            drop(ticker.stop_tx);
            if ticker.handle.join().is_err() {
                warn!("polling thread panicked");
            }
        }
        if let Some(worker) = self.worker.take() {
            let _ = self.commands.send(ServiceCommand::Shutdown);
            if worker.join().is_err() {
                warn!("training worker panicked");
            }
            info!("training service stopped");
        }
    }
}

impl Drop for TrainingService {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_ticker(
    name: &'static str,
    interval: Duration,
    mut tick: impl FnMut() + Send + 'static,
) -> Result<Ticker, ServiceError> {
    let (stop_tx, stop_rx) = mpsc::channel::<()>();
    let handle = thread::Builder::new()
        .name(format!("vigil-{name}"))
        .spawn(move || {
            loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => tick(),
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        })
        .map_err(|source| ServiceError::Spawn { name, source })?;
    Ok(Ticker { stop_tx, handle })
}

fn run_worker(mut orchestrator: TrainingOrchestrator, commands: Receiver<ServiceCommand>) {
    let status = orchestrator.status();
    while let Ok(command) = commands.recv() {
        match command {
            ServiceCommand::Ingest {
                features,
                label,
                priority,
            } => match orchestrator.add_training_data(features, &label, priority) {
                Ok(Some(outcome)) => log_outcome("urgent", &outcome),
                Ok(None) => {}
                Err(err) => warn!(error = %err, "sample refused"),
            },
            ServiceCommand::Train {
                generation,
                request,
                reply,
            } => {
                let outcome = if generation != status.generation() {
                    debug!(generation, current = status.generation(), "dropping stale train request");
                    TrainingOutcome::Deferred {
                        reason: GateReason::AlreadyTraining,
                    }
                } else {
                    match request {
                        TrainRequest::Scheduled => orchestrator.on_schedule_tick(),
                        TrainRequest::Manual => orchestrator.train_incrementally(),
                    }
                };
                log_outcome(
                    match request {
                        TrainRequest::Scheduled => "scheduled",
                        TrainRequest::Manual => "manual",
                    },
                    &outcome,
                );
                if let Some(reply) = reply {
                    let _ = reply.send(outcome);
                }
            }
            ServiceCommand::Shutdown => break,
        }
    }
}

fn log_outcome(trigger: &str, outcome: &TrainingOutcome) {
    match outcome {
        TrainingOutcome::Completed(session) => {
            debug!(trigger, id = %session.id, "session completed")
        }
        TrainingOutcome::Failed { error } => warn!(trigger, error = %error, "session failed"),
        other => debug!(trigger, reason = %other.reason().unwrap_or_default(), "session not run"),
    }
}
