//! Coordinates gating, training phases, commit and rollback.
//!
//! A session walks Idle -> Gating -> Batching -> TrainingAnn ->
//! TrainingSnn -> Meta -> Checkpointing -> Federating -> Idle. The spiking
//! and meta phases are optional by mode and budget. Any phase error moves to
//! Failed, which restores the last checkpoint and the replay buffer before
//! returning to Idle.

mod batch;
mod gates;
mod metrics;
mod status;

use std::sync::Arc;
use std::time::Instant;

use rand::SeedableRng;
use rand::rngs::StdRng;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::checkpoint::{Checkpoint, CheckpointError, CheckpointManager, CheckpointStore, TrainableState};
use crate::clock::Clock;
use crate::federated::{FederatedClient, FederatedSummary, FederatedUpdate};
use crate::history::{
    HistoryDb, HistoryError, SessionOutcome, SessionTrigger, TrainingHistory, TrainingSession,
};
use crate::learn::{
    Anchors, AnnPhaseResult, LearnError, MetaPhaseResult, MetaTuner, SnnPhaseResult, TrainingConfig,
    TrainingMode, train_incremental, train_stdp,
};
use crate::ml::ModelState;
use crate::privacy::PrivacyGuard;
use crate::queue::{Priority, TrainingQueue, TrainingSample};
use crate::replay::ReplayBuffer;
use crate::resources::{ResourceMonitor, ResourceSnapshot};
use crate::scheduler::{TrainingScheduler, TrainingWindow};
use crate::settings::VigilSettings;

use batch::SessionBatch;
use gates::{GateInputs, SessionBudget};

pub use gates::GateReason;
pub use metrics::TrainingMetrics;
pub use status::TrainingStatus;

/// Errors that fail a session or prevent the orchestrator from opening.
#[derive(Debug, Error)]
pub enum TrainingError {
    #[error(transparent)]
    Learn(#[from] LearnError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error(transparent)]
    History(#[from] HistoryError),
    #[error("App directory unavailable: {0}")]
    Directory(#[from] crate::app_dirs::AppDirError),
}

impl TrainingError {
    /// Failures the batch itself produced. Retrying the same samples would
    /// fail again, so they are discarded instead of requeued.
    pub fn is_caused_by_data(&self) -> bool {
        matches!(
            self,
            Self::Learn(
                LearnError::NonFinite { .. }
                    | LearnError::FeatureLength { .. }
                    | LearnError::LabelOutOfRange { .. }
                    | LearnError::InvalidModel { .. }
            ) | Self::Checkpoint(CheckpointError::Rejected(_))
        )
    }
}

/// Samples refused at ingestion.
#[derive(Debug, Error, PartialEq)]
pub enum IngestError {
    #[error("Feature vector has length {found}, expected {expected}")]
    FeatureLength { expected: usize, found: usize },
    #[error("Feature vector contains non-finite values")]
    NonFinite,
    #[error("Feature magnitude exceeds {limit}")]
    OutOfRange { limit: f32 },
    #[error("Unknown label `{0}`")]
    UnknownLabel(String),
}

/// Where the orchestrator is in the session state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Gating,
    Batching,
    TrainingAnn,
    TrainingSnn,
    Meta,
    Checkpointing,
    Federating,
    Failed,
}

/// Result of one training attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum TrainingOutcome {
    Completed(Box<TrainingSession>),
    /// A gate failed; nothing changed.
    Deferred { reason: GateReason },
    /// Gates passed but the assembled batch was below the mode's minimum.
    InsufficientData { available: usize, required: usize },
    /// A phase failed and the session was rolled back.
    Failed { error: String },
}

impl TrainingOutcome {
    pub fn succeeded(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    /// Human readable reason for anything other than completion.
    pub fn reason(&self) -> Option<String> {
        match self {
            Self::Completed(_) => None,
            Self::Deferred { reason } => Some(reason.reason().to_string()),
            Self::InsufficientData { .. } => Some(GateReason::InsufficientData.reason().to_string()),
            Self::Failed { error } => Some(error.clone()),
        }
    }
}

/// Collaborators the orchestrator is built from.
pub struct OrchestratorParts {
    pub settings: VigilSettings,
    pub clock: Arc<dyn Clock>,
    pub monitor: ResourceMonitor,
    pub checkpoints: CheckpointManager,
    pub history: TrainingHistory,
    pub federated: FederatedClient,
}

/// Phase results gathered while a session runs.
#[derive(Default)]
struct SessionDraft {
    ann: Option<AnnPhaseResult>,
    snn: Option<SnnPhaseResult>,
    meta: Option<MetaPhaseResult>,
    skipped_phases: Vec<String>,
    checkpoint_version: Option<u64>,
}

/// Owns the queue, replay buffer and learnable state, and runs sessions.
pub struct TrainingOrchestrator {
    settings: VigilSettings,
    clock: Arc<dyn Clock>,
    monitor: ResourceMonitor,
    scheduler: TrainingScheduler,
    privacy: PrivacyGuard,
    queue: TrainingQueue,
    replay: ReplayBuffer,
    checkpoints: CheckpointManager,
    working: TrainableState,
    federated: FederatedClient,
    history: TrainingHistory,
    tuner: MetaTuner,
    status: Arc<TrainingStatus>,
    phase: SessionPhase,
    rng: StdRng,
}

impl TrainingOrchestrator {
    pub fn new(parts: OrchestratorParts) -> Self {
        let OrchestratorParts {
            settings,
            clock,
            monitor,
            checkpoints,
            history,
            federated,
        } = parts;
        let totals = history.totals().unwrap_or_else(|err| {
            warn!(error = %err, "history totals unavailable; metrics start empty");
            Default::default()
        });
        let working = checkpoints.begin_session();
        let status = Arc::new(TrainingStatus::new(
            Arc::new(working.model.clone()),
            TrainingMetrics::from_totals(&totals),
        ));
        Self {
            scheduler: TrainingScheduler::new(settings.schedule.windows.clone()),
            privacy: PrivacyGuard::new(),
            queue: TrainingQueue::new(settings.queue.capacity, settings.queue.retention_ratio),
            replay: ReplayBuffer::new(settings.replay.capacity),
            tuner: MetaTuner::new(&settings.learner),
            rng: StdRng::seed_from_u64(settings.model.seed),
            phase: SessionPhase::Idle,
            settings,
            clock,
            monitor,
            checkpoints,
            working,
            federated,
            history,
            status,
        }
    }

    /// Orchestrator with nothing persisted.
    pub fn in_memory(settings: VigilSettings, monitor: ResourceMonitor, clock: Arc<dyn Clock>) -> Self {
        let checkpoints = CheckpointManager::in_memory(TrainableState::initial(&settings), clock.now());
        let federated = FederatedClient::from_settings(&settings.federated);
        Self::new(OrchestratorParts {
            settings,
            clock,
            monitor,
            checkpoints,
            history: TrainingHistory::in_memory(),
            federated,
        })
    }

    /// Orchestrator backed by the checkpoint and history under the app root.
    pub fn open(
        settings: VigilSettings,
        monitor: ResourceMonitor,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, TrainingError> {
        let checkpoints = CheckpointManager::load_or_init(
            CheckpointStore::default_location()?,
            TrainableState::initial(&settings),
            clock.now(),
        )?;
        let history = TrainingHistory::with_db(HistoryDb::open(&crate::app_dirs::history_db_path()?)?)?;
        let federated = FederatedClient::from_settings(&settings.federated);
        Ok(Self::new(OrchestratorParts {
            settings,
            clock,
            monitor,
            checkpoints,
            history,
            federated,
        }))
    }

    /// Handle readable from other threads while sessions run.
    pub fn status(&self) -> Arc<TrainingStatus> {
        Arc::clone(&self.status)
    }

    pub fn settings(&self) -> &VigilSettings {
        &self.settings
    }

    pub fn monitor(&self) -> &ResourceMonitor {
        &self.monitor
    }

    pub fn define_windows(&mut self, windows: impl IntoIterator<Item = TrainingWindow>) {
        self.scheduler.define_windows(windows);
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn queue(&self) -> &TrainingQueue {
        &self.queue
    }

    pub fn replay(&self) -> &ReplayBuffer {
        &self.replay
    }

    pub fn checkpoint(&self) -> &Checkpoint {
        self.checkpoints.current()
    }

    /// State the next session starts from.
    pub fn trainable_state(&self) -> &TrainableState {
        &self.working
    }

    pub fn history(&self) -> &TrainingHistory {
        &self.history
    }

    pub fn training_metrics(&self) -> TrainingMetrics {
        self.status.metrics()
    }

    pub fn model_snapshot(&self) -> Arc<ModelState> {
        self.status.model_snapshot()
    }

    /// Refresh resources and run the ordered gates without starting a session.
    pub fn can_train_now(&self) -> Result<TrainingMode, GateReason> {
        let snapshot = self.monitor.refresh();
        self.evaluate_gates(&snapshot, false)
    }

    /// Host-requested session. Gates apply; the time window does not.
    pub fn train_incrementally(&mut self) -> TrainingOutcome {
        self.attempt(SessionTrigger::Manual, None)
    }

    /// Periodic check: trains only inside an active window.
    pub fn on_schedule_tick(&mut self) -> TrainingOutcome {
        let now = self.clock.now();
        let snapshot = self.monitor.refresh();
        let Some(window) = self.scheduler.active_window(now.hour(), &snapshot).cloned() else {
            debug!(hour = now.hour(), "no active training window");
            return TrainingOutcome::Deferred {
                reason: GateReason::OutsideWindow,
            };
        };
        self.attempt(SessionTrigger::Scheduled, Some(window))
    }

    /// Queue a labeled sample.
    ///
    /// Samples failing the privacy screen are dropped silently (`Ok(None)`).
    /// A critical sample triggers an immediate attempt whose outcome is
    /// returned.
    pub fn add_training_data(
        &mut self,
        features: Vec<f32>,
        label: &str,
        priority: Priority,
    ) -> Result<Option<TrainingOutcome>, IngestError> {
        let expected = self.working.model.feature_len();
        if features.len() != expected {
            return Err(IngestError::FeatureLength {
                expected,
                found: features.len(),
            });
        }
        if features.iter().any(|x| !x.is_finite()) {
            return Err(IngestError::NonFinite);
        }
        if !self.privacy.is_sample_safe(&features, label) {
            debug!("sample dropped by privacy screen");
            return Ok(None);
        }
        let limit = self.settings.model.max_feature_magnitude;
        if features.iter().any(|x| x.abs() > limit) {
            return Err(IngestError::OutOfRange { limit });
        }
        if self.working.model.class_index(label).is_none() {
            return Err(IngestError::UnknownLabel(label.to_string()));
        }

        let sample = TrainingSample::new(features, label, priority, self.clock.now());
        let evicted = self.queue.push(sample);
        if evicted > 0 {
            debug!(evicted, "queue overflow; evicted lowest priority samples");
        }
        self.publish_queue_size();

        if priority == Priority::Critical {
            info!("critical sample queued; attempting urgent session");
            return Ok(Some(self.attempt(SessionTrigger::Urgent, None)));
        }
        Ok(None)
    }

    fn evaluate_gates(&self, snapshot: &ResourceSnapshot, urgent: bool) -> Result<TrainingMode, GateReason> {
        let schedule = &self.settings.schedule;
        let min_interval = if urgent {
            time::Duration::minutes(schedule.urgent_min_interval_minutes as i64)
        } else {
            time::Duration::hours(schedule.min_session_interval_hours as i64)
        };
        gates::evaluate(GateInputs {
            thresholds: self.monitor.thresholds(),
            snapshot,
            now: self.clock.now(),
            last_training: self.status.metrics().last_training_time,
            min_interval,
            queued: self.queue.len(),
            min_queued: schedule.min_queued_samples,
        })
    }

    fn set_phase(&mut self, phase: SessionPhase) {
        if self.phase != phase {
            debug!(from = ?self.phase, to = ?phase, "session phase");
            self.phase = phase;
        }
    }

    fn publish_queue_size(&self) {
        let len = self.queue.len();
        self.status.update_metrics(|m| m.queue_size = len);
    }

    fn attempt(&mut self, trigger: SessionTrigger, window: Option<TrainingWindow>) -> TrainingOutcome {
        if !self.status.try_begin() {
            return TrainingOutcome::Deferred {
                reason: GateReason::AlreadyTraining,
            };
        }
        let outcome = self.gated_session(trigger, window);
        self.set_phase(SessionPhase::Idle);
        self.status.end();
        outcome
    }

    fn gated_session(&mut self, trigger: SessionTrigger, window: Option<TrainingWindow>) -> TrainingOutcome {
        self.set_phase(SessionPhase::Gating);
        let snapshot = self.monitor.refresh();
        let mode = match self.evaluate_gates(&snapshot, trigger == SessionTrigger::Urgent) {
            Ok(mode) => mode,
            Err(reason) => {
                debug!(trigger = trigger.as_str(), %reason, "training deferred");
                return TrainingOutcome::Deferred { reason };
            }
        };
        let config = mode.config();

        self.set_phase(SessionPhase::Batching);
        let batch = batch::assemble(&self.queue, &self.working.model, config);
        if batch.len() < config.min_samples {
            info!(
                mode = mode.as_str(),
                available = batch.len(),
                required = config.min_samples,
                "not enough samples for this mode"
            );
            return TrainingOutcome::InsufficientData {
                available: batch.len(),
                required: config.min_samples,
            };
        }

        let max_duration = window.map_or(config.max_duration, |w| w.max_duration().min(config.max_duration));
        let budget = SessionBudget {
            max_duration,
            start_battery: snapshot.battery_percent,
            max_drain_percent: config.max_battery_drain_percent,
        };
        info!(
            trigger = trigger.as_str(),
            mode = mode.as_str(),
            samples = batch.len(),
            "training session started"
        );
        let outcome = self.run_session(trigger, config, &batch, budget);
        self.status.bump_generation();
        outcome
    }

    fn run_session(
        &mut self,
        trigger: SessionTrigger,
        config: &TrainingConfig,
        batch: &SessionBatch,
        budget: SessionBudget,
    ) -> TrainingOutcome {
        let started_at = self.clock.now();
        let started = Instant::now();
        let replay_backup = self.replay.clone();
        let mut draft = SessionDraft::default();

        match self.run_phases(config, batch, budget, started, &mut draft) {
            Ok(pending) => {
                self.status.publish_model(Arc::new(self.working.model.clone()));
                let federated = pending.map(|update| self.deliver(&update));
                self.queue.remove_consumed(&batch.ids);
                self.publish_queue_size();

                let finished_at = self.clock.now();
                let accuracy = draft.ann.as_ref().map_or(0.0, |ann| ann.accuracy);
                self.status
                    .update_metrics(|m| m.record_success(batch.len(), accuracy, finished_at));
                let session = self.session_record(
                    trigger,
                    config.mode,
                    started_at,
                    started,
                    batch.len(),
                    draft,
                    federated,
                    SessionOutcome::Completed,
                );
                info!(
                    id = %session.id,
                    version = session.checkpoint_version,
                    accuracy,
                    elapsed_ms = session.duration.as_millis() as u64,
                    "training session committed"
                );
                self.record_history(session.clone());
                TrainingOutcome::Completed(Box::new(session))
            }
            Err(err) => {
                self.set_phase(SessionPhase::Failed);
                self.working = self.checkpoints.restore();
                self.replay = replay_backup;
                let error = err.to_string();
                warn!(
                    error = %error,
                    version = self.checkpoints.current().version,
                    "training session failed; rolled back to last checkpoint"
                );
                self.status.update_metrics(|m| m.record_failure(&error));
                if err.is_caused_by_data() {
                    let dropped = self.queue.remove_consumed(&batch.ids);
                    self.publish_queue_size();
                    warn!(dropped, "discarded the batch that broke training");
                }
                draft.checkpoint_version = None;
                let session = self.session_record(
                    trigger,
                    config.mode,
                    started_at,
                    started,
                    batch.len(),
                    draft,
                    None,
                    SessionOutcome::Failed { error: error.clone() },
                );
                self.record_history(session);
                TrainingOutcome::Failed { error }
            }
        }
    }

    /// Train, consolidate and commit. Returns the contribution to send once
    /// the commit has landed.
    fn run_phases(
        &mut self,
        config: &TrainingConfig,
        batch: &SessionBatch,
        budget: SessionBudget,
        started: Instant,
        draft: &mut SessionDraft,
    ) -> Result<Option<FederatedUpdate>, TrainingError> {
        self.set_phase(SessionPhase::TrainingAnn);
        let ann = {
            let anchors = Anchors {
                reference: &self.checkpoints.current().state.model.ann,
                ewc: &self.working.ewc,
                meta: &self.working.meta,
                temperature: self.settings.learner.distill_temperature,
            };
            train_incremental(
                &mut self.working.model.ann,
                &batch.entries,
                &mut self.replay,
                &anchors,
                config,
                &mut self.rng,
            )?
        };
        debug!(loss = ann.loss, accuracy = ann.accuracy, "feed-forward phase done");
        let session_loss = ann.loss;
        draft.ann = Some(ann);

        if config.mode.runs_spiking_phase() {
            if self.budget_exhausted(budget, started) {
                draft.skipped_phases.push("spiking".to_string());
            } else {
                self.set_phase(SessionPhase::TrainingSnn);
                let snn = train_stdp(
                    &mut self.working.model.snn,
                    &batch.entries,
                    &self.settings.spiking,
                    config,
                    &mut self.rng,
                )?;
                debug!(accuracy = snn.accuracy, spikes = snn.spike_count, "spiking phase done");
                draft.snn = Some(snn);
            }
        }

        if config.mode.runs_meta_phase() {
            if self.budget_exhausted(budget, started) {
                draft.skipped_phases.push("meta".to_string());
            } else {
                self.set_phase(SessionPhase::Meta);
                draft.meta = Some(self.tuner.adapt(&mut self.working.meta, session_loss));
            }
        }

        let samples: Vec<(&[f32], usize)> = batch
            .entries
            .iter()
            .map(|entry| (entry.features.as_slice(), entry.label))
            .collect();
        self.working
            .ewc
            .consolidate(&self.working.model.ann, &samples, self.settings.learner.fisher_decay);

        let pending = self.prepare_contribution(batch.len(), budget, started, draft);

        self.set_phase(SessionPhase::Checkpointing);
        let version = self.checkpoints.save(self.working.clone(), self.clock.now())?.version;
        draft.checkpoint_version = Some(version);
        Ok(pending)
    }

    /// Noised update for this session, with its privacy cost charged to the
    /// working state so it is committed with the checkpoint.
    fn prepare_contribution(
        &mut self,
        sample_count: usize,
        budget: SessionBudget,
        started: Instant,
        draft: &mut SessionDraft,
    ) -> Option<FederatedUpdate> {
        if !self
            .federated
            .should_contribute_to_federation(&self.working.federated, sample_count)
        {
            return None;
        }
        if self.budget_exhausted(budget, started) {
            draft.skipped_phases.push("federated".to_string());
            return None;
        }
        match self.federated.prepare_update(
            &self.working.federated,
            self.working.model.ann.params(),
            sample_count,
            self.monitor.device_class(),
            self.clock.now(),
        ) {
            Ok(update) => {
                self.working
                    .federated
                    .record_contribution(self.working.model.ann.params(), update.epsilon);
                Some(update)
            }
            Err(err) => {
                warn!(error = %err, "could not prepare federated update");
                None
            }
        }
    }

    fn deliver(&mut self, update: &FederatedUpdate) -> FederatedSummary {
        self.set_phase(SessionPhase::Federating);
        let delivered = match self.federated.transmit(update) {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %err, "federated update not delivered");
                false
            }
        };
        FederatedSummary {
            sample_count: update.sample_count,
            epsilon: update.epsilon,
            epsilon_spent: self.working.federated.epsilon_spent,
            delivered,
        }
    }

    fn budget_exhausted(&self, budget: SessionBudget, started: Instant) -> bool {
        let battery_now = self.monitor.refresh().battery_percent;
        let exhausted = budget.exhausted(started.elapsed(), battery_now);
        if exhausted {
            info!(
                elapsed_ms = started.elapsed().as_millis() as u64,
                battery_now, "session budget exhausted; skipping remaining optional phases"
            );
        }
        exhausted
    }

    #[allow(clippy::too_many_arguments)]
    fn session_record(
        &self,
        trigger: SessionTrigger,
        mode: TrainingMode,
        started_at: OffsetDateTime,
        started: Instant,
        samples_used: usize,
        draft: SessionDraft,
        federated: Option<FederatedSummary>,
        outcome: SessionOutcome,
    ) -> TrainingSession {
        TrainingSession {
            id: Uuid::new_v4(),
            trigger,
            mode,
            started_at,
            finished_at: self.clock.now(),
            duration: started.elapsed(),
            samples_used,
            ann: draft.ann,
            snn: draft.snn,
            meta: draft.meta,
            federated,
            skipped_phases: draft.skipped_phases,
            checkpoint_version: draft.checkpoint_version,
            outcome,
        }
    }

    fn record_history(&mut self, session: TrainingSession) {
        if let Err(err) = self.history.record(session) {
            warn!(error = %err, "failed to persist training session");
        }
    }
}
