use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use super::TrainingMetrics;
use crate::ml::ModelState;

/// State shared between the orchestrator and readers on other threads.
#[derive(Debug)]
pub struct TrainingStatus {
    is_training: AtomicBool,
    /// Bumped whenever a session finishes, committed or rolled back.
    generation: AtomicU64,
    metrics: RwLock<TrainingMetrics>,
    model: RwLock<Arc<ModelState>>,
}

impl TrainingStatus {
    pub(crate) fn new(model: Arc<ModelState>, metrics: TrainingMetrics) -> Self {
        Self {
            is_training: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            metrics: RwLock::new(metrics),
            model: RwLock::new(model),
        }
    }

    pub fn is_training(&self) -> bool {
        self.is_training.load(Ordering::SeqCst)
    }

    /// Claim the single training slot; false when a session already holds it.
    pub(crate) fn try_begin(&self) -> bool {
        self.is_training
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn end(&self) {
        self.is_training.store(false, Ordering::SeqCst);
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub(crate) fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub fn metrics(&self) -> TrainingMetrics {
        let mut metrics = self
            .metrics
            .read()
            .map(|guard| guard.clone())
            .unwrap_or_else(|err| err.into_inner().clone());
        metrics.is_training = self.is_training();
        metrics
    }

    pub(crate) fn update_metrics(&self, apply: impl FnOnce(&mut TrainingMetrics)) {
        match self.metrics.write() {
            Ok(mut guard) => apply(&mut guard),
            Err(err) => apply(&mut err.into_inner()),
        }
    }

    /// Latest committed model.
    pub fn model_snapshot(&self) -> Arc<ModelState> {
        self.model
            .read()
            .map(|guard| Arc::clone(&guard))
            .unwrap_or_else(|err| Arc::clone(&err.into_inner()))
    }

    pub(crate) fn publish_model(&self, model: Arc<ModelState>) {
        match self.model.write() {
            Ok(mut guard) => *guard = model,
            Err(err) => *err.into_inner() = model,
        }
    }
}
