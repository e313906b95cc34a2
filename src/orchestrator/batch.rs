use uuid::Uuid;

use crate::learn::TrainingConfig;
use crate::ml::ModelState;
use crate::queue::TrainingQueue;
use crate::replay::ReplayEntry;

/// Queue samples selected for one session.
#[derive(Debug, Clone, Default)]
pub(crate) struct SessionBatch {
    pub ids: Vec<Uuid>,
    pub entries: Vec<ReplayEntry>,
}

impl SessionBatch {
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Best queued samples, capped by the mode's session and memory limits.
///
/// The queue is left untouched; consumed samples are removed only once the
/// session commits.
pub(crate) fn assemble(queue: &TrainingQueue, model: &ModelState, config: &TrainingConfig) -> SessionBatch {
    let memory_cap = config.memory_sample_cap(model.feature_len(), model.ann.param_count());
    let limit = config.max_session_samples.min(memory_cap);
    let mut batch = SessionBatch::default();
    for sample in queue.peek_best(limit) {
        let Some(label) = model.class_index(&sample.label) else {
            tracing::warn!(label = %sample.label, "queued sample has an unknown label; skipping");
            continue;
        };
        if sample.features.len() != model.feature_len() {
            continue;
        }
        batch.ids.push(sample.id);
        batch.entries.push(ReplayEntry {
            features: sample.features,
            label,
            timestamp: sample.timestamp,
        });
    }
    batch
}
