//! Bounded, priority-ordered store of samples waiting to be trained on.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Sample urgency; lower is more urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical = 0,
    High = 1,
    Normal = 2,
    Low = 3,
}

/// A labeled observation submitted by the inference engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingSample {
    pub id: Uuid,
    pub features: Vec<f32>,
    pub label: String,
    pub priority: Priority,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl TrainingSample {
    pub fn new(features: Vec<f32>, label: impl Into<String>, priority: Priority, timestamp: OffsetDateTime) -> Self {
        Self {
            id: Uuid::new_v4(),
            features,
            label: label.into(),
            priority,
            timestamp,
        }
    }
}

/// Best first: priority ascending, then newest first.
fn retention_order(a: &TrainingSample, b: &TrainingSample) -> Ordering {
    a.priority
        .cmp(&b.priority)
        .then_with(|| b.timestamp.cmp(&a.timestamp))
}

/// Queue bounded at `capacity`; on overflow keeps the best
/// `capacity * retention_ratio` samples.
#[derive(Debug, Clone)]
pub struct TrainingQueue {
    samples: Vec<TrainingSample>,
    capacity: usize,
    retain: usize,
}

impl TrainingQueue {
    pub fn new(capacity: usize, retention_ratio: f32) -> Self {
        let capacity = capacity.max(1);
        let retain = ((capacity as f32) * retention_ratio.clamp(0.0, 1.0)).floor() as usize;
        Self {
            samples: Vec::new(),
            capacity,
            retain: retain.clamp(1, capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.samples.iter().any(|sample| sample.id == id)
    }

    /// Add a sample, evicting down to the retention target when over
    /// capacity. Returns how many samples were evicted.
    pub fn push(&mut self, sample: TrainingSample) -> usize {
        self.samples.push(sample);
        if self.samples.len() <= self.capacity {
            return 0;
        }
        self.samples.sort_by(retention_order);
        let evicted = self.samples.len() - self.retain;
        self.samples.truncate(self.retain);
        tracing::debug!(evicted, retained = self.retain, "training queue overflow");
        evicted
    }

    /// Up to `limit` samples in training order, without removing them.
    pub fn peek_best(&self, limit: usize) -> Vec<TrainingSample> {
        let mut ordered: Vec<&TrainingSample> = self.samples.iter().collect();
        ordered.sort_by(|a, b| retention_order(a, b));
        ordered.into_iter().take(limit).cloned().collect()
    }

    /// Remove the given samples once a session has consumed them.
    pub fn remove_consumed(&mut self, ids: &[Uuid]) -> usize {
        let before = self.samples.len();
        self.samples.retain(|sample| !ids.contains(&sample.id));
        before - self.samples.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TrainingSample> {
        self.samples.iter()
    }
}
