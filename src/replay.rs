//! Fixed-capacity ring of previously seen examples, replayed to limit forgetting.

use rand::Rng;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// A stored example; `label` indexes the model's class vocabulary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayEntry {
    pub features: Vec<f32>,
    pub label: usize,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

/// Circular buffer: once full, each insert overwrites the oldest entry.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayBuffer {
    slots: Vec<ReplayEntry>,
    capacity: usize,
    /// Slot the next insert writes once the buffer is full.
    next: usize,
}

impl ReplayBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: Vec::with_capacity(capacity),
            capacity,
            next: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn push(&mut self, entry: ReplayEntry) {
        if self.slots.len() < self.capacity {
            self.slots.push(entry);
        } else {
            self.slots[self.next] = entry;
        }
        self.next = (self.next + 1) % self.capacity;
    }

    pub fn extend(&mut self, entries: impl IntoIterator<Item = ReplayEntry>) {
        for entry in entries {
            self.push(entry);
        }
    }

    /// Entries oldest to newest.
    pub fn iter_ordered(&self) -> impl Iterator<Item = &ReplayEntry> {
        let split = if self.slots.len() < self.capacity {
            0
        } else {
            self.next
        };
        self.slots[split..].iter().chain(self.slots[..split].iter())
    }

    /// Up to `count` distinct entries drawn uniformly at random.
    pub fn sample<R: Rng + ?Sized>(&self, count: usize, rng: &mut R) -> Vec<&ReplayEntry> {
        let amount = count.min(self.slots.len());
        if amount == 0 {
            return Vec::new();
        }
        rand::seq::index::sample(rng, self.slots.len(), amount)
            .into_iter()
            .map(|idx| &self.slots[idx])
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn entry(marker: f32) -> ReplayEntry {
        ReplayEntry {
            features: vec![marker],
            label: 0,
            timestamp: OffsetDateTime::UNIX_EPOCH,
        }
    }

    fn markers(buffer: &ReplayBuffer) -> Vec<f32> {
        buffer.iter_ordered().map(|e| e.features[0]).collect()
    }

    #[test]
    fn overwrites_oldest_first() {
        let mut buffer = ReplayBuffer::new(3);
        buffer.extend((0..4).map(|i| entry(i as f32)));
        assert_eq!(buffer.len(), 3);
        assert_eq!(markers(&buffer), vec![1.0, 2.0, 3.0]);

        buffer.push(entry(4.0));
        buffer.push(entry(5.0));
        assert_eq!(markers(&buffer), vec![3.0, 4.0, 5.0]);
    }

    #[test]
    fn capacity_plus_one_inserts_leaves_capacity_items() {
        let mut buffer = ReplayBuffer::new(1000);
        buffer.extend((0..1001).map(|i| entry(i as f32)));
        assert_eq!(buffer.len(), 1000);
        let ordered = markers(&buffer);
        assert_eq!(ordered.first(), Some(&1.0));
        assert_eq!(ordered.last(), Some(&1000.0));
    }

    #[test]
    fn sample_is_bounded_and_distinct() {
        let mut buffer = ReplayBuffer::new(10);
        buffer.extend((0..6).map(|i| entry(i as f32)));
        let mut rng = StdRng::seed_from_u64(3);
        let drawn = buffer.sample(4, &mut rng);
        assert_eq!(drawn.len(), 4);
        let mut values: Vec<f32> = drawn.iter().map(|e| e.features[0]).collect();
        values.sort_by(f32::total_cmp);
        values.dedup();
        assert_eq!(values.len(), 4);
        assert_eq!(buffer.sample(50, &mut rng).len(), 6);
        assert!(ReplayBuffer::new(4).sample(2, &mut rng).is_empty());
    }
}
