use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::history::HistoryTotals;

/// Counters exposed to the inference engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingMetrics {
    /// Completed sessions.
    pub total_sessions: u64,
    /// Samples consumed by completed sessions.
    pub total_samples: u64,
    /// Running mean of the feed-forward accuracy over completed sessions.
    pub average_accuracy: f32,
    pub queue_size: usize,
    pub is_training: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_training_time: Option<OffsetDateTime>,
    pub failed_sessions: u64,
    pub last_failure: Option<String>,
}

impl TrainingMetrics {
    /// Seed counters from persisted history.
    pub fn from_totals(totals: &HistoryTotals) -> Self {
        Self {
            total_sessions: totals.completed,
            total_samples: totals.samples,
            average_accuracy: totals.mean_accuracy.unwrap_or(0.0),
            last_training_time: totals.last_completed_at,
            failed_sessions: totals.failed,
            ..Self::default()
        }
    }

    pub fn record_success(&mut self, samples: usize, accuracy: f32, finished_at: OffsetDateTime) {
        self.total_sessions += 1;
        self.total_samples += samples as u64;
        self.average_accuracy += (accuracy - self.average_accuracy) / self.total_sessions as f32;
        self.last_training_time = Some(finished_at);
    }

    pub fn record_failure(&mut self, error: &str) {
        self.failed_sessions += 1;
        self.last_failure = Some(error.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_mean_matches_plain_mean() {
        let mut metrics = TrainingMetrics::default();
        for (i, acc) in [0.5f32, 0.7, 0.9].into_iter().enumerate() {
            metrics.record_success(10, acc, OffsetDateTime::UNIX_EPOCH + time::Duration::hours(i as i64));
        }
        assert_eq!(metrics.total_sessions, 3);
        assert_eq!(metrics.total_samples, 30);
        assert!((metrics.average_accuracy - 0.7).abs() < 1e-6);
        assert_eq!(
            metrics.last_training_time,
            Some(OffsetDateTime::UNIX_EPOCH + time::Duration::hours(2))
        );
    }

    #[test]
    fn failures_do_not_touch_success_counters() {
        let mut metrics = TrainingMetrics::default();
        metrics.record_failure("Non-finite loss");
        assert_eq!(metrics.failed_sessions, 1);
        assert_eq!(metrics.total_sessions, 0);
        assert_eq!(metrics.last_failure.as_deref(), Some("Non-finite loss"));
        assert!(metrics.last_training_time.is_none());
    }
}
