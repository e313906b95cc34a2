//! Append-only record of finished training sessions.

mod db;

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::federated::FederatedSummary;
use crate::learn::{AnnPhaseResult, MetaPhaseResult, SnnPhaseResult, TrainingMode};

pub use db::HistoryDb;

/// Sessions kept in memory; older ones remain only in the database.
const IN_MEMORY_SESSIONS: usize = 256;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("Failed to open history database {path}: {source}")]
    Open {
        path: PathBuf,
        source: rusqlite::Error,
    },
    #[error("History database error: {0}")]
    Sql(#[from] rusqlite::Error),
    #[error("Failed to encode session: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("Stored timestamp out of range: {0}")]
    Timestamp(String),
}

/// What started a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionTrigger {
    /// Periodic check inside a training window.
    Scheduled,
    /// Critical sample arrival.
    Urgent,
    /// Explicit host request.
    Manual,
}

impl SessionTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Urgent => "urgent",
            Self::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SessionOutcome {
    Completed,
    Failed { error: String },
}

/// A finished session. Never modified once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingSession {
    pub id: Uuid,
    pub trigger: SessionTrigger,
    pub mode: TrainingMode,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub finished_at: OffsetDateTime,
    pub duration: Duration,
    /// Queue samples consumed by the session.
    pub samples_used: usize,
    pub ann: Option<AnnPhaseResult>,
    pub snn: Option<SnnPhaseResult>,
    pub meta: Option<MetaPhaseResult>,
    pub federated: Option<FederatedSummary>,
    /// Optional phases dropped because a budget ran out.
    #[serde(default)]
    pub skipped_phases: Vec<String>,
    pub checkpoint_version: Option<u64>,
    pub outcome: SessionOutcome,
}

impl TrainingSession {
    pub fn succeeded(&self) -> bool {
        self.outcome == SessionOutcome::Completed
    }
}

/// Aggregates over every recorded session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryTotals {
    pub completed: u64,
    pub failed: u64,
    pub samples: u64,
    pub mean_accuracy: Option<f32>,
    pub last_completed_at: Option<OffsetDateTime>,
}

/// Recent sessions in memory, mirrored to SQLite when a database is attached.
pub struct TrainingHistory {
    recent: Vec<TrainingSession>,
    db: Option<HistoryDb>,
}

impl TrainingHistory {
    pub fn in_memory() -> Self {
        Self {
            recent: Vec::new(),
            db: None,
        }
    }

    /// Attach `db` and preload its most recent sessions.
    pub fn with_db(db: HistoryDb) -> Result<Self, HistoryError> {
        let recent = db.recent(IN_MEMORY_SESSIONS)?;
        Ok(Self {
            recent,
            db: Some(db),
        })
    }

    /// Append `session`. The in-memory log is updated even when the
    /// database write fails.
    pub fn record(&mut self, session: TrainingSession) -> Result<(), HistoryError> {
        let persisted = self.db.as_ref().map(|db| db.insert(&session)).transpose();
        self.recent.push(session);
        if self.recent.len() > IN_MEMORY_SESSIONS {
            let excess = self.recent.len() - IN_MEMORY_SESSIONS;
            self.recent.drain(..excess);
        }
        persisted.map(|_| ())
    }

    pub fn sessions(&self) -> &[TrainingSession] {
        &self.recent
    }

    pub fn last(&self) -> Option<&TrainingSession> {
        self.recent.last()
    }

    /// Totals from the database when attached, else from memory.
    pub fn totals(&self) -> Result<HistoryTotals, HistoryError> {
        if let Some(db) = &self.db {
            return db.totals();
        }
        let completed: Vec<&TrainingSession> = self.recent.iter().filter(|s| s.succeeded()).collect();
        let accuracies: Vec<f32> = completed
            .iter()
            .filter_map(|s| s.ann.as_ref().map(|ann| ann.accuracy))
            .collect();
        Ok(HistoryTotals {
            completed: completed.len() as u64,
            failed: (self.recent.len() - completed.len()) as u64,
            samples: completed.iter().map(|s| s.samples_used as u64).sum(),
            mean_accuracy: (!accuracies.is_empty())
                .then(|| accuracies.iter().sum::<f32>() / accuracies.len() as f32),
            last_completed_at: completed.iter().map(|s| s.finished_at).max(),
        })
    }
}
