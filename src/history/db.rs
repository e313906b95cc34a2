use std::path::{Path, PathBuf};

use rusqlite::{Connection, OptionalExtension, params};
use time::OffsetDateTime;

use super::{HistoryError, HistoryTotals, SessionOutcome, TrainingSession};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS training_sessions (
    id TEXT PRIMARY KEY,
    started_at INTEGER NOT NULL,
    finished_at INTEGER NOT NULL,
    trigger TEXT NOT NULL,
    mode TEXT NOT NULL,
    outcome TEXT NOT NULL,
    samples INTEGER NOT NULL,
    ann_accuracy REAL,
    snn_accuracy REAL,
    error TEXT,
    detail_json TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_training_sessions_finished
    ON training_sessions (finished_at);";

/// Insert-only SQLite log of finished sessions.
pub struct HistoryDb {
    conn: Connection,
    path: Option<PathBuf>,
}

impl HistoryDb {
    pub fn open(path: &Path) -> Result<Self, HistoryError> {
        let conn = Connection::open(path).map_err(|source| HistoryError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous = NORMAL;",
        )?;
        Self::init(conn, Some(path.to_path_buf()))
    }

    pub fn open_in_memory() -> Result<Self, HistoryError> {
        Self::init(Connection::open_in_memory()?, None)
    }

    fn init(conn: Connection, path: Option<PathBuf>) -> Result<Self, HistoryError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn, path })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn insert(&self, session: &TrainingSession) -> Result<(), HistoryError> {
        let detail = serde_json::to_string(session)?;
        let (outcome, error) = match &session.outcome {
            SessionOutcome::Completed => ("completed", None),
            SessionOutcome::Failed { error } => ("failed", Some(error.as_str())),
        };
        self.conn.execute(
            "INSERT INTO training_sessions
                (id, started_at, finished_at, trigger, mode, outcome, samples,
                 ann_accuracy, snn_accuracy, error, detail_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                session.id.to_string(),
                session.started_at.unix_timestamp(),
                session.finished_at.unix_timestamp(),
                session.trigger.as_str(),
                session.mode.as_str(),
                outcome,
                session.samples_used as i64,
                session.ann.as_ref().map(|ann| f64::from(ann.accuracy)),
                session.snn.as_ref().map(|snn| f64::from(snn.accuracy)),
                error,
                detail,
            ],
        )?;
        Ok(())
    }

    /// Up to `limit` most recent sessions, oldest first.
    pub fn recent(&self, limit: usize) -> Result<Vec<TrainingSession>, HistoryError> {
        let mut stmt = self.conn.prepare(
            "SELECT detail_json FROM training_sessions
             ORDER BY finished_at DESC, rowid DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| row.get::<_, String>(0))?;
        let mut sessions = Vec::new();
        for row in rows {
            sessions.push(serde_json::from_str::<TrainingSession>(&row?)?);
        }
        sessions.reverse();
        Ok(sessions)
    }

    pub fn totals(&self) -> Result<HistoryTotals, HistoryError> {
        let (completed, failed, samples, mean_accuracy): (i64, i64, i64, Option<f64>) = self.conn.query_row(
            "SELECT
                COALESCE(SUM(outcome = 'completed'), 0),
                COALESCE(SUM(outcome = 'failed'), 0),
                COALESCE(SUM(CASE WHEN outcome = 'completed' THEN samples ELSE 0 END), 0),
                AVG(CASE WHEN outcome = 'completed' THEN ann_accuracy END)
             FROM training_sessions",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )?;
        let last_completed: Option<i64> = self
            .conn
            .query_row(
                "SELECT finished_at FROM training_sessions
                 WHERE outcome = 'completed'
                 ORDER BY finished_at DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        let last_completed_at = last_completed
            .map(OffsetDateTime::from_unix_timestamp)
            .transpose()
            .map_err(|err| HistoryError::Timestamp(err.to_string()))?;
        Ok(HistoryTotals {
            completed: completed.max(0) as u64,
            failed: failed.max(0) as u64,
            samples: samples.max(0) as u64,
            mean_accuracy: mean_accuracy.map(|v| v as f32),
            last_completed_at,
        })
    }
}
