//! The committed learnable state and its rollback semantics.
//!
//! A session trains on a copy obtained from [`CheckpointManager::begin_session`].
//! The copy becomes the new checkpoint only through [`CheckpointManager::save`];
//! on failure [`CheckpointManager::restore`] hands back the committed state
//! unchanged.

mod store;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

use crate::federated::FederatedState;
use crate::learn::{EwcState, MetaState};
use crate::ml::ModelState;
use crate::settings::VigilSettings;

pub use store::{CHECKPOINT_FILE_NAME, CheckpointStore};

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Checkpoint directory unavailable: {0}")]
    Directory(#[from] crate::app_dirs::AppDirError),
    #[error("Failed to read checkpoint {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to write checkpoint {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Checkpoint {path} is not valid JSON: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("Failed to serialize checkpoint: {0}")]
    Serialize(serde_json::Error),
    #[error("Checkpoint {path} is unusable: {message}")]
    Invalid { path: PathBuf, message: String },
    #[error("Refusing to commit inconsistent state: {0}")]
    Rejected(String),
}

/// Everything a session may change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainableState {
    pub model: ModelState,
    pub ewc: EwcState,
    pub meta: MetaState,
    pub federated: FederatedState,
}

impl TrainableState {
    /// Fresh state with a new install identity.
    pub fn initial(settings: &VigilSettings) -> Self {
        let model = ModelState::initial(&settings.model, &settings.spiking);
        let ewc = EwcState::empty(&model.ann);
        let federated = FederatedState::new(model.ann.params());
        Self {
            model,
            ewc,
            meta: MetaState::from_settings(&settings.learner),
            federated,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        self.model.validate()?;
        if !self.ewc.matches(&self.model.ann) {
            return Err("consolidation state does not match the network".to_string());
        }
        if !self.ewc.is_finite() {
            return Err("consolidation state contains non-finite values".to_string());
        }
        if self.federated.baseline.len() != self.model.ann.param_count() {
            return Err("contribution baseline does not match the network".to_string());
        }
        if self.federated.baseline.iter().any(|v| !v.is_finite()) {
            return Err("contribution baseline contains non-finite values".to_string());
        }
        Ok(())
    }

    /// Same feature length, hidden size and class vocabulary.
    pub fn same_shape(&self, other: &TrainableState) -> bool {
        self.model.classes == other.model.classes
            && self.model.ann.input_len == other.model.ann.input_len
            && self.model.ann.hidden_size == other.model.ann.hidden_size
    }
}

/// A committed [`TrainableState`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Increments on every commit; 0 is the untrained initial state.
    pub version: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub state: TrainableState,
}

/// Holds exactly one current checkpoint, optionally mirrored to disk.
#[derive(Debug)]
pub struct CheckpointManager {
    committed: Checkpoint,
    store: Option<CheckpointStore>,
}

impl CheckpointManager {
    pub fn in_memory(initial: TrainableState, now: OffsetDateTime) -> Self {
        Self {
            committed: Checkpoint {
                version: 0,
                created_at: now,
                state: initial,
            },
            store: None,
        }
    }

    /// Resume from the store, or start from `fallback` when nothing usable is
    /// persisted. The fallback is not written until the first commit.
    pub fn load_or_init(
        store: CheckpointStore,
        fallback: TrainableState,
        now: OffsetDateTime,
    ) -> Result<Self, CheckpointError> {
        let committed = match store.load() {
            Ok(Some(checkpoint)) if checkpoint.state.same_shape(&fallback) => {
                tracing::info!(
                    version = checkpoint.version,
                    path = %store.path().display(),
                    "resumed checkpoint"
                );
                checkpoint
            }
            Ok(Some(checkpoint)) => {
                tracing::warn!(
                    version = checkpoint.version,
                    "persisted checkpoint does not match the configured model; starting fresh"
                );
                fresh(fallback, now)
            }
            Ok(None) => fresh(fallback, now),
            Err(err @ (CheckpointError::Parse { .. } | CheckpointError::Invalid { .. })) => {
                tracing::warn!(error = %err, "ignoring unusable checkpoint");
                fresh(fallback, now)
            }
            Err(err) => return Err(err),
        };
        Ok(Self {
            committed,
            store: Some(store),
        })
    }

    pub fn current(&self) -> &Checkpoint {
        &self.committed
    }

    /// Working copy for a new session.
    pub fn begin_session(&self) -> TrainableState {
        self.committed.state.clone()
    }

    /// Commit `state` as the new checkpoint. Nothing changes if persisting fails.
    pub fn save(&mut self, state: TrainableState, now: OffsetDateTime) -> Result<&Checkpoint, CheckpointError> {
        state.validate().map_err(CheckpointError::Rejected)?;
        let candidate = Checkpoint {
            version: self.committed.version + 1,
            created_at: now,
            state,
        };
        if let Some(store) = &self.store {
            store.save(&candidate)?;
        }
        self.committed = candidate;
        Ok(&self.committed)
    }

    /// The last committed state, exactly as it was saved.
    pub fn restore(&self) -> TrainableState {
        self.committed.state.clone()
    }
}

fn fresh(state: TrainableState, now: OffsetDateTime) -> Checkpoint {
    Checkpoint {
        version: 0,
        created_at: now,
        state,
    }
}
