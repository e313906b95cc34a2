use std::path::{Path, PathBuf};

use super::{Checkpoint, CheckpointError};
use crate::app_dirs;

/// File holding the committed checkpoint.
pub const CHECKPOINT_FILE_NAME: &str = "current.json";

/// JSON persistence for the single current checkpoint.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
}

impl CheckpointStore {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            path: dir.join(CHECKPOINT_FILE_NAME),
        }
    }

    /// `<app root>/checkpoints/current.json`.
    pub fn default_location() -> Result<Self, CheckpointError> {
        Ok(Self::in_dir(&app_dirs::checkpoints_dir()?))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The persisted checkpoint, or `None` when nothing has been committed yet.
    pub fn load(&self) -> Result<Option<Checkpoint>, CheckpointError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(&self.path).map_err(|source| CheckpointError::Read {
            path: self.path.clone(),
            source,
        })?;
        let checkpoint: Checkpoint =
            serde_json::from_slice(&bytes).map_err(|source| CheckpointError::Parse {
                path: self.path.clone(),
                source,
            })?;
        checkpoint.state.validate().map_err(|message| CheckpointError::Invalid {
            path: self.path.clone(),
            message,
        })?;
        Ok(Some(checkpoint))
    }

    pub fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        let data = serde_json::to_vec(checkpoint).map_err(CheckpointError::Serialize)?;
        crate::atomic_file::write_atomic(&self.path, &data).map_err(|source| CheckpointError::Write {
            path: self.path.clone(),
            source,
        })?;
        tracing::debug!(
            path = %self.path.display(),
            version = checkpoint.version,
            bytes = data.len(),
            "checkpoint written"
        );
        Ok(())
    }
}
