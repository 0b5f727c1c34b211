use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::{read_json, write_json_atomic, StorageError};

use super::FittedModel;

/// Bumped whenever the on-disk model layout changes.
pub const SNAPSHOT_VERSION: u32 = 1;

/// On-disk form of a fitted model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSnapshot {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub model: FittedModel,
}

impl ModelSnapshot {
    pub fn new(model: &FittedModel) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            saved_at: Utc::now(),
            model: model.clone(),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), StorageError> {
        write_json_atomic(path, self)
    }

    /// `Ok(None)` when no snapshot exists at `path`.
    pub fn load(path: &Path) -> Result<Option<Self>, StorageError> {
        read_json(path)
    }
}
