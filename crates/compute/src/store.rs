//! File persistence for history checkpoints and model snapshots.
//!
//! Every write goes to a sibling `*.tmp` file first and is renamed over the
//! target, so readers never observe a half-written file. Writes carry no
//! timeout: a stalled filesystem stalls the caller.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use flowwatch_core::TrafficSample;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Durable home of the simulator's history buffer.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Read the last checkpoint. `Ok(None)` when nothing was ever written.
    async fn load(&self) -> Result<Option<Vec<TrafficSample>>, StorageError>;

    /// Replace the checkpoint with `samples`.
    async fn save(&self, samples: &[TrafficSample]) -> Result<(), StorageError>;

    /// Human-readable location, for logs.
    fn location(&self) -> String;
}

/// A single pretty-printed JSON array of samples, overwritten on every save.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl HistoryStore for JsonFileStore {
    async fn load(&self) -> Result<Option<Vec<TrafficSample>>, StorageError> {
        if !tokio::fs::try_exists(&self.path).await? {
            return Ok(None);
        }
        let json = tokio::fs::read(&self.path).await?;
        let samples = serde_json::from_slice(&json)?;
        Ok(Some(samples))
    }

    async fn save(&self, samples: &[TrafficSample]) -> Result<(), StorageError> {
        let json = serde_json::to_vec_pretty(samples)?;
        let tmp = tmp_path(&self.path);
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(path = %self.path.display(), samples = samples.len(), "history checkpoint written");
        Ok(())
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}

/// Serialize `value` as pretty JSON and atomically replace `path`.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), StorageError> {
    let json = serde_json::to_vec_pretty(value)?;
    let tmp = tmp_path(path);
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Read a JSON file written by [`write_json_atomic`]. `Ok(None)` if absent.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StorageError> {
    if !path.exists() {
        return Ok(None);
    }
    let json = std::fs::read(path)?;
    Ok(Some(serde_json::from_slice(&json)?))
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
