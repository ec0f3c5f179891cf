//! JSON file adapter for the memory storage port.

use std::path::{Path, PathBuf};

use agent::MemoryStorage;
use async_trait::async_trait;
use proto::{MemoryError, MemoryRecord};
use tracing::{debug, warn};

/// Persists the record set as a JSON array in one file.
///
/// Writes go to a sibling temp file that is renamed over the target, so a
/// crash mid-write leaves the previous set intact.
pub struct JsonFileStorage {
    path: PathBuf,
}

impl JsonFileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

fn storage_err(context: &str, e: impl std::fmt::Display) -> MemoryError {
    MemoryError::Storage(format!("{context}: {e}"))
}

#[async_trait]
impl MemoryStorage for JsonFileStorage {
    async fn load(&self) -> Result<Vec<MemoryRecord>, MemoryError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No memory file yet");
                return Ok(Vec::new());
            }
            Err(e) => return Err(storage_err("read", e)),
        };
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&content).map_err(|e| {
            warn!(path = %self.path.display(), error = %e, "Memory file is corrupt");
            storage_err("parse", e)
        })
    }

    async fn save(&self, records: &[MemoryRecord]) -> Result<(), MemoryError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| storage_err("create dir", e))?;
        }
        let json = serde_json::to_vec_pretty(records).map_err(|e| storage_err("encode", e))?;
        let temp = self.temp_path();
        tokio::fs::write(&temp, json)
            .await
            .map_err(|e| storage_err("write", e))?;
        tokio::fs::rename(&temp, &self.path)
            .await
            .map_err(|e| storage_err("rename", e))?;
        debug!(path = %self.path.display(), count = records.len(), "Memories written");
        Ok(())
    }

    async fn clear(&self) -> Result<(), MemoryError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(storage_err("remove", e)),
        }
    }
}
