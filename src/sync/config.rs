use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::storage::StorageError;

/// Configuration of the offline data layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OfflineConfig {
    /// Root directory for the snapshot cache and the mutation queue
    pub data_dir: PathBuf,
    /// Quiet period after the last edit before autosave fires
    pub debounce_ms: u64,
    /// How long saved/pending/error stays visible before falling back to idle
    pub status_display_ms: u64,
    /// What the sync engine does with an entry the server refuses
    pub rejection_policy: ServerRejectionPolicy,
    /// Retry a failed drain this often while online (disabled when unset)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_interval_secs: Option<u64>,
    /// Refetch the tree from the server after a drain that applied entries
    pub refresh_after_sync: bool,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("nous-offline"),
            debounce_ms: 1000,
            status_display_ms: 2000,
            rejection_policy: ServerRejectionPolicy::DeadLetter,
            retry_interval_secs: None,
            refresh_after_sync: true,
        }
    }
}

/// Handling of queue entries the server answers with a rejection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum ServerRejectionPolicy {
    /// Move the entry, and every later entry for the same note, to the
    /// rejected area and keep draining other notes
    #[default]
    DeadLetter,
    /// Stop draining, like a network failure, until the entry is dealt with
    Block,
}

/// Smallest allowed retry interval, to prevent runaway syncing
const MIN_RETRY_INTERVAL_SECS: u64 = 5;

impl OfflineConfig {
    pub fn with_data_dir(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            ..Default::default()
        }
    }

    /// Default data directory for this device
    pub fn default_data_dir() -> Result<PathBuf, StorageError> {
        dirs::data_local_dir()
            .map(|p| p.join("nous").join("offline"))
            .ok_or(StorageError::DataDirNotFound)
    }

    /// Load from file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, StorageError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }

    /// Save to file
    pub fn save(&self, path: &Path) -> Result<(), StorageError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_string_pretty(self)?;
        std::fs::write(path, data)?;
        Ok(())
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.data_dir.join("snapshots")
    }

    pub fn queue_dir(&self) -> PathBuf {
        self.data_dir.join("queue")
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn status_display(&self) -> Duration {
        Duration::from_millis(self.status_display_ms)
    }

    pub fn retry_interval(&self) -> Option<Duration> {
        self.retry_interval_secs
            .map(|secs| Duration::from_secs(secs.max(MIN_RETRY_INTERVAL_SECS)))
    }
}
