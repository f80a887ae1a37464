//! Resumable history checkpoints and their storage.
//!
//! A checkpoint records how far a history download got, keyed by device id.
//! Stores only ever touch the key of the device they are asked about, so one
//! store can serve every device in a pool.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tracing::debug;

use flora_types::DeviceId;

use crate::error::{Error, Result};

/// Default age after which a checkpoint is discarded.
pub const DEFAULT_CHECKPOINT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Progress of a history download, persisted as a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistorySessionProgress {
    /// Device this checkpoint belongs to.
    pub device_id: DeviceId,
    /// Next entry index to fetch.
    pub current_index: u16,
    /// Entries on the device when the download started.
    pub total_entries: u16,
    /// When the checkpoint was written.
    #[serde(with = "time::serde::rfc3339")]
    pub last_update: OffsetDateTime,
    /// Wall-clock time the device booted, if it was read.
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub device_boot_time: Option<OffsetDateTime>,
}

impl HistorySessionProgress {
    /// Structural check: `0 <= current_index <= total_entries` and `total_entries > 0`.
    pub fn is_valid(&self) -> bool {
        self.total_entries > 0 && self.current_index <= self.total_entries
    }

    /// Returns `true` if the checkpoint is older than `ttl` at `now`.
    pub fn is_expired(&self, now: OffsetDateTime, ttl: Duration) -> bool {
        let age = now - self.last_update;
        age.is_negative() || age.unsigned_abs() > ttl
    }

    /// Returns `true` if the checkpoint can be resumed at `now`.
    pub fn is_resumable(&self, now: OffsetDateTime, ttl: Duration) -> bool {
        self.is_valid() && !self.is_expired(now, ttl) && self.current_index < self.total_entries
    }
}

/// Persistent storage for history checkpoints.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Load the checkpoint for a device, if one exists.
    async fn load(&self, device_id: &DeviceId) -> Result<Option<HistorySessionProgress>>;

    /// Save or replace the checkpoint for `progress.device_id`.
    async fn save(&self, progress: &HistorySessionProgress) -> Result<()>;

    /// Remove the checkpoint for a device.
    async fn clear(&self, device_id: &DeviceId) -> Result<()>;
}

/// Checkpoints held in memory for the lifetime of the process.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    entries: RwLock<HashMap<DeviceId, HistorySessionProgress>>,
}

impl MemoryCheckpointStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored checkpoints.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Returns `true` if no checkpoint is stored.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, device_id: &DeviceId) -> Result<Option<HistorySessionProgress>> {
        Ok(self.entries.read().await.get(device_id).cloned())
    }

    async fn save(&self, progress: &HistorySessionProgress) -> Result<()> {
        self.entries
            .write()
            .await
            .insert(progress.device_id.clone(), progress.clone());
        Ok(())
    }

    async fn clear(&self, device_id: &DeviceId) -> Result<()> {
        self.entries.write().await.remove(device_id);
        Ok(())
    }
}

/// Checkpoints stored as one JSON file per device in a directory.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    /// Use `dir` for checkpoint files. The directory is created on first save.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory holding the checkpoint files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the checkpoint file for a device.
    pub fn path_for(&self, device_id: &DeviceId) -> PathBuf {
        let file_name: String = device_id
            .as_str()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.json", file_name))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self, device_id: &DeviceId) -> Result<Option<HistorySessionProgress>> {
        let path = self.path_for(device_id);
        let content = match tokio::fs::read(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let progress: HistorySessionProgress = serde_json::from_slice(&content)?;
        if &progress.device_id != device_id {
            return Err(Error::Checkpoint(format!(
                "{} holds a checkpoint for {}",
                path.display(),
                progress.device_id
            )));
        }
        debug!("Loaded checkpoint from {}", path.display());
        Ok(Some(progress))
    }

    async fn save(&self, progress: &HistorySessionProgress) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(&progress.device_id);
        let tmp = path.with_extension("json.tmp");
        let content = serde_json::to_vec_pretty(progress)?;
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn clear(&self, device_id: &DeviceId) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(device_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
