//! # Sync Status Persistence
//!
//! Durable record of how far the bulk sync of one account has progressed.
//!
//! ## File format
//!
//! The state lives in `<sync_config_dir>/sync-<user_id>` as a versioned
//! envelope whose `data` field is itself a JSON document:
//!
//! ```json
//! {"version":1,"data":"{\"status\":{\"has_labels\":true, ...}}"}
//! ```
//!
//! Every mutation rewrites the whole file through `<path>.tmp` followed by a
//! rename, so a crash leaves either the old or the new status on disk.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Result, SyncError};

pub const SYNC_FILE_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncStatus {
    pub has_labels: bool,
    pub has_messages: bool,
    pub has_message_count: bool,
    pub last_synced_message_id: String,
    pub num_synced_messages: i64,
    pub total_message_count: i64,
    pub failed_message_ids: BTreeSet<String>,
}

impl SyncStatus {
    pub fn is_complete(&self) -> bool {
        self.has_labels && self.has_messages
    }

    /// Whether labels were synced but messages are still missing.
    pub fn in_progress(&self) -> bool {
        self.has_labels && !self.has_messages
    }
}

/// Access to the persisted [`SyncStatus`] of one account.
#[async_trait]
pub trait SyncStateProvider: Send + Sync {
    async fn status(&self) -> Result<SyncStatus>;

    /// Reset to the default status.
    async fn clear(&self) -> Result<()>;

    async fn set_has_labels(&self, value: bool) -> Result<()>;

    async fn set_has_messages(&self, value: bool) -> Result<()>;

    /// Record the last message of a flushed batch and how many it held.
    async fn set_last_message_id(&self, id: &str, count: i64) -> Result<()>;

    async fn set_message_count(&self, total: i64) -> Result<()>;

    async fn add_failed_message_ids(&self, ids: &[String]) -> Result<()>;

    async fn remove_failed_message_ids(&self, ids: &[String]) -> Result<()>;
}

#[derive(Serialize, Deserialize)]
struct SyncStateFile {
    version: u32,
    data: String,
}

#[derive(Serialize, Deserialize)]
struct SyncFileV1 {
    status: SyncStatus,
}

/// Path of the state file of `user_id`.
pub fn sync_state_path(config_dir: &Path, user_id: &str) -> PathBuf {
    config_dir.join(format!("sync-{user_id}"))
}

async fn store_status(status: &SyncStatus, path: &Path) -> Result<()> {
    let data = serde_json::to_string(&SyncFileV1 {
        status: status.clone(),
    })?;
    let file = serde_json::to_vec(&SyncStateFile {
        version: SYNC_FILE_VERSION,
        data,
    })?;

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);

    {
        use tokio::io::AsyncWriteExt;
        let mut handle = options.open(&tmp).await?;
        handle.write_all(&file).await?;
        handle.flush().await?;
        handle.sync_all().await?;
    }

    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

async fn load_status(path: &Path) -> Result<Option<SyncStatus>> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };

    let file: SyncStateFile = serde_json::from_slice(&bytes)?;
    if file.version != SYNC_FILE_VERSION {
        return Err(SyncError::InvalidSyncFileVersion {
            found: file.version,
        });
    }

    let v1: SyncFileV1 = serde_json::from_str(&file.data)?;
    Ok(Some(v1.status))
}

/// File-backed sync state.
#[derive(Debug)]
pub struct FileSyncState {
    path: PathBuf,
    status: Mutex<SyncStatus>,
}

impl FileSyncState {
    /// Load the state at `path`; a missing file yields the default status.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let status = load_status(&path).await?.unwrap_or_default();
        debug!(path = %path.display(), complete = status.is_complete(), "Loaded sync state");

        Ok(Self {
            path,
            status: Mutex::new(status),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn update<F>(&self, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut SyncStatus) -> bool + Send,
    {
        let mut status = self.status.lock().await;
        let previous = status.clone();
        if !mutate(&mut status) {
            return Ok(());
        }

        if let Err(err) = store_status(&status, &self.path).await {
            *status = previous;
            return Err(err);
        }
        Ok(())
    }
}

#[async_trait]
impl SyncStateProvider for FileSyncState {
    async fn status(&self) -> Result<SyncStatus> {
        Ok(self.status.lock().await.clone())
    }

    async fn clear(&self) -> Result<()> {
        self.update(|status| {
            *status = SyncStatus::default();
            true
        })
        .await
    }

    async fn set_has_labels(&self, value: bool) -> Result<()> {
        self.update(|status| {
            status.has_labels = value;
            true
        })
        .await
    }

    async fn set_has_messages(&self, value: bool) -> Result<()> {
        self.update(|status| {
            status.has_messages = value;
            true
        })
        .await
    }

    async fn set_last_message_id(&self, id: &str, count: i64) -> Result<()> {
        self.update(|status| {
            status.last_synced_message_id = id.to_string();
            status.num_synced_messages += count;
            true
        })
        .await
    }

    async fn set_message_count(&self, total: i64) -> Result<()> {
        self.update(|status| {
            status.total_message_count = total;
            status.has_message_count = true;
            true
        })
        .await
    }

    async fn add_failed_message_ids(&self, ids: &[String]) -> Result<()> {
        self.update(|status| {
            let before = status.failed_message_ids.len();
            status.failed_message_ids.extend(ids.iter().cloned());
            before != status.failed_message_ids.len()
        })
        .await
    }

    async fn remove_failed_message_ids(&self, ids: &[String]) -> Result<()> {
        self.update(|status| {
            let before = status.failed_message_ids.len();
            for id in ids {
                status.failed_message_ids.remove(id);
            }
            before != status.failed_message_ids.len()
        })
        .await
    }
}

/// Sync state kept in memory only.
#[derive(Debug, Default)]
pub struct MemorySyncState {
    status: Mutex<SyncStatus>,
}

impl MemorySyncState {
    pub fn new(status: SyncStatus) -> Self {
        Self {
            status: Mutex::new(status),
        }
    }
}

#[async_trait]
impl SyncStateProvider for MemorySyncState {
    async fn status(&self) -> Result<SyncStatus> {
        Ok(self.status.lock().await.clone())
    }

    async fn clear(&self) -> Result<()> {
        *self.status.lock().await = SyncStatus::default();
        Ok(())
    }

    async fn set_has_labels(&self, value: bool) -> Result<()> {
        self.status.lock().await.has_labels = value;
        Ok(())
    }

    async fn set_has_messages(&self, value: bool) -> Result<()> {
        self.status.lock().await.has_messages = value;
        Ok(())
    }

    async fn set_last_message_id(&self, id: &str, count: i64) -> Result<()> {
        let mut status = self.status.lock().await;
        status.last_synced_message_id = id.to_string();
        status.num_synced_messages += count;
        Ok(())
    }

    async fn set_message_count(&self, total: i64) -> Result<()> {
        let mut status = self.status.lock().await;
        status.total_message_count = total;
        status.has_message_count = true;
        Ok(())
    }

    async fn add_failed_message_ids(&self, ids: &[String]) -> Result<()> {
        self.status
            .lock()
            .await
            .failed_message_ids
            .extend(ids.iter().cloned());
        Ok(())
    }

    async fn remove_failed_message_ids(&self, ids: &[String]) -> Result<()> {
        let mut status = self.status.lock().await;
        for id in ids {
            status.failed_message_ids.remove(id);
        }
        Ok(())
    }
}

/// Remove the state file of `user_id`. A missing file is not an error.
pub async fn delete_sync_state(config_dir: &Path, user_id: &str) -> Result<()> {
    match tokio::fs::remove_file(sync_state_path(config_dir, user_id)).await {
        Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(err.into()),
        _ => Ok(()),
    }
}

/// Seed the state file from settings kept by older versions.
///
/// Returns `false` without touching anything when a state file exists.
pub async fn migrate_legacy_sync_settings(
    config_dir: &Path,
    user_id: &str,
    has_labels: bool,
    has_messages: bool,
    failed_message_ids: &[String],
) -> Result<bool> {
    let path = sync_state_path(config_dir, user_id);
    if tokio::fs::try_exists(&path).await? {
        return Ok(false);
    }

    let status = SyncStatus {
        has_labels,
        has_messages,
        has_message_count: has_messages,
        failed_message_ids: failed_message_ids.iter().cloned().collect(),
        ..SyncStatus::default()
    };
    store_status(&status, &path).await?;

    Ok(true)
}
