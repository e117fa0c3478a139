use bridge_traits::BridgeError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error("Sync cancelled")]
    Cancelled,

    #[error("Invalid sync file version: {found}")]
    InvalidSyncFileVersion { found: u32 },

    #[error("Sync state serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Sync state IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(
        "unexpected label conflict: the name of label ID {label_id} is already used by label ID {conflicting_id}"
    )]
    LabelConflict {
        label_id: String,
        conflicting_id: String,
    },

    #[error("Internal mailbox conflict: {0}")]
    InternalLabelConflict(String),

    #[error("No connector available for mailbox lookups")]
    NoConnector,

    #[error("Failed to apply updates: {0}")]
    Apply(String),

    #[error("Sync task failed: {0}")]
    Task(String),
}

impl SyncError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, SyncError::Cancelled)
    }

    /// The remote resource no longer exists.
    pub fn is_not_found(&self) -> bool {
        matches!(self, SyncError::Bridge(err) if err.is_not_found())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
