use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Bridge capability not available: {0}")]
    NotAvailable(String),

    #[error("Bridge operation failed: {0}")]
    OperationFailed(String),

    /// The remote service no longer knows the requested resource.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Operation not allowed: {0}")]
    OperationNotAllowed(String),

    /// The local store has no message with this id.
    #[error("No such message: {0}")]
    NoSuchMessage(String),

    #[error("No such mailbox: {0}")]
    NoSuchMailbox(String),

    /// The local store handle was closed or never attached.
    #[error("Local store is closed")]
    StoreClosed,

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    pub fn label_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "label",
            id: id.into(),
        }
    }

    pub fn message_not_found(id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "message",
            id: id.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
