use bridge_traits::BridgeError;
use core_sync::SyncError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("Runtime error: {0}")]
    Runtime(#[from] core_runtime::Error),

    /// Rejected by mailbox policy; clients see a plain "not allowed".
    #[error("Operation not allowed: {0}")]
    OperationNotAllowed(String),

    #[error("Unknown address: {0}")]
    UnknownAddress(String),

    #[error("No unlocked keyring for address {0}")]
    MissingKeyRing(String),

    #[error("Failed to build message {message_id}: {reason}")]
    Build { message_id: String, reason: String },

    #[error("Unexpected connector state: {0}")]
    ConnectorState(String),

    #[error("Account service stopped")]
    ServiceStopped,
}

impl ServiceError {
    pub fn not_allowed(reason: impl Into<String>) -> Self {
        Self::OperationNotAllowed(reason.into())
    }

    pub fn is_not_allowed(&self) -> bool {
        matches!(
            self,
            Self::OperationNotAllowed(_) | Self::Bridge(BridgeError::OperationNotAllowed(_))
        )
    }

    /// The local store reported an unknown message.
    pub fn is_no_such_message(&self) -> bool {
        matches!(
            self,
            Self::Bridge(BridgeError::NoSuchMessage(_))
                | Self::Sync(SyncError::Bridge(BridgeError::NoSuchMessage(_)))
        )
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Bridge(err) => err.is_not_found(),
            Self::Sync(err) => err.is_not_found(),
            _ => false,
        }
    }
}

/// Mail clients only see the bridge error taxonomy.
impl From<ServiceError> for BridgeError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Bridge(err) => err,
            ServiceError::Sync(SyncError::Bridge(err)) => err,
            ServiceError::OperationNotAllowed(reason) => BridgeError::OperationNotAllowed(reason),
            other => BridgeError::OperationFailed(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ServiceError>;
