//! # Mail Sync Core
//!
//! Mirrors a remote, end-to-end-encrypted mailbox into the store of the local
//! protocol server.
//!
//! ## Overview
//!
//! This crate owns everything between the remote API and the update queues of
//! the local store:
//! - Turning remote labels into mailbox names and updates (`mailbox`)
//! - Resolving mailbox name collisions before labels are created
//!   (`conflict_resolver`)
//! - The staged bulk download/build/apply pipeline (`pipeline`)
//! - The retrying sync loop of one account (`handler`)
//! - Durable sync progress and memory budgeting (`status`, `limits`)
//!
//! ## Components
//!
//! - **Label Directory** (`labels`): Shared, lock-guarded label set
//! - **Identity** (`identity`): User, addresses and unlocked keyrings
//! - **Store Handle** (`store_handle`): Detachable access to a connector's store
//! - **Sync Reporter** (`progress`): Lifecycle and progress events on the event bus
//! - **Message Updates** (`message`): Built and placeholder message literals

pub mod conflict_resolver;
pub mod error;
pub mod handler;
pub mod identity;
pub mod labels;
pub mod limits;
pub mod mailbox;
pub mod message;
pub mod pipeline;
pub mod progress;
pub mod status;
pub mod store_handle;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{Result, SyncError};
pub use conflict_resolver::{
    ConnectorStores, InternalLabelConflictResolver, LabelConflictManager, LabelConflictResolver,
    MailboxLookup, UpdateThunk,
};
pub use handler::{SyncFinished, SyncHandler};
pub use identity::{IdentityState, SharedIdentity};
pub use labels::{LabelDirectory, LabelMap};
pub use limits::SyncLimits;
pub use message::BuildResult;
pub use pipeline::{MessageBuilder, ProgressReporter, SyncJob, UpdateApplier};
pub use progress::SyncReporter;
pub use status::{FileSyncState, MemorySyncState, SyncStateProvider, SyncStatus};
pub use store_handle::StoreHandle;
