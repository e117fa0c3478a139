//! # Account Service
//!
//! Per-account runtime of the mail bridge: connectors for the local protocol
//! server and the actor that keeps them in step with the remote service.
//!
//! ## Overview
//!
//! - **Connector** (`connector`): one per exposed address; answers mail
//!   client operations against the remote API and queues store updates
//! - **Account actor** (`account`): owns the connectors, runs the bulk sync
//!   and applies remote events (`handlers`)
//! - **Sync applier** (`applier`): publishes bulk sync batches through the
//!   actor
//! - **Message builder** (`builder`): decrypts messages with the keyring of
//!   their address
//! - **Registry** (`registry`): contract with the protocol server's user
//!   manager
//!
//! Desktop hosts enable the `desktop-shims` feature to get the adapters from
//! `bridge-desktop` re-exported here.

pub mod account;
pub mod applier;
pub mod builder;
pub mod connector;
pub mod error;
mod handlers;
pub mod queue;
pub mod registry;

#[cfg(test)]
pub(crate) mod testing;

pub use account::{AccountDeps, AccountInputs, AccountService};
pub use applier::SyncUpdateApplier;
pub use builder::CryptoMessageBuilder;
pub use connector::{Connector, ConnectorContext, ConnectorSet, MailboxVisibility};
pub use error::{Result, ServiceError};
pub use queue::{UpdateQueue, UpdateReceiver};
pub use registry::ConnectorRegistry;

#[cfg(all(feature = "desktop-shims", not(target_arch = "wasm32")))]
pub use bridge_desktop::{DesktopNetworkMonitor, DesktopSystemMemory};
