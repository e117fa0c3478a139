//! # Host Bridge Traits
//!
//! Capability traits and the shared data model of the mail bridge core.
//!
//! ## Overview
//!
//! This crate defines the contract between the sync core and everything it
//! does not own: the remote mail service, the local protocol server's store,
//! the crypto engine, telemetry and the host platform. Each trait is a narrow
//! capability consumed by exactly the components that need it.
//!
//! ## Traits
//!
//! ### Remote service
//! - [`RemoteApi`](api::RemoteApi) - Labels, messages, addresses and counts
//! - [`EventCursor`](remote_events::EventCursor) - Rewind the event poller
//!
//! ### Local server
//! - [`LocalStore`](store::LocalStore) - Mailbox lookups and maintenance
//! - [`PendingUpdate`](store::PendingUpdate) - Acknowledgement of a queued [`Update`](store::Update)
//!
//! ### Crypto & Reporting
//! - [`MessageCrypto`](crypto::MessageCrypto) - Key unlocking and message assembly
//! - [`Telemetry`](telemetry::Telemetry) - Error and config-status reports
//!
//! ### Platform Integration
//! - [`NetworkMonitor`](network::NetworkMonitor) - Connectivity detection
//! - [`SystemMemory`](system::SystemMemory) - Physical memory probe
//! - [`LoggerSink`](time::LoggerSink) - Forward structured logs to host logging
//!
//! Desktop implementations of the platform traits live in `bridge-desktop`.
//!
//! ## Errors
//!
//! Every trait returns [`BridgeError`](error::BridgeError). Two variants
//! drive control flow: `NotFound` when the remote resource disappeared and
//! `StoreClosed` when the local store went away. Anything else is
//! propagated.

pub mod api;
pub mod crypto;
pub mod error;
pub mod network;
pub mod remote_events;
pub mod store;
pub mod system;
pub mod telemetry;
pub mod time;

pub use error::BridgeError;

pub use api::{
    label_ids, Address, AddressStatus, Attachment, FullMessage, LabelKind, MessageFilter,
    MessageFlags, MessageMetadata, RemoteApi, RemoteLabel, RemoteMessage, User,
};
pub use crypto::{KeyRing, MessageCrypto};
pub use network::{NetworkChangeStream, NetworkInfo, NetworkMonitor, NetworkStatus};
pub use remote_events::{AddressEvent, EventAction, EventCursor, LabelEvent, MessageEvent, RemoteEvent};
pub use store::{
    FlagSet, LocalStore, Mailbox, Message, MessageCreated, PendingUpdate, StoredMailbox, Update,
    UpdateEnvelope,
};
pub use system::{FixedSystemMemory, SystemMemory};
pub use telemetry::{NoopTelemetry, ReportContext, Telemetry};
pub use time::{Clock, LogEntry, LogLevel, LoggerSink, SystemClock};
