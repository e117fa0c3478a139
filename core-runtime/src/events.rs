//! # Event Bus System
//!
//! Lifecycle notifications of the mail bridge core, broadcast over
//! `tokio::sync::broadcast`.
//!
//! ## Overview
//!
//! The account actor and the sync pipeline publish [`CoreEvent`]s; the host
//! application (UI, CLI, telemetry forwarders) subscribes. Publishing never
//! blocks and never fails the publisher: emit results are ignored with
//! `.ok()` because having no subscriber is a normal state.
//!
//! ```text
//! ┌───────────────┐     emit      ┌───────────┐
//! │ Account actor ├──────────────>│           │     subscribe    ┌────────────┐
//! └───────────────┘               │ EventBus  ├─────────────────>│ Subscriber │
//! ┌───────────────┐     emit      │           │                  └────────────┘
//! │ Sync reporter ├──────────────>│           │
//! └───────────────┘               └───────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use core_runtime::events::{AccountEvent, CoreEvent, EventBus};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let bus = EventBus::new(16);
//! let mut stream = bus.subscribe();
//!
//! bus.emit(CoreEvent::Account(AccountEvent::LabelDeleted {
//!     user_id: "user-1".to_string(),
//!     label_id: "label-1".to_string(),
//! }))
//! .ok();
//!
//! let event = stream.recv().await.unwrap();
//! assert_eq!(event.description(), "Label deleted");
//! # }
//! ```
//!
//! ## Error Handling
//!
//! - **`RecvError::Lagged(n)`**: the subscriber missed `n` events; keep reading.
//! - **`RecvError::Closed`**: every sender is gone; the subscriber should exit.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

pub use tokio::sync::broadcast::error::{RecvError, SendError, TryRecvError};
pub use tokio::sync::broadcast::Receiver;

/// Default buffer size for the event bus channel.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 100;

// ============================================================================
// Core Event Types
// ============================================================================

/// Top-level event enum encompassing all event categories.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    /// Bulk synchronization lifecycle
    Sync(SyncEvent),
    /// Account-level changes applied by the event loop
    Account(AccountEvent),
}

impl CoreEvent {
    /// Human-readable description of the event.
    pub fn description(&self) -> &str {
        match self {
            CoreEvent::Sync(e) => e.description(),
            CoreEvent::Account(e) => e.description(),
        }
    }

    /// Severity, for hosts that route events into their own logs.
    pub fn severity(&self) -> EventSeverity {
        match self {
            CoreEvent::Sync(SyncEvent::Failed { .. }) => EventSeverity::Error,
            CoreEvent::Account(AccountEvent::BadEvent { .. }) => EventSeverity::Error,
            CoreEvent::Sync(SyncEvent::Finished { .. }) => EventSeverity::Info,
            CoreEvent::Account(AccountEvent::AddressModeChanged { .. }) => EventSeverity::Info,
            _ => EventSeverity::Debug,
        }
    }

    /// User the event belongs to.
    pub fn user_id(&self) -> &str {
        match self {
            CoreEvent::Sync(e) => e.user_id(),
            CoreEvent::Account(e) => e.user_id(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventSeverity {
    Debug,
    Info,
    Warning,
    Error,
}

// ============================================================================
// Sync Events
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum SyncEvent {
    Started {
        user_id: String,
    },
    /// Throttled progress report; `current` and `total` count pipeline steps
    Progress {
        user_id: String,
        current: u64,
        total: u64,
        elapsed_ms: u64,
        remaining_ms: u64,
    },
    Finished {
        user_id: String,
    },
    Failed {
        user_id: String,
        message: String,
    },
    Cancelled {
        user_id: String,
    },
}

impl SyncEvent {
    fn description(&self) -> &str {
        match self {
            SyncEvent::Started { .. } => "Sync started",
            SyncEvent::Progress { .. } => "Sync in progress",
            SyncEvent::Finished { .. } => "Sync finished",
            SyncEvent::Failed { .. } => "Sync failed",
            SyncEvent::Cancelled { .. } => "Sync cancelled",
        }
    }

    fn user_id(&self) -> &str {
        match self {
            SyncEvent::Started { user_id }
            | SyncEvent::Progress { user_id, .. }
            | SyncEvent::Finished { user_id }
            | SyncEvent::Failed { user_id, .. }
            | SyncEvent::Cancelled { user_id } => user_id,
        }
    }

    /// Progress in percent, if this is a progress event.
    pub fn percent(&self) -> Option<u8> {
        match self {
            SyncEvent::Progress { current, total, .. } if *total > 0 => {
                Some(((current.min(total) * 100) / total) as u8)
            }
            _ => None,
        }
    }
}

// ============================================================================
// Account Events
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum AccountEvent {
    LabelCreated {
        user_id: String,
        label_id: String,
        name: String,
    },
    LabelUpdated {
        user_id: String,
        label_id: String,
        name: String,
    },
    LabelDeleted {
        user_id: String,
        label_id: String,
    },
    /// Local state could not follow the remote event stream
    BadEvent {
        user_id: String,
        message: String,
    },
    AddressModeChanged {
        user_id: String,
        split: bool,
    },
    /// The remote service requested a full refresh
    Refreshed {
        user_id: String,
    },
}

impl AccountEvent {
    fn description(&self) -> &str {
        match self {
            AccountEvent::LabelCreated { .. } => "Label created",
            AccountEvent::LabelUpdated { .. } => "Label updated",
            AccountEvent::LabelDeleted { .. } => "Label deleted",
            AccountEvent::BadEvent { .. } => "Bad remote event",
            AccountEvent::AddressModeChanged { .. } => "Address mode changed",
            AccountEvent::Refreshed { .. } => "Account refreshed",
        }
    }

    fn user_id(&self) -> &str {
        match self {
            AccountEvent::LabelCreated { user_id, .. }
            | AccountEvent::LabelUpdated { user_id, .. }
            | AccountEvent::LabelDeleted { user_id, .. }
            | AccountEvent::BadEvent { user_id, .. }
            | AccountEvent::AddressModeChanged { user_id, .. }
            | AccountEvent::Refreshed { user_id } => user_id,
        }
    }
}

// ============================================================================
// Event Bus
// ============================================================================

/// Central broadcast channel for [`CoreEvent`]s.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    /// Create a bus buffering at most `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event. Fails only when nobody is subscribed.
    pub fn emit(&self, event: CoreEvent) -> Result<usize, SendError<CoreEvent>> {
        self.sender.send(event)
    }

    pub fn subscribe(&self) -> Receiver<CoreEvent> {
        self.sender.subscribe()
    }

    /// Subscribe to the events of one account only.
    pub fn account_stream(&self, user_id: impl Into<String>) -> AccountStream {
        AccountStream {
            user_id: user_id.into(),
            receiver: self.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_SIZE)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

/// Receiver that drops events of other accounts.
#[derive(Debug)]
pub struct AccountStream {
    user_id: String,
    receiver: Receiver<CoreEvent>,
}

impl AccountStream {
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Next event of this account. Lagging is reported like on a plain
    /// [`Receiver`]; the stream stays usable afterwards.
    pub async fn recv(&mut self) -> Result<CoreEvent, RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if event.user_id() == self.user_id {
                return Ok(event);
            }
        }
    }

    /// Like [`recv`](Self::recv) but returns `None` instead of waiting.
    pub fn try_recv(&mut self) -> Option<Result<CoreEvent, RecvError>> {
        loop {
            let event = match self.receiver.try_recv() {
                Ok(event) => event,
                Err(TryRecvError::Empty) => return None,
                Err(TryRecvError::Lagged(n)) => return Some(Err(RecvError::Lagged(n))),
                Err(TryRecvError::Closed) => return Some(Err(RecvError::Closed)),
            };
            if event.user_id() == self.user_id {
                return Some(Ok(event));
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
