//! Remote Event Stream
//!
//! The service publishes an ordered stream of account events. The event
//! poller lives with the host; the account actor receives decoded
//! [`RemoteEvent`]s over a channel and uses [`EventCursor`] to move the poll
//! position back when a bulk sync has made earlier events redundant.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::api::{Address, MessageMetadata, RemoteLabel, User};
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventAction {
    Delete,
    Create,
    /// Full update of the resource
    Update,
    /// Flag-only update of a message
    UpdateFlags,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEvent {
    pub id: String,
    pub action: EventAction,
    /// Absent on delete
    pub message: Option<MessageMetadata>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelEvent {
    pub id: String,
    pub action: EventAction,
    /// Absent on delete
    pub label: Option<RemoteLabel>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressEvent {
    pub id: String,
    pub action: EventAction,
    /// Absent on delete
    pub address: Option<Address>,
}

/// One batch of account changes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteEvent {
    pub event_id: String,
    /// The service asks clients to drop their state and start over
    pub refresh: bool,
    pub user: Option<User>,
    pub addresses: Vec<AddressEvent>,
    pub labels: Vec<LabelEvent>,
    pub messages: Vec<MessageEvent>,
}

impl RemoteEvent {
    pub fn is_empty(&self) -> bool {
        !self.refresh
            && self.user.is_none()
            && self.addresses.is_empty()
            && self.labels.is_empty()
            && self.messages.is_empty()
    }
}

/// Position of the host's event poller.
#[async_trait]
pub trait EventCursor: Send + Sync {
    /// Resume polling from `event_id`.
    async fn rewind_event_id(&self, event_id: &str) -> Result<()>;
}
