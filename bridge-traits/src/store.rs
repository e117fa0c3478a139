//! Local Store Abstraction
//!
//! The local protocol server keeps its own mailbox/message database. The sync
//! core never writes to it directly: it publishes [`Update`]s onto a
//! connector's queue, and the server applies them in order and acknowledges
//! each one. Reads that the core needs (conflict detection, hierarchy
//! patching) go through [`LocalStore`].
//!
//! ## Acknowledgements
//!
//! Publishing an update yields a [`PendingUpdate`]. The server side receives
//! the matching [`UpdateEnvelope`] and completes it with the store result.
//! Dropping an envelope without completing it resolves the waiter with
//! [`BridgeError::StoreClosed`](crate::error::BridgeError::StoreClosed).

use std::collections::BTreeSet;
use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::error::{BridgeError, Result};

pub const FLAG_SEEN: &str = "\\Seen";
pub const FLAG_FLAGGED: &str = "\\Flagged";
pub const FLAG_DRAFT: &str = "\\Draft";
pub const FLAG_ANSWERED: &str = "\\Answered";
pub const FLAG_DELETED: &str = "\\Deleted";
/// Both spellings clients use for the forwarded keyword.
pub const FORWARDED_FLAGS: [&str; 2] = ["$Forwarded", "Forwarded"];

pub const ATTR_NO_SELECT: &str = "\\Noselect";
pub const ATTR_NO_INFERIORS: &str = "\\Noinferiors";
pub const ATTR_TRASH: &str = "\\Trash";
pub const ATTR_JUNK: &str = "\\Junk";
pub const ATTR_ALL: &str = "\\All";
pub const ATTR_ARCHIVE: &str = "\\Archive";
pub const ATTR_SENT: &str = "\\Sent";
pub const ATTR_DRAFTS: &str = "\\Drafts";
pub const ATTR_FLAGGED: &str = "\\Flagged";

/// Ordered, case-sensitive set of flags or mailbox attributes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagSet(BTreeSet<String>);

impl FlagSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, flag: impl Into<String>) -> Self {
        self.insert(flag);
        self
    }

    pub fn insert(&mut self, flag: impl Into<String>) {
        self.0.insert(flag.into());
    }

    pub fn remove(&mut self, flag: &str) -> bool {
        self.0.remove(flag)
    }

    pub fn contains(&self, flag: &str) -> bool {
        self.0.contains(flag)
    }

    pub fn contains_any(&self, flags: &[&str]) -> bool {
        flags.iter().any(|flag| self.contains(flag))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl<S: Into<String>> FromIterator<S> for FlagSet {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

/// Mailbox as announced to the local store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mailbox {
    /// Remote label id (or placeholder id)
    pub id: String,
    pub name: Vec<String>,
    pub flags: FlagSet,
    pub permanent_flags: FlagSet,
    pub attributes: FlagSet,
}

/// Message as announced to the local store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: String,
    pub flags: FlagSet,
    pub date: DateTime<Utc>,
}

/// One message to insert, with its RFC 822 literal and target mailboxes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageCreated {
    pub message: Message,
    pub literal: Bytes,
    pub mailbox_ids: Vec<String>,
}

/// Operation applied by the local store, in queue order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Update {
    MailboxCreated(Mailbox),
    /// Rename if the id is known, otherwise create
    MailboxUpdatedOrCreated(Mailbox),
    MailboxUpdated {
        id: String,
        name: Vec<String>,
    },
    MailboxDeleted {
        id: String,
        /// Skip notifying connected clients
        silent: bool,
    },
    MessagesCreated {
        messages: Vec<MessageCreated>,
        ignore_unknown_mailbox_ids: bool,
    },
    /// Full replacement of a message
    MessageUpdated {
        created: MessageCreated,
        allow_create: bool,
    },
    MessageMailboxesUpdated {
        id: String,
        mailbox_ids: Vec<String>,
        flags: FlagSet,
    },
    MessagesDeleted {
        ids: Vec<String>,
    },
}

impl Update {
    pub fn kind(&self) -> &'static str {
        match self {
            Update::MailboxCreated(_) => "MailboxCreated",
            Update::MailboxUpdatedOrCreated(_) => "MailboxUpdatedOrCreated",
            Update::MailboxUpdated { .. } => "MailboxUpdated",
            Update::MailboxDeleted { .. } => "MailboxDeleted",
            Update::MessagesCreated { .. } => "MessagesCreated",
            Update::MessageUpdated { .. } => "MessageUpdated",
            Update::MessageMailboxesUpdated { .. } => "MessageMailboxesUpdated",
            Update::MessagesDeleted { .. } => "MessagesDeleted",
        }
    }
}

impl fmt::Display for Update {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Update::MailboxCreated(mbox) | Update::MailboxUpdatedOrCreated(mbox) => {
                write!(f, "{}: id={}", self.kind(), mbox.id)
            }
            Update::MailboxUpdated { id, .. } | Update::MailboxDeleted { id, .. } => {
                write!(f, "{}: id={}", self.kind(), id)
            }
            Update::MessagesCreated { messages, .. } => {
                write!(f, "{}: count={}", self.kind(), messages.len())
            }
            Update::MessageUpdated { created, .. } => {
                write!(f, "{}: id={}", self.kind(), created.message.id)
            }
            Update::MessageMailboxesUpdated { id, .. } => write!(f, "{}: id={}", self.kind(), id),
            Update::MessagesDeleted { ids } => write!(f, "{}: count={}", self.kind(), ids.len()),
        }
    }
}

/// Update paired with the sender half of its acknowledgement.
#[derive(Debug)]
pub struct UpdateEnvelope {
    pub update: Update,
    ack: oneshot::Sender<Result<()>>,
}

impl UpdateEnvelope {
    /// Complete the update with the local store result.
    pub fn done(self, result: Result<()>) {
        // The waiter may have given up; nothing left to notify then.
        let _ = self.ack.send(result);
    }
}

/// Awaitable acknowledgement of a published update.
#[derive(Debug)]
pub struct PendingUpdate {
    kind: &'static str,
    ack: oneshot::Receiver<Result<()>>,
}

impl PendingUpdate {
    /// Create the envelope/waiter pair for `update`.
    pub fn channel(update: Update) -> (UpdateEnvelope, PendingUpdate) {
        let (tx, rx) = oneshot::channel();
        let kind = update.kind();
        (
            UpdateEnvelope { update, ack: tx },
            PendingUpdate { kind, ack: rx },
        )
    }

    /// A waiter that is already resolved with `result`.
    pub fn resolved(kind: &'static str, result: Result<()>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        PendingUpdate { kind, ack: rx }
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// Wait until the local store has applied the update.
    pub async fn wait(self) -> Result<()> {
        self.ack.await.map_err(|_| BridgeError::StoreClosed)?
    }
}

/// Wait for every update in order, returning the first failure.
pub async fn wait_all(updates: Vec<PendingUpdate>) -> Result<()> {
    for update in updates {
        update.wait().await?;
    }
    Ok(())
}

/// Mailbox row as stored by the local server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMailbox {
    pub internal_id: u64,
    pub remote_id: String,
    pub name: Vec<String>,
}

/// Read and maintenance access to the local protocol server's store.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Look up a mailbox by its full name.
    async fn mailbox_by_name(&self, name: &[String]) -> Result<Option<StoredMailbox>>;

    async fn mailbox_message_count(&self, mailbox: &StoredMailbox) -> Result<usize>;

    async fn mailboxes(&self) -> Result<Vec<StoredMailbox>>;

    /// Rename a mailbox in place without notifying clients.
    async fn rename_mailbox(&self, remote_id: &str, name: Vec<String>) -> Result<()>;

    async fn add_flags_to_all_mailboxes(&self, flags: &[String]) -> Result<()>;

    async fn add_permanent_flags_to_all_mailboxes(&self, flags: &[String]) -> Result<()>;
}
