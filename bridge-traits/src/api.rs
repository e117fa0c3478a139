//! Remote Mail API Abstraction
//!
//! Data model and capability trait for the remote, end-to-end-encrypted mail
//! service. The HTTP client, authentication and request retries live behind
//! this trait; the sync core only sees typed results and [`BridgeError`]s.
//!
//! Missing resources are always reported as [`BridgeError::NotFound`], which
//! covers both "no such label" answers and unprocessable-entity responses for
//! messages deleted remotely in the meantime.
//!
//! [`BridgeError`]: crate::error::BridgeError
//! [`BridgeError::NotFound`]: crate::error::BridgeError::NotFound

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Well-known ids of system labels.
pub mod label_ids {
    pub const INBOX: &str = "0";
    pub const ALL_DRAFTS: &str = "1";
    pub const ALL_SENT: &str = "2";
    pub const TRASH: &str = "3";
    pub const SPAM: &str = "4";
    pub const ALL_MAIL: &str = "5";
    pub const ARCHIVE: &str = "6";
    pub const SENT: &str = "7";
    pub const DRAFTS: &str = "8";
    pub const OUTBOX: &str = "9";
    pub const STARRED: &str = "10";
    pub const ALL_SCHEDULED: &str = "12";
}

/// Kind of a remote label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LabelKind {
    /// Non-exclusive tag
    Label,
    /// Contact group, never exposed as a mailbox
    ContactGroup,
    /// Exclusive, folder-like label
    Folder,
    /// Built-in label (Inbox, Trash, ...)
    System,
}

impl LabelKind {
    /// Kinds the bridge exposes as mailboxes.
    pub const EXPOSED: [LabelKind; 3] = [LabelKind::Folder, LabelKind::Label, LabelKind::System];
}

/// A remote label as last reported by the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteLabel {
    pub id: String,
    pub parent_id: Option<String>,
    pub name: String,
    /// Full hierarchical path, the last segment being `name`
    pub path: Vec<String>,
    pub color: String,
    pub kind: LabelKind,
}

impl RemoteLabel {
    pub fn new(id: impl Into<String>, path: Vec<String>, kind: LabelKind) -> Self {
        let name = path.last().cloned().unwrap_or_default();
        Self {
            id: id.into(),
            parent_id: None,
            name,
            path,
            color: String::new(),
            kind,
        }
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }
}

bitflags::bitflags! {
    /// Message flags as reported by the service.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct MessageFlags: u64 {
        const RECEIVED = 1;
        const SENT = 1 << 1;
        const INTERNAL = 1 << 2;
        const REPLIED = 1 << 5;
        const REPLIED_ALL = 1 << 6;
        const FORWARDED = 1 << 7;
        const IMPORTED = 1 << 9;
    }
}

/// Lightweight per-message metadata returned by listing calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageMetadata {
    pub id: String,
    pub address_id: String,
    pub label_ids: Vec<String>,
    pub subject: String,
    /// Unix timestamp in seconds; zero when unknown
    pub time: i64,
    /// Expected encrypted size in bytes
    pub size: u64,
    pub unread: bool,
    pub is_replied: bool,
    pub is_replied_all: bool,
    pub is_forwarded: bool,
    pub flags: MessageFlags,
}

impl MessageMetadata {
    pub fn seen(&self) -> bool {
        !self.unread
    }

    pub fn starred(&self) -> bool {
        self.has_label(label_ids::STARRED)
    }

    pub fn has_label(&self, label_id: &str) -> bool {
        self.label_ids.iter().any(|id| id == label_id)
    }

    pub fn is_draft(&self) -> bool {
        !self
            .flags
            .intersects(MessageFlags::RECEIVED | MessageFlags::SENT)
    }

    pub fn is_sent(&self) -> bool {
        self.flags.contains(MessageFlags::SENT)
    }
}

/// Attachment descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    pub name: String,
    pub size: u64,
    pub mime_type: String,
}

/// Message with its encrypted body and attachment descriptors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMessage {
    pub metadata: MessageMetadata,
    /// Armored encrypted body
    pub body: String,
    pub mime_type: String,
    pub attachments: Vec<Attachment>,
}

/// Message plus the raw (encrypted) bytes of every attachment, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FullMessage {
    pub message: RemoteMessage,
    pub attachment_data: Vec<Bytes>,
}

impl FullMessage {
    pub fn id(&self) -> &str {
        &self.message.metadata.id
    }

    pub fn metadata(&self) -> &MessageMetadata {
        &self.message.metadata
    }
}

/// Filter for metadata listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageFilter {
    pub ids: Vec<String>,
    pub label_id: Option<String>,
    /// Listing resumes from (and includes) this id
    pub end_id: Option<String>,
    pub desc: bool,
}

/// Per-label message counts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageGroupCount {
    pub label_id: String,
    pub total: u64,
    pub unread: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddressStatus {
    Disabled,
    Enabled,
    Deleting,
}

/// A user address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub id: String,
    pub email: String,
    pub status: AddressStatus,
    /// Display order; the lowest order is the primary address
    pub order: u32,
}

impl Address {
    pub fn is_enabled(&self) -> bool {
        self.status == AddressStatus::Enabled
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub name: String,
    pub display_name: String,
    pub used_space: u64,
    pub max_space: u64,
}

/// One message to import.
#[derive(Debug, Clone)]
pub struct ImportRequest {
    pub address_id: String,
    pub label_ids: Vec<String>,
    pub unread: bool,
    pub flags: MessageFlags,
    pub literal: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportResult {
    pub message_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateLabelRequest {
    pub name: String,
    pub color: String,
    pub kind: LabelKind,
    pub parent_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateLabelRequest {
    pub name: String,
    pub color: String,
    pub parent_id: Option<String>,
}

/// Remote mail service client.
///
/// # Platform Support
///
/// Implemented on top of the service's HTTP API by the host application.
/// Implementations own authentication, rate limiting and request retries.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    async fn get_labels(&self, kinds: &[LabelKind]) -> Result<Vec<RemoteLabel>>;

    /// Fetch one label. Fails with `NotFound` if it no longer exists.
    async fn get_label(&self, id: &str, kinds: &[LabelKind]) -> Result<RemoteLabel>;

    async fn create_label(&self, request: CreateLabelRequest) -> Result<RemoteLabel>;

    async fn update_label(&self, id: &str, request: UpdateLabelRequest) -> Result<RemoteLabel>;

    async fn delete_label(&self, id: &str) -> Result<()>;

    /// Fetch one page of message metadata.
    async fn get_message_metadata_page(
        &self,
        page: usize,
        page_size: usize,
        filter: &MessageFilter,
    ) -> Result<Vec<MessageMetadata>>;

    async fn get_message(&self, id: &str) -> Result<RemoteMessage>;

    async fn get_attachment(&self, id: &str) -> Result<Bytes>;

    /// Fetch a message together with all of its attachment bytes.
    async fn get_full_message(&self, id: &str) -> Result<FullMessage> {
        let message = self.get_message(id).await?;
        let mut attachment_data = Vec::with_capacity(message.attachments.len());
        for attachment in &message.attachments {
            attachment_data.push(self.get_attachment(&attachment.id).await?);
        }
        Ok(FullMessage {
            message,
            attachment_data,
        })
    }

    async fn import_messages(&self, requests: Vec<ImportRequest>) -> Result<Vec<ImportResult>>;

    async fn label_messages(&self, ids: &[String], label_id: &str) -> Result<()>;

    async fn unlabel_messages(&self, ids: &[String], label_id: &str) -> Result<()>;

    async fn mark_messages_read(&self, ids: &[String]) -> Result<()>;

    async fn mark_messages_unread(&self, ids: &[String]) -> Result<()>;

    async fn mark_messages_forwarded(&self, ids: &[String]) -> Result<()>;

    async fn mark_messages_unforwarded(&self, ids: &[String]) -> Result<()>;

    async fn delete_messages(&self, ids: &[String]) -> Result<()>;

    /// List message ids strictly after `after_id`, in ascending order.
    async fn get_message_ids(&self, after_id: Option<&str>) -> Result<Vec<String>>;

    async fn get_grouped_message_count(&self) -> Result<Vec<MessageGroupCount>>;

    async fn get_user(&self) -> Result<User>;

    async fn get_addresses(&self) -> Result<Vec<Address>>;
}
