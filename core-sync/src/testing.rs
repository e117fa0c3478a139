//! In-memory fakes shared by the unit tests of this crate.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use bridge_traits::api::{
    CreateLabelRequest, ImportRequest, ImportResult, MessageGroupCount, UpdateLabelRequest,
};
use bridge_traits::{
    label_ids, Address, BridgeError, FullMessage, KeyRing, LabelKind, MessageFilter, MessageFlags,
    MessageMetadata, RemoteApi, RemoteLabel, RemoteMessage, ReportContext, StoredMailbox,
    Telemetry, User,
};
use bytes::Bytes;
use parking_lot::Mutex;

use crate::conflict_resolver::MailboxLookup;
use crate::error::{Result, SyncError};
use crate::labels::LabelMap;
use crate::message::{message_created, BuildResult};
use crate::pipeline::{MessageBuilder, ProgressReporter, UpdateApplier};

pub fn metadata(id: &str, address_id: &str, size: u64) -> MessageMetadata {
    MessageMetadata {
        id: id.into(),
        address_id: address_id.into(),
        label_ids: vec![label_ids::INBOX.into(), label_ids::ALL_MAIL.into()],
        subject: format!("subject {id}"),
        time: 1_700_000_000,
        size,
        unread: true,
        is_replied: false,
        is_replied_all: false,
        is_forwarded: false,
        flags: MessageFlags::RECEIVED,
    }
}

pub fn remote_message(id: &str, address_id: &str) -> RemoteMessage {
    RemoteMessage {
        metadata: metadata(id, address_id, 10),
        body: format!("body of {id}"),
        mime_type: "text/plain".into(),
        attachments: Vec::new(),
    }
}

// ============================================================================
// Remote API
// ============================================================================

#[derive(Default)]
struct ApiState {
    labels: HashMap<String, RemoteLabel>,
    messages: BTreeMap<String, RemoteMessage>,
    attachments: HashMap<String, Bytes>,
    vanished: HashSet<String>,
    fail_downloads: bool,
}

/// Remote service backed by maps. Message ids sort in listing order.
#[derive(Default)]
pub struct FakeApi {
    state: Mutex<ApiState>,
    pub metadata_calls: AtomicUsize,
}

impl FakeApi {
    pub fn put_label(&self, label: RemoteLabel) {
        self.state.lock().labels.insert(label.id.clone(), label);
    }

    pub fn put_message(&self, message: RemoteMessage) {
        self.state
            .lock()
            .messages
            .insert(message.metadata.id.clone(), message);
    }

    pub fn put_attachment(&self, id: &str, data: impl Into<Bytes>) {
        self.state.lock().attachments.insert(id.into(), data.into());
    }

    /// Keep listing `id` but answer not-found when it is downloaded.
    pub fn vanish_message(&self, id: &str) {
        self.state.lock().vanished.insert(id.into());
    }

    pub fn fail_downloads(&self) {
        self.state.lock().fail_downloads = true;
    }

    fn unsupported<T>(&self, what: &str) -> bridge_traits::error::Result<T> {
        Err(BridgeError::NotAvailable(format!("fake api: {what}")))
    }
}

#[async_trait]
impl RemoteApi for FakeApi {
    async fn get_labels(&self, kinds: &[LabelKind]) -> bridge_traits::error::Result<Vec<RemoteLabel>> {
        Ok(self
            .state
            .lock()
            .labels
            .values()
            .filter(|label| kinds.contains(&label.kind))
            .cloned()
            .collect())
    }

    async fn get_label(&self, id: &str, _kinds: &[LabelKind]) -> bridge_traits::error::Result<RemoteLabel> {
        self.state
            .lock()
            .labels
            .get(id)
            .cloned()
            .ok_or_else(|| BridgeError::label_not_found(id))
    }

    async fn create_label(&self, _request: CreateLabelRequest) -> bridge_traits::error::Result<RemoteLabel> {
        self.unsupported("create_label")
    }

    async fn update_label(
        &self,
        _id: &str,
        _request: UpdateLabelRequest,
    ) -> bridge_traits::error::Result<RemoteLabel> {
        self.unsupported("update_label")
    }

    async fn delete_label(&self, _id: &str) -> bridge_traits::error::Result<()> {
        self.unsupported("delete_label")
    }

    async fn get_message_metadata_page(
        &self,
        page: usize,
        page_size: usize,
        filter: &MessageFilter,
    ) -> bridge_traits::error::Result<Vec<MessageMetadata>> {
        self.metadata_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock();

        Ok(state
            .messages
            .values()
            .rev()
            .filter(|msg| {
                filter
                    .end_id
                    .as_ref()
                    .map_or(true, |end| msg.metadata.id <= *end)
            })
            .skip(page * page_size)
            .take(page_size)
            .map(|msg| msg.metadata.clone())
            .collect())
    }

    async fn get_message(&self, id: &str) -> bridge_traits::error::Result<RemoteMessage> {
        let state = self.state.lock();
        if state.fail_downloads {
            return Err(BridgeError::OperationFailed("download refused".into()));
        }
        if state.vanished.contains(id) {
            return Err(BridgeError::message_not_found(id));
        }
        state
            .messages
            .get(id)
            .cloned()
            .ok_or_else(|| BridgeError::message_not_found(id))
    }

    async fn get_attachment(&self, id: &str) -> bridge_traits::error::Result<Bytes> {
        self.state
            .lock()
            .attachments
            .get(id)
            .cloned()
            .ok_or_else(|| BridgeError::NotFound {
                kind: "attachment",
                id: id.into(),
            })
    }

    async fn import_messages(
        &self,
        _requests: Vec<ImportRequest>,
    ) -> bridge_traits::error::Result<Vec<ImportResult>> {
        self.unsupported("import_messages")
    }

    async fn label_messages(&self, _ids: &[String], _label_id: &str) -> bridge_traits::error::Result<()> {
        self.unsupported("label_messages")
    }

    async fn unlabel_messages(&self, _ids: &[String], _label_id: &str) -> bridge_traits::error::Result<()> {
        self.unsupported("unlabel_messages")
    }

    async fn mark_messages_read(&self, _ids: &[String]) -> bridge_traits::error::Result<()> {
        self.unsupported("mark_messages_read")
    }

    async fn mark_messages_unread(&self, _ids: &[String]) -> bridge_traits::error::Result<()> {
        self.unsupported("mark_messages_unread")
    }

    async fn mark_messages_forwarded(&self, _ids: &[String]) -> bridge_traits::error::Result<()> {
        self.unsupported("mark_messages_forwarded")
    }

    async fn mark_messages_unforwarded(&self, _ids: &[String]) -> bridge_traits::error::Result<()> {
        self.unsupported("mark_messages_unforwarded")
    }

    async fn delete_messages(&self, _ids: &[String]) -> bridge_traits::error::Result<()> {
        self.unsupported("delete_messages")
    }

    async fn get_message_ids(&self, after_id: Option<&str>) -> bridge_traits::error::Result<Vec<String>> {
        Ok(self
            .state
            .lock()
            .messages
            .keys()
            .filter(|id| after_id.map_or(true, |after| id.as_str() > after))
            .cloned()
            .collect())
    }

    async fn get_grouped_message_count(&self) -> bridge_traits::error::Result<Vec<MessageGroupCount>> {
        let total = self.state.lock().messages.len() as u64;
        Ok(vec![
            MessageGroupCount {
                label_id: label_ids::INBOX.into(),
                total,
                unread: 0,
            },
            MessageGroupCount {
                label_id: label_ids::ALL_MAIL.into(),
                total,
                unread: 0,
            },
        ])
    }

    async fn get_user(&self) -> bridge_traits::error::Result<User> {
        self.unsupported("get_user")
    }

    async fn get_addresses(&self) -> bridge_traits::error::Result<Vec<Address>> {
        self.unsupported("get_addresses")
    }
}

// ============================================================================
// Mailbox lookups
// ============================================================================

#[derive(Default)]
pub struct FakeLookup {
    mailboxes: Mutex<HashMap<Vec<String>, StoredMailbox>>,
    next_id: AtomicU64,
    message_count: AtomicUsize,
    fail: AtomicBool,
}

impl FakeLookup {
    /// Pretend a mailbox named `name` exists for `remote_id`.
    pub fn occupy(&self, name: &[&str], remote_id: &str) {
        let name: Vec<String> = name.iter().map(|s| s.to_string()).collect();
        let internal_id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.mailboxes.lock().insert(
            name.clone(),
            StoredMailbox {
                internal_id,
                remote_id: remote_id.into(),
                name,
            },
        );
    }

    pub fn fail_lookups(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    /// Message count reported for every mailbox.
    pub fn set_message_count(&self, count: usize) {
        self.message_count.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl MailboxLookup for FakeLookup {
    async fn mailbox_by_name(&self, name: &[String]) -> Result<Option<StoredMailbox>> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(SyncError::Bridge(BridgeError::OperationFailed(
                "lookup failed".into(),
            )));
        }
        Ok(self.mailboxes.lock().get(name).cloned())
    }

    async fn mailbox_message_count(&self, _mailbox: &StoredMailbox) -> Result<usize> {
        Ok(self.message_count.load(Ordering::SeqCst))
    }
}

// ============================================================================
// Telemetry
// ============================================================================

#[derive(Default)]
pub struct RecordingTelemetry {
    messages: Mutex<Vec<(String, ReportContext)>>,
    warnings: Mutex<Vec<(String, ReportContext)>>,
}

impl RecordingTelemetry {
    pub fn messages(&self) -> Vec<(String, ReportContext)> {
        self.messages.lock().clone()
    }

    pub fn warnings(&self) -> Vec<(String, ReportContext)> {
        self.warnings.lock().clone()
    }
}

impl Telemetry for RecordingTelemetry {
    fn report_message(&self, message: &str, context: ReportContext) -> bridge_traits::error::Result<()> {
        self.messages.lock().push((message.into(), context));
        Ok(())
    }

    fn report_warning(&self, message: &str, context: ReportContext) -> bridge_traits::error::Result<()> {
        self.warnings.lock().push((message.into(), context));
        Ok(())
    }
}

// ============================================================================
// Pipeline collaborators
// ============================================================================

#[derive(Default)]
pub struct RecordingApplier {
    pub label_syncs: AtomicUsize,
    applied: Mutex<Vec<BuildResult>>,
    fail_apply: AtomicBool,
    label_conflicts: AtomicUsize,
}

impl RecordingApplier {
    pub fn applied_ids(&self) -> Vec<String> {
        self.applied
            .lock()
            .iter()
            .map(|result| result.message_id.clone())
            .collect()
    }

    pub fn applied(&self) -> Vec<BuildResult> {
        self.applied.lock().clone()
    }

    pub fn fail_apply(&self) {
        self.fail_apply.store(true, Ordering::SeqCst);
    }

    /// The next `count` label syncs report an irreconcilable conflict.
    pub fn conflict_label_syncs(&self, count: usize) {
        self.label_conflicts.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl UpdateApplier for RecordingApplier {
    async fn sync_labels(&self, _labels: &LabelMap) -> Result<()> {
        self.label_syncs.fetch_add(1, Ordering::SeqCst);
        let conflicting = self
            .label_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if conflicting {
            return Err(SyncError::LabelConflict {
                label_id: "a".into(),
                conflicting_id: "other".into(),
            });
        }
        Ok(())
    }

    async fn apply_sync_updates(&self, updates: Vec<BuildResult>) -> Result<()> {
        if self.fail_apply.load(Ordering::SeqCst) {
            return Err(SyncError::Apply("store rejected batch".into()));
        }
        self.applied.lock().extend(updates);
        Ok(())
    }
}

/// Builds the plain body as the literal. Unlocks keys for `addresses` only.
pub struct FakeBuilder {
    addresses: Vec<String>,
    failing: HashSet<String>,
}

impl FakeBuilder {
    pub fn new(addresses: &[&str]) -> Self {
        Self {
            addresses: addresses.iter().map(|a| a.to_string()).collect(),
            failing: HashSet::new(),
        }
    }

    pub fn failing(mut self, message_id: &str) -> Self {
        self.failing.insert(message_id.into());
        self
    }
}

impl MessageBuilder for FakeBuilder {
    fn key_rings(&self) -> HashMap<String, KeyRing> {
        self.addresses
            .iter()
            .map(|id| (id.clone(), KeyRing::new(id.clone(), Bytes::from_static(b"key"))))
            .collect()
    }

    fn build_message(
        &self,
        labels: &LabelMap,
        message: &FullMessage,
        _key: &KeyRing,
    ) -> std::result::Result<BuildResult, BridgeError> {
        if self.failing.contains(message.id()) {
            return Err(BridgeError::Crypto("bad signature".into()));
        }

        let metadata = message.metadata();
        Ok(BuildResult {
            address_id: metadata.address_id.clone(),
            message_id: metadata.id.clone(),
            update: message_created(labels, metadata, Bytes::from(message.message.body.clone())),
        })
    }
}

#[derive(Default)]
pub struct RecordingReporter {
    pub started: AtomicUsize,
    pub finished: AtomicUsize,
    errors: Mutex<Vec<String>>,
    progress: Mutex<(i64, i64)>,
}

impl RecordingReporter {
    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().clone()
    }

    /// Current and total progress steps.
    pub fn progress(&self) -> (i64, i64) {
        *self.progress.lock()
    }
}

impl ProgressReporter for RecordingReporter {
    fn on_start(&self) {
        self.started.fetch_add(1, Ordering::SeqCst);
    }

    fn on_finished(&self) {
        self.finished.fetch_add(1, Ordering::SeqCst);
    }

    fn on_error(&self, error: &SyncError) {
        self.errors.lock().push(error.to_string());
    }

    fn on_progress(&self, delta: i64) {
        self.progress.lock().0 += delta;
    }

    fn initialize_progress_counter(&self, current: i64, total: i64) {
        *self.progress.lock() = (current, total);
    }
}
