//! In-memory fakes shared by the unit tests of this crate.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bridge_traits::api::{
    CreateLabelRequest, ImportRequest, ImportResult, MessageGroupCount, UpdateLabelRequest,
};
use bridge_traits::error::Result as BridgeResult;
use bridge_traits::{
    label_ids, Address, AddressStatus, BridgeError, EventCursor, FullMessage, KeyRing, LabelKind,
    LocalStore, MessageCrypto, MessageFilter, MessageFlags, MessageMetadata, RemoteApi, RemoteLabel,
    RemoteMessage, ReportContext, StoredMailbox, Telemetry, Update, User,
};
use bytes::Bytes;
use core_runtime::config::FeatureFlags;
use core_runtime::events::{AccountEvent, CoreEvent, EventBus, Receiver};
use core_runtime::AddressMode;
use core_sync::labels::LabelMap;
use core_sync::{
    IdentityState, LabelConflictManager, LabelDirectory, MemorySyncState, SharedIdentity,
    SyncHandler, SyncLimits, SyncReporter, SyncStateProvider, SyncStatus,
};
use parking_lot::Mutex;

use crate::account::AccountActor;
use crate::applier::SyncUpdateApplier;
use crate::builder::CryptoMessageBuilder;
use crate::connector::{Connector, ConnectorContext, ConnectorSet};
use crate::registry::ConnectorRegistry;

pub const BRIDGE_PASSWORD: &[u8] = b"bridge-pass";
/// [`BRIDGE_PASSWORD`] as mail clients send it.
pub const CLIENT_PASSWORD: &[u8] = b"YnJpZGdlLXBhc3M=";

pub fn user() -> User {
    User {
        id: "user-1".into(),
        name: "alice".into(),
        display_name: "Alice".into(),
        used_space: 0,
        max_space: 1 << 30,
    }
}

/// Enabled address `{id}@example.com`; listing order follows `order`.
pub fn address(id: &str, order: u32) -> Address {
    Address {
        id: id.into(),
        email: format!("{id}@example.com"),
        status: AddressStatus::Enabled,
        order,
    }
}

pub fn addresses(ids: &[&str]) -> Vec<Address> {
    ids.iter()
        .enumerate()
        .map(|(order, id)| address(id, order as u32 + 1))
        .collect()
}

/// Identity with an unlocked keyring for every address in `ids`.
pub fn identity(ids: &[&str]) -> SharedIdentity {
    let keys: HashMap<String, KeyRing> = ids
        .iter()
        .map(|id| (id.to_string(), KeyRing::new(*id, Bytes::from_static(b"key"))))
        .collect();
    SharedIdentity::new(IdentityState::new(user(), addresses(ids), keys, BRIDGE_PASSWORD))
}

pub fn metadata(id: &str, address_id: &str, labels: &[&str]) -> MessageMetadata {
    MessageMetadata {
        id: id.into(),
        address_id: address_id.into(),
        label_ids: labels.iter().map(|l| l.to_string()).collect(),
        subject: format!("subject {id}"),
        time: 1_700_000_000,
        size: 42,
        unread: true,
        is_replied: false,
        is_replied_all: false,
        is_forwarded: false,
        flags: MessageFlags::RECEIVED,
    }
}

pub fn full_message(id: &str, address_id: &str, labels: &[&str]) -> FullMessage {
    FullMessage {
        message: RemoteMessage {
            metadata: metadata(id, address_id, labels),
            body: format!("body of {id}"),
            mime_type: "text/plain".into(),
            attachments: Vec::new(),
        },
        attachment_data: Vec::new(),
    }
}

pub fn system_label(id: &str, name: &str) -> RemoteLabel {
    RemoteLabel::new(id, vec![name.to_string()], LabelKind::System)
}

pub fn folder(id: &str, path: &[&str]) -> RemoteLabel {
    RemoteLabel::new(id, path.iter().map(|s| s.to_string()).collect(), LabelKind::Folder)
}

pub fn label(id: &str, name: &str) -> RemoteLabel {
    RemoteLabel::new(id, vec![name.to_string()], LabelKind::Label)
}

/// System labels a fresh account starts with.
pub fn system_labels() -> Vec<RemoteLabel> {
    vec![
        system_label(label_ids::INBOX, "Inbox"),
        system_label(label_ids::ALL_DRAFTS, "All Drafts"),
        system_label(label_ids::ALL_SENT, "All Sent"),
        system_label(label_ids::TRASH, "Trash"),
        system_label(label_ids::SPAM, "Spam"),
        system_label(label_ids::ALL_MAIL, "All Mail"),
        system_label(label_ids::ARCHIVE, "Archive"),
        system_label(label_ids::SENT, "Sent"),
        system_label(label_ids::DRAFTS, "Drafts"),
        system_label(label_ids::STARRED, "Starred"),
        system_label(label_ids::ALL_SCHEDULED, "Scheduled"),
    ]
}

pub fn labels_with_inbox() -> LabelMap {
    let inbox = system_label(label_ids::INBOX, "Inbox");
    LabelMap::from([(inbox.id.clone(), inbox)])
}

// ============================================================================
// Remote API
// ============================================================================

/// Mutating API calls, in the order they were made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiCall {
    CreateLabel(CreateLabelRequest),
    UpdateLabel(String, UpdateLabelRequest),
    DeleteLabel(String),
    Label(Vec<String>, String),
    Unlabel(Vec<String>, String),
    MarkRead(Vec<String>),
    MarkUnread(Vec<String>),
    MarkForwarded(Vec<String>),
    MarkUnforwarded(Vec<String>),
    DeleteMessages(Vec<String>),
}

#[derive(Default)]
struct ApiState {
    user: Option<User>,
    addresses: Vec<Address>,
    labels: HashMap<String, RemoteLabel>,
    messages: BTreeMap<String, RemoteMessage>,
    calls: Vec<ApiCall>,
    imports: Vec<ImportRequest>,
    next_id: usize,
}

/// Remote service backed by maps that records every mutating call.
#[derive(Default)]
pub struct FakeApi {
    state: Mutex<ApiState>,
    pub label_fetches: AtomicUsize,
}

impl FakeApi {
    pub fn with_labels(labels: impl IntoIterator<Item = RemoteLabel>) -> Self {
        let api = Self::default();
        for label in labels {
            api.put_label(label);
        }
        api
    }

    pub fn put_label(&self, label: RemoteLabel) {
        self.state.lock().labels.insert(label.id.clone(), label);
    }

    pub fn remove_label(&self, id: &str) {
        self.state.lock().labels.remove(id);
    }

    pub fn put_message(&self, metadata: MessageMetadata) {
        let message = RemoteMessage {
            body: format!("body of {}", metadata.id),
            metadata,
            mime_type: "text/plain".into(),
            attachments: Vec::new(),
        };
        self.state
            .lock()
            .messages
            .insert(message.metadata.id.clone(), message);
    }

    pub fn set_identity(&self, user: User, addresses: Vec<Address>) {
        let mut state = self.state.lock();
        state.user = Some(user);
        state.addresses = addresses;
    }

    pub fn calls(&self) -> Vec<ApiCall> {
        self.state.lock().calls.clone()
    }

    pub fn imports(&self) -> Vec<ImportRequest> {
        self.state.lock().imports.clone()
    }

    pub fn label(&self, id: &str) -> Option<RemoteLabel> {
        self.state.lock().labels.get(id).cloned()
    }

    fn record(&self, call: ApiCall) {
        self.state.lock().calls.push(call);
    }

    fn next_id(state: &mut ApiState, prefix: &str) -> String {
        state.next_id += 1;
        format!("{prefix}-{}", state.next_id)
    }

    fn label_path(state: &ApiState, parent_id: Option<&str>, name: &str) -> Vec<String> {
        let mut path = parent_id
            .and_then(|id| state.labels.get(id))
            .map(|parent| parent.path.clone())
            .unwrap_or_default();
        path.push(name.to_string());
        path
    }
}

#[async_trait]
impl RemoteApi for FakeApi {
    async fn get_labels(&self, kinds: &[LabelKind]) -> BridgeResult<Vec<RemoteLabel>> {
        Ok(self
            .state
            .lock()
            .labels
            .values()
            .filter(|label| kinds.contains(&label.kind))
            .cloned()
            .collect())
    }

    async fn get_label(&self, id: &str, _kinds: &[LabelKind]) -> BridgeResult<RemoteLabel> {
        self.label_fetches.fetch_add(1, Ordering::SeqCst);
        self.label(id).ok_or_else(|| BridgeError::label_not_found(id))
    }

    async fn create_label(&self, request: CreateLabelRequest) -> BridgeResult<RemoteLabel> {
        let mut state = self.state.lock();
        state.calls.push(ApiCall::CreateLabel(request.clone()));

        let id = Self::next_id(&mut state, "label");
        let path = Self::label_path(&state, request.parent_id.as_deref(), &request.name);
        let label = RemoteLabel {
            id: id.clone(),
            parent_id: request.parent_id,
            name: request.name,
            path,
            color: request.color,
            kind: request.kind,
        };
        state.labels.insert(id, label.clone());
        Ok(label)
    }

    async fn update_label(&self, id: &str, request: UpdateLabelRequest) -> BridgeResult<RemoteLabel> {
        let mut state = self.state.lock();
        state.calls.push(ApiCall::UpdateLabel(id.into(), request.clone()));

        let path = Self::label_path(&state, request.parent_id.as_deref(), &request.name);
        let label = state
            .labels
            .get_mut(id)
            .ok_or_else(|| BridgeError::label_not_found(id))?;
        label.name = request.name;
        label.color = request.color;
        label.parent_id = request.parent_id;
        label.path = path;
        Ok(label.clone())
    }

    async fn delete_label(&self, id: &str) -> BridgeResult<()> {
        let mut state = self.state.lock();
        state.calls.push(ApiCall::DeleteLabel(id.into()));
        state
            .labels
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| BridgeError::label_not_found(id))
    }

    async fn get_message_metadata_page(
        &self,
        page: usize,
        page_size: usize,
        filter: &MessageFilter,
    ) -> BridgeResult<Vec<MessageMetadata>> {
        let state = self.state.lock();
        let mut metadata: Vec<MessageMetadata> = state
            .messages
            .values()
            .filter(|msg| filter.ids.is_empty() || filter.ids.contains(&msg.metadata.id))
            .filter(|msg| {
                filter
                    .label_id
                    .as_ref()
                    .map_or(true, |label| msg.metadata.label_ids.contains(label))
            })
            .map(|msg| msg.metadata.clone())
            .collect();

        if filter.desc {
            metadata.reverse();
        }
        if let Some(end_id) = &filter.end_id {
            metadata.retain(|meta| match filter.desc {
                true => meta.id <= *end_id,
                false => meta.id >= *end_id,
            });
        }

        Ok(metadata
            .into_iter()
            .skip(page * page_size)
            .take(page_size)
            .collect())
    }

    async fn get_message(&self, id: &str) -> BridgeResult<RemoteMessage> {
        self.state
            .lock()
            .messages
            .get(id)
            .cloned()
            .ok_or_else(|| BridgeError::message_not_found(id))
    }

    async fn get_attachment(&self, id: &str) -> BridgeResult<Bytes> {
        Err(BridgeError::NotFound {
            kind: "attachment",
            id: id.into(),
        })
    }

    async fn import_messages(&self, requests: Vec<ImportRequest>) -> BridgeResult<Vec<ImportResult>> {
        let mut state = self.state.lock();
        let mut results = Vec::with_capacity(requests.len());

        for request in requests {
            let id = Self::next_id(&mut state, "imported");
            let mut meta = metadata(&id, &request.address_id, &[]);
            meta.label_ids = request.label_ids.clone();
            meta.unread = request.unread;
            meta.flags = request.flags;

            state.messages.insert(
                id.clone(),
                RemoteMessage {
                    metadata: meta,
                    body: String::from_utf8_lossy(&request.literal).into_owned(),
                    mime_type: "message/rfc822".into(),
                    attachments: Vec::new(),
                },
            );
            state.imports.push(request);
            results.push(ImportResult { message_id: id });
        }

        Ok(results)
    }

    async fn label_messages(&self, ids: &[String], label_id: &str) -> BridgeResult<()> {
        self.record(ApiCall::Label(ids.to_vec(), label_id.into()));
        Ok(())
    }

    async fn unlabel_messages(&self, ids: &[String], label_id: &str) -> BridgeResult<()> {
        self.record(ApiCall::Unlabel(ids.to_vec(), label_id.into()));
        Ok(())
    }

    async fn mark_messages_read(&self, ids: &[String]) -> BridgeResult<()> {
        self.record(ApiCall::MarkRead(ids.to_vec()));
        Ok(())
    }

    async fn mark_messages_unread(&self, ids: &[String]) -> BridgeResult<()> {
        self.record(ApiCall::MarkUnread(ids.to_vec()));
        Ok(())
    }

    async fn mark_messages_forwarded(&self, ids: &[String]) -> BridgeResult<()> {
        self.record(ApiCall::MarkForwarded(ids.to_vec()));
        Ok(())
    }

    async fn mark_messages_unforwarded(&self, ids: &[String]) -> BridgeResult<()> {
        self.record(ApiCall::MarkUnforwarded(ids.to_vec()));
        Ok(())
    }

    async fn delete_messages(&self, ids: &[String]) -> BridgeResult<()> {
        let mut state = self.state.lock();
        state.calls.push(ApiCall::DeleteMessages(ids.to_vec()));
        for id in ids {
            state.messages.remove(id);
        }
        Ok(())
    }

    async fn get_message_ids(&self, after_id: Option<&str>) -> BridgeResult<Vec<String>> {
        Ok(self
            .state
            .lock()
            .messages
            .keys()
            .filter(|id| after_id.map_or(true, |after| id.as_str() > after))
            .cloned()
            .collect())
    }

    async fn get_grouped_message_count(&self) -> BridgeResult<Vec<MessageGroupCount>> {
        let total = self.state.lock().messages.len() as u64;
        Ok(vec![MessageGroupCount {
            label_id: label_ids::ALL_MAIL.into(),
            total,
            unread: 0,
        }])
    }

    async fn get_user(&self) -> BridgeResult<User> {
        Ok(self.state.lock().user.clone().unwrap_or_else(user))
    }

    async fn get_addresses(&self) -> BridgeResult<Vec<Address>> {
        Ok(self.state.lock().addresses.clone())
    }
}

// ============================================================================
// Crypto
// ============================================================================

/// Builds a readable literal from the plain body; key material is ignored.
#[derive(Default)]
pub struct FakeCrypto {
    locked: Mutex<HashSet<String>>,
    failing_messages: Mutex<HashSet<String>>,
}

impl FakeCrypto {
    /// Keys of `address_id` fail to unlock.
    pub fn lock_address(&self, address_id: &str) {
        self.locked.lock().insert(address_id.into());
    }

    /// Building `message_id` fails.
    pub fn fail_message(&self, message_id: &str) {
        self.failing_messages.lock().insert(message_id.into());
    }
}

impl MessageCrypto for FakeCrypto {
    fn unlock_address_keys(&self, address: &Address) -> BridgeResult<KeyRing> {
        if self.locked.lock().contains(&address.id) {
            return Err(BridgeError::Crypto(format!("cannot unlock {}", address.id)));
        }
        Ok(KeyRing::new(address.id.clone(), Bytes::from_static(b"key")))
    }

    fn build_rfc822(&self, _keyring: &KeyRing, message: &FullMessage) -> BridgeResult<Vec<u8>> {
        if self.failing_messages.lock().contains(message.id()) {
            return Err(BridgeError::Crypto("failed to decrypt".into()));
        }
        let meta = message.metadata();
        Ok(format!(
            "Message-Id: <{}>\r\nSubject: {}\r\n\r\n{}",
            meta.id, meta.subject, message.message.body
        )
        .into_bytes())
    }
}

// ============================================================================
// Telemetry
// ============================================================================

#[derive(Default)]
pub struct RecordingTelemetry {
    messages: Mutex<Vec<String>>,
    pub config_successes: AtomicUsize,
    pub config_failures: AtomicUsize,
}

impl RecordingTelemetry {
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().clone()
    }
}

impl Telemetry for RecordingTelemetry {
    fn report_message(&self, message: &str, _context: ReportContext) -> BridgeResult<()> {
        self.messages.lock().push(message.into());
        Ok(())
    }

    fn config_status_success(&self) {
        self.config_successes.fetch_add(1, Ordering::SeqCst);
    }

    fn config_status_failure(&self, _details: &str) {
        self.config_failures.fetch_add(1, Ordering::SeqCst);
    }
}

// ============================================================================
// Local server
// ============================================================================

#[derive(Default)]
pub struct FakeStore {
    mailboxes: Mutex<Vec<StoredMailbox>>,
    flags: Mutex<Vec<String>>,
    permanent_flags: Mutex<Vec<String>>,
}

fn stored_mailboxes(mailboxes: &[(&str, &[&str])]) -> Vec<StoredMailbox> {
    mailboxes
        .iter()
        .enumerate()
        .map(|(n, (remote_id, name))| StoredMailbox {
            internal_id: n as u64 + 1,
            remote_id: remote_id.to_string(),
            name: name.iter().map(|s| s.to_string()).collect(),
        })
        .collect()
}

impl FakeStore {
    pub fn with_mailboxes(mailboxes: &[(&str, &[&str])]) -> Self {
        Self::from_stored(stored_mailboxes(mailboxes))
    }

    fn from_stored(mailboxes: Vec<StoredMailbox>) -> Self {
        let store = Self::default();
        *store.mailboxes.lock() = mailboxes;
        store
    }

    pub fn mailbox_names(&self) -> Vec<Vec<String>> {
        self.mailboxes.lock().iter().map(|m| m.name.clone()).collect()
    }

    pub fn flags(&self) -> Vec<String> {
        self.flags.lock().clone()
    }

    pub fn permanent_flags(&self) -> Vec<String> {
        self.permanent_flags.lock().clone()
    }
}

#[async_trait]
impl LocalStore for FakeStore {
    async fn mailbox_by_name(&self, name: &[String]) -> BridgeResult<Option<StoredMailbox>> {
        Ok(self.mailboxes.lock().iter().find(|m| m.name == name).cloned())
    }

    async fn mailbox_message_count(&self, _mailbox: &StoredMailbox) -> BridgeResult<usize> {
        Ok(0)
    }

    async fn mailboxes(&self) -> BridgeResult<Vec<StoredMailbox>> {
        Ok(self.mailboxes.lock().clone())
    }

    async fn rename_mailbox(&self, remote_id: &str, name: Vec<String>) -> BridgeResult<()> {
        let mut mailboxes = self.mailboxes.lock();
        let mailbox = mailboxes
            .iter_mut()
            .find(|m| m.remote_id == remote_id)
            .ok_or_else(|| BridgeError::NoSuchMailbox(remote_id.into()))?;
        mailbox.name = name;
        Ok(())
    }

    async fn add_flags_to_all_mailboxes(&self, flags: &[String]) -> BridgeResult<()> {
        self.flags.lock().extend_from_slice(flags);
        Ok(())
    }

    async fn add_permanent_flags_to_all_mailboxes(&self, flags: &[String]) -> BridgeResult<()> {
        self.permanent_flags.lock().extend_from_slice(flags);
        Ok(())
    }
}

/// Updates applied by [`spawn_server`], tagged with the connector address.
#[derive(Clone, Default)]
pub struct UpdateLog {
    updates: Arc<Mutex<Vec<(String, Update)>>>,
    reject_mailbox_updates: Arc<AtomicBool>,
}

impl UpdateLog {
    pub fn all(&self) -> Vec<(String, Update)> {
        self.updates.lock().clone()
    }

    pub fn for_address(&self, address_id: &str) -> Vec<Update> {
        self.updates
            .lock()
            .iter()
            .filter(|(addr, _)| addr == address_id)
            .map(|(_, update)| update.clone())
            .collect()
    }

    pub fn kinds(&self, address_id: &str) -> Vec<&'static str> {
        self.for_address(address_id).iter().map(Update::kind).collect()
    }

    /// Answer `MessageMailboxesUpdated` with "no such message".
    pub fn reject_mailbox_updates(&self) {
        self.reject_mailbox_updates.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.updates.lock().clear();
    }
}

/// Drain `connector`'s queue like the protocol server would.
pub fn spawn_server(connector: &Connector, log: UpdateLog) -> tokio::task::JoinHandle<()> {
    let address_id = connector.address_id().to_string();
    let mut updates = connector.take_updates();

    tokio::spawn(async move {
        while let Some(envelope) = updates.recv().await {
            let result = match &envelope.update {
                Update::MessageMailboxesUpdated { id, .. }
                    if log.reject_mailbox_updates.load(Ordering::SeqCst) =>
                {
                    Err(BridgeError::NoSuchMessage(id.clone()))
                }
                update => {
                    log.updates.lock().push((address_id.clone(), update.clone()));
                    Ok(())
                }
            };
            envelope.done(result);
        }
    })
}

/// Registers connectors against fresh [`FakeStore`]s and serves their queues.
#[derive(Default)]
pub struct FakeRegistry {
    pub log: UpdateLog,
    added: Mutex<Vec<String>>,
    removed: Mutex<Vec<(String, bool)>>,
    seed: Vec<StoredMailbox>,
    reject_adds: AtomicBool,
}

impl FakeRegistry {
    /// Every registered store starts out holding `mailboxes`.
    pub fn with_mailboxes(mailboxes: &[(&str, &[&str])]) -> Self {
        Self {
            seed: stored_mailboxes(mailboxes),
            ..Self::default()
        }
    }

    /// Refuse further registrations.
    pub fn reject_adds(&self) {
        self.reject_adds.store(true, Ordering::SeqCst);
    }

    pub fn accept_adds(&self) {
        self.reject_adds.store(false, Ordering::SeqCst);
    }

    pub fn added(&self) -> Vec<String> {
        self.added.lock().clone()
    }

    pub fn removed(&self) -> Vec<(String, bool)> {
        self.removed.lock().clone()
    }
}

#[async_trait]
impl ConnectorRegistry for FakeRegistry {
    async fn add_connector(
        &self,
        connector: Arc<Connector>,
        _sync_state: Arc<dyn SyncStateProvider>,
    ) -> BridgeResult<()> {
        if self.reject_adds.load(Ordering::SeqCst) {
            return Err(BridgeError::OperationFailed(format!(
                "server refused connector {}",
                connector.address_id()
            )));
        }
        connector
            .init(Arc::new(FakeStore::from_stored(self.seed.clone())))
            .await
            .map_err(BridgeError::from)?;
        spawn_server(&connector, self.log.clone());
        self.added.lock().push(connector.address_id().to_string());
        Ok(())
    }

    async fn remove_connector(&self, address_id: &str, delete_data: bool) -> BridgeResult<()> {
        self.removed.lock().push((address_id.to_string(), delete_data));
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeCursor {
    rewinds: Mutex<Vec<String>>,
}

impl FakeCursor {
    pub fn rewinds(&self) -> Vec<String> {
        self.rewinds.lock().clone()
    }
}

#[async_trait]
impl EventCursor for FakeCursor {
    async fn rewind_event_id(&self, event_id: &str) -> BridgeResult<()> {
        self.rewinds.lock().push(event_id.into());
        Ok(())
    }
}

// ============================================================================
// Connector harness
// ============================================================================

/// Collaborators of one account, wired to fakes.
pub struct Harness {
    pub api: Arc<FakeApi>,
    pub crypto: Arc<FakeCrypto>,
    pub telemetry: Arc<RecordingTelemetry>,
    pub identity: SharedIdentity,
    pub labels: LabelDirectory,
    pub sync_state: Arc<MemorySyncState>,
}

impl Harness {
    pub fn new(address_ids: &[&str], labels: impl IntoIterator<Item = RemoteLabel>) -> Self {
        let labels: Vec<RemoteLabel> = labels.into_iter().collect();
        let api = FakeApi::with_labels(labels.clone());
        api.set_identity(user(), addresses(address_ids));

        Self {
            api: Arc::new(api),
            crypto: Arc::new(FakeCrypto::default()),
            telemetry: Arc::new(RecordingTelemetry::default()),
            identity: identity(address_ids),
            labels: LabelDirectory::new(labels),
            sync_state: Arc::new(MemorySyncState::new(SyncStatus::default())),
        }
    }

    pub fn context(&self, address_mode: AddressMode) -> ConnectorContext {
        ConnectorContext {
            api: self.api.clone(),
            builder: Arc::new(CryptoMessageBuilder::new(
                self.identity.clone(),
                self.crypto.clone(),
            )),
            identity: self.identity.clone(),
            labels: self.labels.clone(),
            telemetry: self.telemetry.clone(),
            sync_state: self.sync_state.clone(),
            address_mode,
        }
    }

    pub fn connector(&self, address_id: &str, address_mode: AddressMode) -> Connector {
        Connector::new(address_id, self.context(address_mode), false)
    }
}

// ============================================================================
// Account actor
// ============================================================================

/// Actor whose connectors are registered with `registry`; no sync is started.
pub async fn actor(h: &Harness, registry: Arc<FakeRegistry>, address_mode: AddressMode) -> AccountActor {
    let api: Arc<dyn RemoteApi> = h.api.clone();
    let telemetry: Arc<dyn Telemetry> = h.telemetry.clone();
    let sync_state: Arc<dyn SyncStateProvider> = h.sync_state.clone();
    let events = EventBus::new(64);
    let (applier, _requests) = SyncUpdateApplier::channel(1);

    let mut actor = AccountActor {
        user_id: h.identity.user_id(),
        api: api.clone(),
        crypto: h.crypto.clone(),
        registry,
        cursor: Arc::new(FakeCursor::default()),
        events: events.clone(),
        telemetry: telemetry.clone(),
        identity: h.identity.clone(),
        labels: h.labels.clone(),
        builder: Arc::new(CryptoMessageBuilder::new(h.identity.clone(), h.crypto.clone())),
        sync_state: sync_state.clone(),
        conflicts: LabelConflictManager::new(api.clone(), telemetry.clone(), FeatureFlags::default()),
        address_mode,
        show_all_mail: false,
        retry_cooldown: Duration::from_millis(10),
        connectors: ConnectorSet::new(),
        sync: SyncHandler::new(
            h.identity.user_id(),
            api,
            sync_state,
            telemetry,
            SyncLimits::new(2 << 30, 8 << 30, false),
        ),
        applier,
        reporter: Arc::new(SyncReporter::new(h.identity.user_id(), events)),
        is_syncing: false,
        last_handled_event_id: "event-0".into(),
    };

    actor.connectors = actor.build_connectors().expect("connectors");
    actor.add_connectors_to_server().await.expect("registered");
    actor
}

/// Account events emitted so far.
pub fn account_events(receiver: &mut Receiver<CoreEvent>) -> Vec<AccountEvent> {
    let mut events = Vec::new();
    while let Ok(event) = receiver.try_recv() {
        if let CoreEvent::Account(event) = event {
            events.push(event);
        }
    }
    events
}
