//! # Per-Address Connector
//!
//! The face of one exposed address towards the local protocol server.
//!
//! ## Overview
//!
//! A connector serves two directions:
//! - **Client → remote**: mailbox and message operations issued by mail
//!   clients are validated against the mailbox policy and turned into remote
//!   API calls. The label directory is updated as soon as the API accepts a
//!   label change so follow-up operations see it.
//! - **Remote → client**: the account publishes [`Update`]s onto the
//!   connector's [`UpdateQueue`]; the server drains it through
//!   [`Connector::take_updates`] and acknowledges each update.
//!
//! In combined address mode one connector (for the primary address) carries
//! every address; in split mode there is one per enabled address.
//!
//! ## Mailbox policy
//!
//! | Operation | Rejected for |
//! |-----------|--------------|
//! | create/rename mailbox | names outside `Folders/..` and `Labels/..`; nested labels; missing parent folder |
//! | append message | All Mail |
//! | add/remove messages | All Mail, Scheduled |
//! | move messages | All Mail, Scheduled, Inbox ↔ Sent |

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bridge_traits::api::{CreateLabelRequest, ImportRequest, UpdateLabelRequest};
use bridge_traits::store::{FLAG_ANSWERED, FLAG_FLAGGED, FLAG_SEEN, FORWARDED_FLAGS};
use bridge_traits::{
    label_ids, FlagSet, LabelKind, LocalStore, Mailbox, Message, MessageFilter,
    MessageFlags, PendingUpdate, RemoteApi, RemoteLabel, Telemetry, Update,
};
use bytes::Bytes;
use core_runtime::AddressMode;
use core_sync::mailbox::{
    default_mailbox_flags, default_mailbox_permanent_flags, is_all_mail_or_scheduled, local_message,
    mailbox_name, want_label, FOLDER_PREFIX, LABEL_PREFIX,
};
use core_sync::{LabelDirectory, SharedIdentity, StoreHandle, SyncStateProvider};
use tracing::{debug, error, info, instrument, warn};

use crate::builder::CryptoMessageBuilder;
use crate::error::{Result, ServiceError};
use crate::queue::{UpdateQueue, UpdateReceiver};

/// Color given to mailboxes created by mail clients.
pub const DEFAULT_LABEL_COLOR: &str = "#f66";

/// Message ids per metadata request when expunging from Trash or Drafts.
pub const EXPUNGE_CHUNK_SIZE: usize = 150;

/// System labels that never keep a message alive on their own.
const IMPLICIT_LABELS: [&str; 4] = [
    label_ids::ALL_DRAFTS,
    label_ids::ALL_MAIL,
    label_ids::ALL_SENT,
    label_ids::ALL_SCHEDULED,
];

/// Whether clients get to see a mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxVisibility {
    Visible,
    Hidden,
    /// Listed only while it holds messages
    HiddenIfEmpty,
}

/// Account-wide collaborators shared by every connector.
#[derive(Clone)]
pub struct ConnectorContext {
    pub api: Arc<dyn RemoteApi>,
    pub builder: Arc<CryptoMessageBuilder>,
    pub identity: SharedIdentity,
    pub labels: LabelDirectory,
    pub telemetry: Arc<dyn Telemetry>,
    pub sync_state: Arc<dyn SyncStateProvider>,
    pub address_mode: AddressMode,
}

pub struct Connector {
    address_id: String,
    ctx: ConnectorContext,
    store: StoreHandle,
    queue: UpdateQueue,
    show_all_mail: AtomicBool,
}

impl Connector {
    pub fn new(address_id: impl Into<String>, ctx: ConnectorContext, show_all_mail: bool) -> Self {
        Self {
            address_id: address_id.into(),
            ctx,
            store: StoreHandle::new(),
            queue: UpdateQueue::new(),
            show_all_mail: AtomicBool::new(show_all_mail),
        }
    }

    pub fn address_id(&self) -> &str {
        &self.address_id
    }

    pub fn store_handle(&self) -> StoreHandle {
        self.store.clone()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Attach the local store and bring its mailboxes up to date.
    #[instrument(skip_all, fields(address_id = %self.address_id))]
    pub async fn init(&self, store: Arc<dyn LocalStore>) -> Result<()> {
        self.store.set(store).await;

        if self.patch_mailbox_hierarchy().await? {
            info!("Patched folders/labels missing their prefix, resetting sync state");
            self.ctx.sync_state.clear().await?;
        }

        // Let clients know they may store the forwarded keywords.
        let flags: Vec<String> = FORWARDED_FLAGS.iter().map(|f| f.to_string()).collect();
        let flags = &flags;
        self.store
            .read(|store| async move {
                store.add_flags_to_all_mailboxes(flags).await?;
                store.add_permanent_flags_to_all_mailboxes(flags).await
            })
            .await?;

        Ok(())
    }

    /// Move folder/label mailboxes that were stored at the root level back
    /// under their prefix. Returns whether anything was patched.
    async fn patch_mailbox_hierarchy(&self) -> Result<bool> {
        let mailboxes = self.store.read(|store| async move { store.mailboxes().await }).await?;

        let patches: Vec<(String, Vec<String>)> = {
            let labels = self.ctx.labels.read();
            mailboxes
                .iter()
                .filter_map(|mbox| {
                    let prefix = match labels.get(&mbox.remote_id)?.kind {
                        LabelKind::Folder => FOLDER_PREFIX,
                        LabelKind::Label => LABEL_PREFIX,
                        LabelKind::System | LabelKind::ContactGroup => return None,
                    };
                    if mbox.name.first().is_some_and(|first| first == prefix) {
                        return None;
                    }

                    let name = std::iter::once(prefix.to_string())
                        .chain(mbox.name.iter().cloned())
                        .collect();
                    Some((mbox.remote_id.clone(), name))
                })
                .collect()
        };

        for (remote_id, name) in &patches {
            debug!(label_id = %remote_id, "Found mailbox without prefix, patching");
            self.store
                .read(|store| async move { store.rename_mailbox(remote_id, name.clone()).await })
                .await?;
        }

        Ok(!patches.is_empty())
    }

    /// Check mail client credentials.
    pub fn authorize(&self, username: &str, password: &[u8]) -> bool {
        let matched = self.ctx.identity.read().check_auth(username, password);

        let Some(address_id) = matched else {
            self.ctx
                .telemetry
                .config_status_failure("IMAP invalid username or password");
            return false;
        };

        if self.ctx.address_mode == AddressMode::Split && address_id != self.address_id {
            return false;
        }

        self.ctx.telemetry.config_status_success();
        true
    }

    pub fn show_all_mail(&self, show: bool) {
        self.show_all_mail.store(show, Ordering::SeqCst);
    }

    pub fn mailbox_visibility(&self, mailbox_id: &str) -> MailboxVisibility {
        match mailbox_id {
            label_ids::ALL_MAIL if self.show_all_mail.load(Ordering::SeqCst) => {
                MailboxVisibility::Visible
            }
            label_ids::ALL_MAIL => MailboxVisibility::Hidden,
            label_ids::ALL_SCHEDULED => MailboxVisibility::HiddenIfEmpty,
            _ => MailboxVisibility::Visible,
        }
    }

    // ========================================================================
    // Update queue
    // ========================================================================

    pub fn publish_update(&self, update: Update) -> PendingUpdate {
        self.queue.publish(update)
    }

    /// Receiving end of the update queue, for the protocol server.
    pub fn take_updates(&self) -> UpdateReceiver {
        self.queue.receiver()
    }

    /// Drop queued updates and refuse new ones.
    pub fn state_close(&self) {
        let discarded = self.queue.close_and_discard();
        debug!(address_id = %self.address_id, discarded, "Closed connector state");
    }

    pub fn is_state_closed(&self) -> bool {
        self.queue.is_closed()
    }

    /// Detach the local store.
    pub async fn close(&self) {
        self.store.close().await;
    }

    // ========================================================================
    // Mailboxes
    // ========================================================================

    #[instrument(skip(self), fields(address_id = %self.address_id))]
    pub async fn create_mailbox(&self, name: &[String]) -> Result<Mailbox> {
        let label = match split_mailbox_name(name)? {
            (LabelKind::Folder, path) => {
                let parent_id = self.parent_folder_id(path)?;
                self.ctx
                    .api
                    .create_label(CreateLabelRequest {
                        name: leaf(path).to_string(),
                        color: DEFAULT_LABEL_COLOR.to_string(),
                        kind: LabelKind::Folder,
                        parent_id,
                    })
                    .await?
            }
            (_, path) => {
                ensure_flat_label(path)?;
                self.ctx
                    .api
                    .create_label(CreateLabelRequest {
                        name: leaf(path).to_string(),
                        color: DEFAULT_LABEL_COLOR.to_string(),
                        kind: LabelKind::Label,
                        parent_id: None,
                    })
                    .await?
            }
        };

        // Visible right away so nested creates find their parent.
        self.ctx.labels.write().set(label.clone());

        Ok(client_mailbox(&label))
    }

    #[instrument(skip(self), fields(address_id = %self.address_id))]
    pub async fn update_mailbox_name(&self, mailbox_id: &str, name: &[String]) -> Result<()> {
        let (kind, path) = split_mailbox_name(name)?;
        let parent_id = match kind {
            LabelKind::Folder => self.parent_folder_id(path)?,
            _ => {
                ensure_flat_label(path)?;
                None
            }
        };

        let current = self.ctx.api.get_label(mailbox_id, &[kind]).await?;
        let updated = self
            .ctx
            .api
            .update_label(
                &current.id,
                UpdateLabelRequest {
                    name: leaf(path).to_string(),
                    color: current.color.clone(),
                    parent_id,
                },
            )
            .await?;

        self.ctx.labels.write().set(updated);
        Ok(())
    }

    #[instrument(skip(self), fields(address_id = %self.address_id))]
    pub async fn delete_mailbox(&self, mailbox_id: &str) -> Result<()> {
        self.ctx.api.delete_label(mailbox_id).await?;
        self.ctx.labels.write().remove(mailbox_id);
        Ok(())
    }

    /// Id of the folder at `path[..len - 1]`; `None` for a top-level folder.
    fn parent_folder_id(&self, path: &[String]) -> Result<Option<String>> {
        let Some((_, parent_path)) = path.split_last() else {
            return Err(ServiceError::not_allowed("empty folder name"));
        };
        if parent_path.is_empty() {
            return Ok(None);
        }

        self.ctx
            .labels
            .read()
            .by_path(LabelKind::Folder, parent_path)
            .map(|parent| Some(parent.id.clone()))
            .ok_or_else(|| {
                ServiceError::not_allowed(format!("parent folder {parent_path:?} does not exist"))
            })
    }

    // ========================================================================
    // Messages
    // ========================================================================

    /// Import a message appended by a client. Returns the stored message and
    /// its literal as rebuilt from the remote copy.
    #[instrument(skip(self, literal, flags), fields(address_id = %self.address_id, size = literal.len()))]
    pub async fn create_message(
        &self,
        mailbox_id: &str,
        literal: &[u8],
        flags: &FlagSet,
    ) -> Result<(Message, Bytes)> {
        if mailbox_id == label_ids::ALL_MAIL {
            return Err(ServiceError::not_allowed("cannot append to All Mail"));
        }

        if self.ctx.identity.read().address(&self.address_id).is_none() {
            return Err(ServiceError::UnknownAddress(self.address_id.clone()));
        }

        let request = import_request(&self.address_id, mailbox_id, literal, flags);
        let imported = self
            .ctx
            .api
            .import_messages(vec![request])
            .await
            .inspect_err(|err| error!(error = %err, "Failed to import message"))?;
        let message_id = imported
            .into_iter()
            .next()
            .map(|result| result.message_id)
            .ok_or_else(|| ServiceError::ConnectorState("import returned no message".into()))?;

        let full = self.ctx.api.get_full_message(&message_id).await?;
        let literal = self.ctx.builder.build_literal(&full)?;

        Ok((local_message(full.metadata()), literal))
    }

    pub async fn get_message_literal(&self, message_id: &str) -> Result<Bytes> {
        let full = self.ctx.api.get_full_message(message_id).await?;
        self.ctx.builder.build_literal(&full)
    }

    pub async fn add_messages_to_mailbox(&self, ids: &[String], mailbox_id: &str) -> Result<()> {
        if is_all_mail_or_scheduled(mailbox_id) {
            return Err(ServiceError::not_allowed("cannot add messages to this mailbox"));
        }

        self.ctx.api.label_messages(ids, mailbox_id).await?;
        Ok(())
    }

    /// Remove messages from a mailbox. Removing from Trash or Drafts deletes
    /// the messages for good once no other mailbox holds them.
    #[instrument(skip(self, ids), fields(address_id = %self.address_id, count = ids.len()))]
    pub async fn remove_messages_from_mailbox(&self, ids: &[String], mailbox_id: &str) -> Result<()> {
        if is_all_mail_or_scheduled(mailbox_id) {
            return Err(ServiceError::not_allowed("cannot remove messages from this mailbox"));
        }

        self.ctx.api.unlabel_messages(ids, mailbox_id).await?;

        if mailbox_id != label_ids::TRASH && mailbox_id != label_ids::DRAFTS {
            return Ok(());
        }

        let mut to_delete = Vec::new();
        for chunk in ids.chunks(EXPUNGE_CHUNK_SIZE) {
            let filter = MessageFilter {
                ids: chunk.to_vec(),
                ..MessageFilter::default()
            };
            let metadata = self
                .ctx
                .api
                .get_message_metadata_page(0, EXPUNGE_CHUNK_SIZE, &filter)
                .await?;

            for message in metadata {
                if !self.has_remaining_mailbox(&message.label_ids).await? {
                    to_delete.push(message.id);
                }
            }
        }

        if !to_delete.is_empty() {
            debug!(count = to_delete.len(), "Permanently deleting messages");
            self.ctx.api.delete_messages(&to_delete).await?;
        }

        Ok(())
    }

    /// Whether any of `label_ids` is a mailbox a client can still see the
    /// message in.
    async fn has_remaining_mailbox(&self, label_ids: &[String]) -> Result<bool> {
        for id in label_ids {
            let label = match self.ctx.labels.get(id) {
                Some(label) => label,
                None => {
                    warn!(label_id = %id, "Unknown label found during expunge, attempting to locate it");
                    match self.ctx.api.get_label(id, &LabelKind::EXPOSED).await {
                        Ok(label) => label,
                        Err(err) if err.is_not_found() => {
                            warn!(label_id = %id, "Label does not exist, ignoring");
                            continue;
                        }
                        Err(err) => return Err(err.into()),
                    }
                }
            };

            let implicit = label.kind == LabelKind::System && IMPLICIT_LABELS.contains(&id.as_str());
            if want_label(&label) && !implicit {
                return Ok(true);
            }
        }

        Ok(false)
    }

    /// Move messages between mailboxes. Returns whether clients must expunge
    /// them from the source mailbox.
    #[instrument(skip(self, ids), fields(address_id = %self.address_id, count = ids.len()))]
    pub async fn move_messages(&self, ids: &[String], from: &str, to: &str) -> Result<bool> {
        let inbox_sent = (from == label_ids::INBOX && to == label_ids::SENT)
            || (from == label_ids::SENT && to == label_ids::INBOX);
        if inbox_sent || is_all_mail_or_scheduled(from) || is_all_mail_or_scheduled(to) {
            return Err(ServiceError::not_allowed(format!("cannot move messages from {from} to {to}")));
        }

        let expunge_source = {
            let labels = self.ctx.labels.read();
            let from_is_label = labels.get(from).is_some_and(|l| l.kind == LabelKind::Label);
            let to_is_exclusive = labels
                .get(to)
                .is_some_and(|l| matches!(l.kind, LabelKind::Folder | LabelKind::System));
            from_is_label || to_is_exclusive
        };

        self.ctx.api.label_messages(ids, to).await?;
        if expunge_source {
            self.ctx.api.unlabel_messages(ids, from).await?;
        }

        Ok(expunge_source)
    }

    pub async fn mark_messages_seen(&self, ids: &[String], seen: bool) -> Result<()> {
        if seen {
            self.ctx.api.mark_messages_read(ids).await?;
        } else {
            self.ctx.api.mark_messages_unread(ids).await?;
        }
        Ok(())
    }

    pub async fn mark_messages_flagged(&self, ids: &[String], flagged: bool) -> Result<()> {
        if flagged {
            self.ctx.api.label_messages(ids, label_ids::STARRED).await?;
        } else {
            self.ctx.api.unlabel_messages(ids, label_ids::STARRED).await?;
        }
        Ok(())
    }

    pub async fn mark_messages_forwarded(&self, ids: &[String], forwarded: bool) -> Result<()> {
        if forwarded {
            self.ctx.api.mark_messages_forwarded(ids).await?;
        } else {
            self.ctx.api.mark_messages_unforwarded(ids).await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("address_id", &self.address_id)
            .field("address_mode", &self.ctx.address_mode)
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Connector set
// ============================================================================

/// Connectors of one account, keyed by address id.
#[derive(Debug, Clone, Default)]
pub struct ConnectorSet {
    connectors: BTreeMap<String, Arc<Connector>>,
}

impl ConnectorSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, connector: Arc<Connector>) {
        self.connectors
            .insert(connector.address_id().to_string(), connector);
    }

    pub fn remove(&mut self, address_id: &str) -> Option<Arc<Connector>> {
        self.connectors.remove(address_id)
    }

    pub fn get(&self, address_id: &str) -> Option<&Arc<Connector>> {
        self.connectors.get(address_id)
    }

    pub fn contains(&self, address_id: &str) -> bool {
        self.connectors.contains_key(address_id)
    }

    pub fn len(&self) -> usize {
        self.connectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connectors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Connector>> {
        self.connectors.values()
    }

    /// The only connector, if there is exactly one.
    pub fn single(&self) -> Option<&Arc<Connector>> {
        match self.connectors.len() {
            1 => self.connectors.values().next(),
            _ => None,
        }
    }

    pub fn store_handles(&self) -> Vec<StoreHandle> {
        self.iter().map(|connector| connector.store_handle()).collect()
    }

    /// Publish `update` on every connector.
    pub fn publish_all(&self, update: &Update) -> Vec<PendingUpdate> {
        self.iter()
            .map(|connector| connector.publish_update(update.clone()))
            .collect()
    }

    /// Remove and return every connector.
    pub fn drain(&mut self) -> Vec<Arc<Connector>> {
        std::mem::take(&mut self.connectors).into_values().collect()
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Validate a client mailbox name and strip its prefix.
fn split_mailbox_name(name: &[String]) -> Result<(LabelKind, &[String])> {
    let invalid = || ServiceError::not_allowed(format!("invalid mailbox name {name:?}"));

    match name {
        [prefix, path @ ..] if !path.is_empty() => match prefix.as_str() {
            FOLDER_PREFIX => Ok((LabelKind::Folder, path)),
            LABEL_PREFIX => Ok((LabelKind::Label, path)),
            _ => Err(invalid()),
        },
        _ => Err(invalid()),
    }
}

fn ensure_flat_label(path: &[String]) -> Result<()> {
    if path.len() != 1 {
        return Err(ServiceError::not_allowed("a label cannot have children"));
    }
    Ok(())
}

fn leaf(path: &[String]) -> &str {
    path.last().map(String::as_str).unwrap_or_default()
}

fn client_mailbox(label: &RemoteLabel) -> Mailbox {
    Mailbox {
        id: label.id.clone(),
        name: mailbox_name(label),
        flags: default_mailbox_flags(),
        permanent_flags: default_mailbox_permanent_flags(),
        attributes: FlagSet::new(),
    }
}

fn import_request(address_id: &str, mailbox_id: &str, literal: &[u8], flags: &FlagSet) -> ImportRequest {
    let mut label_ids = vec![mailbox_id.to_string()];
    if flags.contains(FLAG_FLAGGED) {
        label_ids.push(label_ids::STARRED.to_string());
    }

    let mut unread = !flags.contains(FLAG_SEEN);
    let mut message_flags = MessageFlags::empty();

    match mailbox_id {
        label_ids::DRAFTS => unread = false,
        label_ids::INBOX => message_flags.insert(MessageFlags::RECEIVED),
        label_ids::SENT => message_flags.insert(MessageFlags::SENT),
        _ if has_header(literal, "Received") => message_flags.insert(MessageFlags::RECEIVED),
        _ => message_flags.insert(MessageFlags::SENT),
    }

    if flags.contains(FLAG_ANSWERED) {
        message_flags.insert(MessageFlags::REPLIED);
    }

    ImportRequest {
        address_id: address_id.to_string(),
        label_ids,
        unread,
        flags: message_flags,
        literal: Bytes::copy_from_slice(literal),
    }
}

/// Whether the header section of `literal` has a field called `name`.
fn has_header(literal: &[u8], name: &str) -> bool {
    let text = String::from_utf8_lossy(literal);
    text.lines()
        .take_while(|line| !line.is_empty())
        .filter(|line| !line.starts_with([' ', '\t']))
        .filter_map(|line| line.split_once(':'))
        .any(|(field, _)| field.trim().eq_ignore_ascii_case(name))
}
