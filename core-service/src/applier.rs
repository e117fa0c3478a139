//! # Sync Update Applier
//!
//! Bridges the bulk sync pipeline and the account's connectors.
//!
//! ## Overview
//!
//! The pipeline runs on its own tasks but must not touch connectors behind
//! the account's back. [`SyncUpdateApplier`] therefore sends each batch to the
//! account actor as an [`ApplyRequest`]. The actor publishes the updates on
//! its connectors (see [`publish_label_sync`] and [`publish_sync_messages`])
//! and replies with the pending acknowledgements; the applier then waits for
//! them outside the actor, which keeps serving remote events meanwhile.
//! A label conflict that could not be reconciled travels with the reply and
//! fails the batch only after everything else was applied.
//!
//! ```text
//! pipeline ──ApplyRequest──► account actor ──publish──► connector queues
//!     ▲                            │
//!     └──── Vec<PendingUpdate> ◄───┘   (applier waits for acknowledgements)
//! ```

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use bridge_traits::store::wait_all;
use bridge_traits::{LabelKind, PendingUpdate, RemoteLabel, Update};
use core_runtime::AddressMode;
use core_sync::mailbox::{
    mailbox_created, mailbox_name, placeholder_mailbox_created, system_mailbox_created, want_label,
    FOLDER_PREFIX, LABEL_PREFIX,
};
use core_sync::{
    BuildResult, ConnectorStores, LabelConflictManager, LabelMap, MailboxLookup, SyncError,
    UpdateApplier,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, instrument, warn};

use crate::connector::ConnectorSet;

/// Default capacity of the request channel between applier and actor.
pub const APPLY_REQUEST_BUFFER: usize = 4;

pub enum ApplyKind {
    Labels(Arc<LabelMap>),
    Messages(Vec<BuildResult>),
}

/// One batch for the account actor to publish.
pub struct ApplyRequest {
    pub kind: ApplyKind,
    pub reply: oneshot::Sender<core_sync::Result<Published>>,
}

/// Updates handed to the connectors for one batch.
pub struct Published {
    pub pending: Vec<PendingUpdate>,
    /// Set when a label was left out because its name conflict is
    /// irreconcilable. The batch fails once `pending` is acknowledged.
    pub skipped: Option<SyncError>,
}

impl From<Vec<PendingUpdate>> for Published {
    fn from(pending: Vec<PendingUpdate>) -> Self {
        Self {
            pending,
            skipped: None,
        }
    }
}

impl std::fmt::Debug for ApplyRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.kind {
            ApplyKind::Labels(labels) => format!("labels({})", labels.len()),
            ApplyKind::Messages(messages) => format!("messages({})", messages.len()),
        };
        f.debug_struct("ApplyRequest").field("kind", &kind).finish()
    }
}

/// [`UpdateApplier`] handed to the sync handler.
#[derive(Clone, Debug)]
pub struct SyncUpdateApplier {
    requests: mpsc::Sender<ApplyRequest>,
}

impl SyncUpdateApplier {
    /// Applier plus the receiving end the account actor serves.
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<ApplyRequest>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self { requests: tx }, rx)
    }

    async fn apply(&self, kind: ApplyKind) -> core_sync::Result<()> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(ApplyRequest { kind, reply })
            .await
            .map_err(|_| SyncError::Apply("account service stopped".into()))?;

        let published = response
            .await
            .map_err(|_| SyncError::Apply("account service stopped".into()))??;

        wait_all(published.pending)
            .await
            .map_err(|err| SyncError::Apply(format!("could not apply updates: {err}")))?;

        match published.skipped {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl UpdateApplier for SyncUpdateApplier {
    async fn sync_labels(&self, labels: &LabelMap) -> core_sync::Result<()> {
        self.apply(ApplyKind::Labels(Arc::new(labels.clone()))).await
    }

    async fn apply_sync_updates(&self, updates: Vec<BuildResult>) -> core_sync::Result<()> {
        self.apply(ApplyKind::Messages(updates)).await
    }
}

// ============================================================================
// Publishing (runs on the account actor)
// ============================================================================

/// Serve one request against the current connectors.
pub async fn serve_request(
    request: ApplyRequest,
    connectors: &ConnectorSet,
    address_mode: AddressMode,
    conflicts: &LabelConflictManager,
) {
    let result = match request.kind {
        ApplyKind::Labels(labels) => publish_label_sync(connectors, &labels, conflicts).await,
        ApplyKind::Messages(updates) => {
            publish_sync_messages(connectors, address_mode, updates).map(Published::from)
        }
    };

    if request.reply.send(result).is_err() {
        debug!("Applier went away before the reply");
    }
}

/// Publish the mailboxes of every wanted label on every connector.
///
/// Placeholders for the folder and label prefixes come first, then whatever
/// the internal conflict resolver needs, then one mailbox per label in name
/// order. A folder or label whose name conflict cannot be reconciled is
/// skipped and reported in [`Published::skipped`]; any other resolver
/// failure aborts the label sync.
#[instrument(skip_all, fields(labels = labels.len(), connectors = connectors.len()))]
pub async fn publish_label_sync(
    connectors: &ConnectorSet,
    labels: &LabelMap,
    conflicts: &LabelConflictManager,
) -> core_sync::Result<Published> {
    let mut pending = Vec::new();
    let mut skipped = None;

    for prefix in [FOLDER_PREFIX, LABEL_PREFIX] {
        pending.extend(connectors.publish_all(&placeholder_mailbox_created(prefix)));
    }

    let lookup: Arc<dyn MailboxLookup> = Arc::new(ConnectorStores::new(connectors.store_handles()));

    let internal = conflicts.internal_resolver(lookup.clone()).resolve(labels).await?;
    for update in internal() {
        pending.extend(connectors.publish_all(&update));
    }

    let resolver = conflicts.resolver(lookup);

    for label in wanted_in_name_order(labels) {
        match label.kind {
            LabelKind::System => {
                let update = system_mailbox_created(&label.id, &label.name);
                pending.extend(connectors.publish_all(&update));
            }
            LabelKind::Folder | LabelKind::Label => {
                let thunk = match resolver.resolve(label, &mut HashSet::new()).await {
                    Ok(thunk) => thunk,
                    Err(err @ SyncError::LabelConflict { .. }) => {
                        error!(label_id = %label.id, error = %err, "Skipping label with unresolvable name conflict");
                        skipped.get_or_insert(err);
                        continue;
                    }
                    Err(err) => return Err(err),
                };

                for connector in connectors.iter() {
                    for update in thunk() {
                        pending.push(connector.publish_update(update));
                    }
                    pending.push(connector.publish_update(mailbox_created(&label.id, mailbox_name(label))));
                }
            }
            LabelKind::ContactGroup => {}
        }
    }

    Ok(Published { pending, skipped })
}

fn wanted_in_name_order(labels: &LabelMap) -> Vec<&RemoteLabel> {
    let mut wanted: Vec<&RemoteLabel> = labels.values().filter(|label| want_label(label)).collect();
    wanted.sort_by_cached_key(|label| mailbox_name(label));
    wanted
}

/// Publish built messages on the connector of their address.
pub fn publish_sync_messages(
    connectors: &ConnectorSet,
    address_mode: AddressMode,
    updates: Vec<BuildResult>,
) -> core_sync::Result<Vec<PendingUpdate>> {
    match address_mode {
        AddressMode::Combined => {
            let connector = connectors.single().ok_or_else(|| {
                SyncError::Apply(format!(
                    "combined mode expects one connector, found {}",
                    connectors.len()
                ))
            })?;

            let messages = updates.into_iter().map(|result| result.update).collect();
            Ok(vec![connector.publish_update(Update::MessagesCreated {
                messages,
                ignore_unknown_mailbox_ids: true,
            })])
        }
        AddressMode::Split => {
            let mut by_address: BTreeMap<String, Vec<_>> = BTreeMap::new();
            for result in updates {
                by_address
                    .entry(result.address_id)
                    .or_default()
                    .push(result.update);
            }

            let mut pending = Vec::with_capacity(by_address.len());
            for (address_id, messages) in by_address {
                let Some(connector) = connectors.get(&address_id) else {
                    warn!(%address_id, count = messages.len(), "No connector for address, dropping messages");
                    continue;
                };
                pending.push(connector.publish_update(Update::MessagesCreated {
                    messages,
                    ignore_unknown_mailbox_ids: true,
                }));
            }
            Ok(pending)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{folder, label, spawn_server, system_label, FakeStore, Harness, UpdateLog};
    use bridge_traits::label_ids;
    use bridge_traits::Telemetry;
    use core_runtime::config::FeatureFlags;
    use core_sync::message::message_created;

    fn names(segments: &[&str]) -> Vec<String> {
        segments.iter().map(|s| s.to_string()).collect()
    }

    fn conflicts(h: &Harness) -> LabelConflictManager {
        let telemetry: Arc<dyn Telemetry> = h.telemetry.clone();
        LabelConflictManager::new(h.api.clone(), telemetry, FeatureFlags::default())
    }

    fn label_map(labels: Vec<RemoteLabel>) -> LabelMap {
        labels.into_iter().map(|l| (l.id.clone(), l)).collect()
    }

    fn build_result(message_id: &str, address_id: &str) -> BuildResult {
        let meta = crate::testing::metadata(message_id, address_id, &[label_ids::INBOX]);
        BuildResult {
            address_id: address_id.into(),
            message_id: message_id.into(),
            update: message_created(&LabelMap::new(), &meta, "literal".into()),
        }
    }

    /// Connectors for `addresses` attached to empty stores and served.
    async fn serve(h: &Harness, addresses: &[&str], mode: AddressMode) -> (ConnectorSet, UpdateLog) {
        serve_with_mailboxes(h, addresses, mode, &[]).await
    }

    async fn serve_with_mailboxes(
        h: &Harness,
        addresses: &[&str],
        mode: AddressMode,
        mailboxes: &[(&str, &[&str])],
    ) -> (ConnectorSet, UpdateLog) {
        let log = UpdateLog::default();
        let mut set = ConnectorSet::new();
        for address_id in addresses {
            let connector = Arc::new(h.connector(address_id, mode));
            connector
                .init(Arc::new(FakeStore::with_mailboxes(mailboxes)))
                .await
                .unwrap();
            spawn_server(&connector, log.clone());
            set.insert(connector);
        }
        (set, log)
    }

    #[tokio::test]
    async fn test_label_sync_order() {
        let labels = vec![
            system_label(label_ids::INBOX, "Inbox"),
            system_label(label_ids::ALL_SENT, "All Sent"),
            folder("f1", &["Work"]),
            label("l1", "Alpha"),
        ];
        let h = Harness::new(&["a1"], labels.clone());
        let (set, log) = serve(&h, &["a1"], AddressMode::Combined).await;

        let pending = publish_label_sync(&set, &label_map(labels), &conflicts(&h))
            .await
            .unwrap()
            .pending;
        wait_all(pending).await.unwrap();

        let created: Vec<Vec<String>> = log
            .for_address("a1")
            .into_iter()
            .filter_map(|update| match update {
                Update::MailboxCreated(mailbox) => Some(mailbox.name),
                _ => None,
            })
            .collect();

        assert_eq!(
            created,
            vec![
                names(&["Folders"]),
                names(&["Labels"]),
                names(&["Folders", "Work"]),
                names(&["INBOX"]),
                names(&["Labels", "Alpha"]),
            ]
        );
    }

    #[tokio::test]
    async fn test_label_sync_reaches_every_connector() {
        let labels = vec![folder("f1", &["Work"])];
        let h = Harness::new(&["a1", "a2"], labels.clone());
        let (set, log) = serve(&h, &["a1", "a2"], AddressMode::Split).await;

        let pending = publish_label_sync(&set, &label_map(labels), &conflicts(&h))
            .await
            .unwrap()
            .pending;
        wait_all(pending).await.unwrap();

        assert_eq!(log.kinds("a1"), log.kinds("a2"));
        assert_eq!(
            log.kinds("a1"),
            vec![
                "MailboxCreated",
                "MailboxCreated",
                "MailboxUpdatedOrCreated",
                "MailboxCreated"
            ]
        );
    }

    #[tokio::test]
    async fn test_irreconcilable_label_skipped_and_reported() {
        let labels = vec![folder("a", &["A"]), folder("b", &["B"])];
        let h = Harness::new(&["a1"], labels.clone());
        // Another folder already holds "Folders/A" both locally and remotely.
        h.api.put_label(folder("other", &["A"]));
        let (set, log) =
            serve_with_mailboxes(&h, &["a1"], AddressMode::Combined, &[("other", &["Folders", "A"])])
                .await;
        let (applier, mut requests) = SyncUpdateApplier::channel(APPLY_REQUEST_BUFFER);
        let manager = conflicts(&h);

        let actor = tokio::spawn(async move {
            while let Some(request) = requests.recv().await {
                serve_request(request, &set, AddressMode::Combined, &manager).await;
            }
        });

        let err = applier.sync_labels(&label_map(labels)).await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::LabelConflict { ref label_id, ref conflicting_id }
                if label_id == "a" && conflicting_id == "other"
        ));

        let created: Vec<(String, Vec<String>)> = log
            .for_address("a1")
            .into_iter()
            .filter_map(|update| match update {
                Update::MailboxCreated(mailbox) => Some((mailbox.id, mailbox.name)),
                _ => None,
            })
            .collect();
        assert!(created.contains(&("b".to_string(), names(&["Folders", "B"]))));
        assert!(created.iter().all(|(id, _)| id != "a"));
        assert_eq!(h.telemetry.messages(), vec!["Unexpected label conflict".to_string()]);

        drop(applier);
        actor.await.unwrap();
    }

    #[tokio::test]
    async fn test_combined_messages_need_single_connector() {
        let h = Harness::new(&["a1", "a2"], Vec::new());
        let (set, _log) = serve(&h, &["a1", "a2"], AddressMode::Split).await;

        let err = publish_sync_messages(&set, AddressMode::Combined, vec![build_result("m1", "a1")])
            .unwrap_err();
        assert!(matches!(err, SyncError::Apply(_)));
    }

    #[tokio::test]
    async fn test_split_messages_routed_by_address() {
        let h = Harness::new(&["a1", "a2"], Vec::new());
        let (set, log) = serve(&h, &["a1", "a2"], AddressMode::Split).await;

        let pending = publish_sync_messages(
            &set,
            AddressMode::Split,
            vec![
                build_result("m1", "a1"),
                build_result("m2", "a2"),
                build_result("m3", "a1"),
                build_result("m4", "unknown"),
            ],
        )
        .unwrap();
        assert_eq!(pending.len(), 2);
        wait_all(pending).await.unwrap();

        let Update::MessagesCreated { messages, ignore_unknown_mailbox_ids } = &log.for_address("a1")[0] else {
            panic!("expected MessagesCreated");
        };
        assert!(ignore_unknown_mailbox_ids);
        let ids: Vec<_> = messages.iter().map(|m| m.message.id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m3"]);
    }

    #[tokio::test]
    async fn test_applier_round_trip_through_actor() {
        let h = Harness::new(&["a1"], Vec::new());
        let (set, log) = serve(&h, &["a1"], AddressMode::Combined).await;
        let (applier, mut requests) = SyncUpdateApplier::channel(APPLY_REQUEST_BUFFER);
        let manager = conflicts(&h);

        let actor = tokio::spawn(async move {
            while let Some(request) = requests.recv().await {
                serve_request(request, &set, AddressMode::Combined, &manager).await;
            }
        });

        applier
            .apply_sync_updates(vec![build_result("m1", "a1")])
            .await
            .unwrap();
        assert_eq!(log.kinds("a1"), vec!["MessagesCreated"]);

        drop(applier);
        actor.await.unwrap();
    }

    #[tokio::test]
    async fn test_applier_reports_stopped_actor() {
        let (applier, requests) = SyncUpdateApplier::channel(1);
        drop(requests);

        let err = applier.sync_labels(&LabelMap::new()).await.unwrap_err();
        assert!(matches!(err, SyncError::Apply(msg) if msg.contains("stopped")));
    }
}
