//! Label events.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use bridge_traits::store::wait_all;
use bridge_traits::{EventAction, LabelEvent, PendingUpdate, RemoteLabel, Update};
use core_runtime::events::AccountEvent;
use core_sync::mailbox::{hash_label_path, mailbox_created, mailbox_name, want_label};
use core_sync::{ConnectorStores, LabelConflictResolver, MailboxLookup};
use tracing::{debug, info, warn};

use crate::account::AccountActor;
use crate::error::Result;

impl AccountActor {
    pub(crate) async fn handle_label_events(&mut self, events: Vec<LabelEvent>) -> Result<()> {
        for event in events {
            match (event.action, event.label) {
                (EventAction::Delete, _) => self.on_label_deleted(&event.id).await?,
                (EventAction::Create, Some(label)) => self.on_label_created(label).await?,
                (_, Some(label)) => self.on_label_updated(label).await?,
                (action, None) => warn!(label_id = %event.id, ?action, "Label event without label"),
            }
        }
        Ok(())
    }

    async fn on_label_created(&mut self, label: RemoteLabel) -> Result<()> {
        if !want_label(&label) {
            return Ok(());
        }

        info!(label_id = %label.id, path = %hash_label_path(&label.path), "Handling label created event");

        self.labels.write().set(label.clone());
        let resolver = self.label_resolver();
        let mut pending = self.free_mailbox_name(resolver.as_ref(), &label).await?;
        pending.extend(
            self.connectors
                .publish_all(&mailbox_created(&label.id, mailbox_name(&label))),
        );
        wait_all(pending).await?;

        self.emit(AccountEvent::LabelCreated {
            user_id: self.user_id.clone(),
            label_id: label.id,
            name: label.name,
        });
        Ok(())
    }

    /// Rename the label and everything below it.
    ///
    /// Children are re-fetched because their paths changed with the parent;
    /// labels that disappeared meanwhile are skipped together with their
    /// subtree.
    async fn on_label_updated(&mut self, label: RemoteLabel) -> Result<()> {
        if !want_label(&label) {
            return Ok(());
        }

        info!(label_id = %label.id, path = %hash_label_path(&label.path), "Handling label updated event");

        let kind = label.kind;
        {
            let mut labels = self.labels.write();
            if labels.get(&label.id).is_some() {
                labels.set(label.clone());
            }
        }

        let resolver = self.label_resolver();
        let mut pending = Vec::new();
        let mut seen = HashSet::from([label.id.clone()]);
        let mut queue = VecDeque::from([label.id]);

        while let Some(label_id) = queue.pop_front() {
            let fresh = match self.api.get_label(&label_id, &[kind]).await {
                Ok(fresh) => fresh,
                Err(err) if err.is_not_found() => {
                    warn!(%label_id, "Label no longer exists, skipping");
                    continue;
                }
                Err(err) => return Err(err.into()),
            };

            debug!(%label_id, path = %hash_label_path(&fresh.path), "Updating mailbox");
            self.labels.write().set(fresh.clone());

            pending.extend(self.free_mailbox_name(resolver.as_ref(), &fresh).await?);
            pending.extend(self.connectors.publish_all(&Update::MailboxUpdated {
                id: fresh.id.clone(),
                name: mailbox_name(&fresh),
            }));

            self.emit(AccountEvent::LabelUpdated {
                user_id: self.user_id.clone(),
                label_id: fresh.id.clone(),
                name: fresh.name.clone(),
            });

            let children: Vec<String> = self
                .labels
                .read()
                .iter()
                .filter(|child| child.parent_id.as_deref() == Some(fresh.id.as_str()))
                .map(|child| child.id.clone())
                .filter(|id| seen.insert(id.clone()))
                .collect();
            queue.extend(children);
        }

        wait_all(pending).await?;
        Ok(())
    }

    fn label_resolver(&self) -> Arc<dyn LabelConflictResolver> {
        let lookup: Arc<dyn MailboxLookup> =
            Arc::new(ConnectorStores::new(self.connectors.store_handles()));
        self.conflicts.resolver(lookup)
    }

    /// Publish whatever moves other mailboxes out of `label`'s way.
    async fn free_mailbox_name(
        &self,
        resolver: &dyn LabelConflictResolver,
        label: &RemoteLabel,
    ) -> Result<Vec<PendingUpdate>> {
        let thunk = resolver.resolve(label, &mut HashSet::new()).await?;
        Ok(thunk()
            .iter()
            .flat_map(|update| self.connectors.publish_all(update))
            .collect())
    }

    async fn on_label_deleted(&mut self, label_id: &str) -> Result<()> {
        info!(%label_id, "Handling label deleted event");

        let pending = self.connectors.publish_all(&Update::MailboxDeleted {
            id: label_id.to_string(),
            silent: false,
        });
        self.labels.write().remove(label_id);

        self.emit(AccountEvent::LabelDeleted {
            user_id: self.user_id.clone(),
            label_id: label_id.to_string(),
        });

        wait_all(pending).await?;
        Ok(())
    }
}
