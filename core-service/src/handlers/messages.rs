//! Message events.
//!
//! Outside of a bulk sync, flag and label changes only move the message
//! between mailboxes. Drafts and sent messages change content on update and
//! are replaced in full. While a sync runs the local store may not know the
//! message yet, so every update is a full replace that may create it.

use bridge_traits::store::wait_all;
use bridge_traits::{
    BridgeError, EventAction, MessageCreated, MessageEvent, MessageMetadata, PendingUpdate, Update,
};
use core_runtime::logging::redact_if_sensitive;
use core_runtime::AddressMode;
use core_sync::mailbox::{message_flags, want_labels};
use tracing::{debug, error, info, warn};

use crate::account::AccountActor;
use crate::error::{Result, ServiceError};

impl AccountActor {
    pub(crate) async fn handle_message_events(
        &mut self,
        events: Vec<MessageEvent>,
        syncing: bool,
    ) -> Result<()> {
        for event in events {
            match (event.action, event.message) {
                (EventAction::Delete, _) => self.on_message_deleted(event.id).await?,
                (EventAction::Create, Some(message)) => {
                    self.on_message_created(message, syncing).await?
                }
                (action, Some(message)) => self.on_message_updated(message, action, syncing).await?,
                (action, None) => {
                    warn!(message_id = %event.id, ?action, "Message event without message")
                }
            }
        }
        Ok(())
    }

    async fn on_message_created(&mut self, message: MessageMetadata, syncing: bool) -> Result<()> {
        info!(
            message_id = %message.id,
            subject = %redact_if_sensitive("subject", &message.subject),
            date = message.time,
            "Handling message created event"
        );

        let Some(created) = self.fetch_and_build(&message.id).await? else {
            return Ok(());
        };

        let update = Update::MessagesCreated {
            messages: vec![created],
            ignore_unknown_mailbox_ids: syncing,
        };
        if let Some(pending) = self.safe_publish(&message.address_id, update)? {
            pending.wait().await?;
        }
        Ok(())
    }

    async fn on_message_updated(
        &mut self,
        message: MessageMetadata,
        action: EventAction,
        syncing: bool,
    ) -> Result<()> {
        let content_changed =
            action == EventAction::Update && (message.is_draft() || message.is_sent());
        if syncing || content_changed {
            return self.on_message_replaced(message).await;
        }

        debug!(message_id = %message.id, ?action, "Handling message mailboxes update");

        let mailbox_ids = want_labels(&self.labels.snapshot(), &message.label_ids);
        let update = Update::MessageMailboxesUpdated {
            id: message.id.clone(),
            mailbox_ids,
            flags: message_flags(&message),
        };
        let Some(pending) = self.safe_publish(&message.address_id, update)? else {
            return Ok(());
        };

        match pending.wait().await {
            Ok(()) => Ok(()),
            Err(BridgeError::NoSuchMessage(_)) => {
                error!(message_id = %message.id, "Updated message is not in the local store, creating it");
                self.on_message_created(message, false).await
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn on_message_replaced(&mut self, message: MessageMetadata) -> Result<()> {
        info!(
            message_id = %message.id,
            subject = %redact_if_sensitive("subject", &message.subject),
            is_draft = message.is_draft(),
            "Handling message replaced event"
        );

        let Some(created) = self.fetch_and_build(&message.id).await? else {
            return Ok(());
        };

        let update = Update::MessageUpdated {
            created,
            allow_create: true,
        };
        if let Some(pending) = self.safe_publish(&message.address_id, update)? {
            pending.wait().await?;
        }
        Ok(())
    }

    async fn on_message_deleted(&mut self, message_id: String) -> Result<()> {
        debug!(%message_id, "Handling message deleted event");
        let pending = self.connectors.publish_all(&Update::MessagesDeleted {
            ids: vec![message_id],
        });
        wait_all(pending).await?;
        Ok(())
    }

    /// Full message as a local update, or `None` when it is gone or failed to
    /// build. Build failures land in the failed set; a missing keyring is an
    /// error.
    async fn fetch_and_build(&self, message_id: &str) -> Result<Option<MessageCreated>> {
        let full = match self.api.get_full_message(message_id).await {
            Ok(full) => full,
            Err(err) if err.is_not_found() => {
                warn!(%message_id, "Full message is missing on the remote, skipping");
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };

        let ids = [message_id.to_string()];
        match self.builder.build_update(&self.labels.snapshot(), &full) {
            Ok(result) => {
                if let Err(err) = self.sync_state.remove_failed_message_ids(&ids).await {
                    error!(%message_id, error = %err, "Failed to clear failed message id");
                }
                Ok(Some(result.update))
            }
            Err(err @ ServiceError::MissingKeyRing(_)) => Err(err),
            Err(err) => {
                error!(%message_id, error = %err, "Failed to build message");
                if let Err(err) = self.sync_state.add_failed_message_ids(&ids).await {
                    error!(%message_id, error = %err, "Failed to record failed message id");
                }
                Ok(None)
            }
        }
    }

    /// Publish on the connector of `address_id`.
    ///
    /// Combined mode falls back to the primary address; split mode drops
    /// updates for addresses without a connector.
    pub(crate) fn safe_publish(
        &self,
        address_id: &str,
        update: Update,
    ) -> Result<Option<PendingUpdate>> {
        if let Some(connector) = self.connectors.get(address_id) {
            return Ok(Some(connector.publish_update(update)));
        }

        match self.address_mode {
            AddressMode::Combined => {
                let primary_id = self
                    .identity
                    .read()
                    .primary_address()
                    .map(|address| address.id.clone())
                    .ok_or_else(|| ServiceError::UnknownAddress(address_id.to_string()))?;
                let connector = self
                    .connectors
                    .get(&primary_id)
                    .ok_or_else(|| ServiceError::UnknownAddress(primary_id.clone()))?;
                Ok(Some(connector.publish_update(update)))
            }
            AddressMode::Split => {
                warn!(%address_id, update = %update, "No connector for address, dropping update");
                Ok(None)
            }
        }
    }
}
