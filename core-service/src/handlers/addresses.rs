//! Address events.
//!
//! The identity always follows the event. Connectors only change in split
//! mode, where each enabled address has its own.

use bridge_traits::store::wait_all;
use bridge_traits::{Address, AddressEvent, EventAction, KeyRing};
use core_runtime::logging::redact_if_sensitive;
use core_runtime::AddressMode;
use core_sync::identity::AddressUpdate;
use tracing::{debug, info, warn};

use crate::account::AccountActor;
use crate::applier::publish_label_sync;
use crate::connector::ConnectorSet;
use crate::error::Result;

impl AccountActor {
    pub(crate) async fn handle_address_events(&mut self, events: Vec<AddressEvent>) -> Result<()> {
        for event in events {
            let status = match (event.action, event.address) {
                (EventAction::Delete, _) => self.identity.write().on_address_deleted(&event.id).1,
                (action, Some(address)) => {
                    info!(
                        address_id = %address.id,
                        email = %redact_if_sensitive("email", &address.email),
                        ?action,
                        "Handling address event"
                    );
                    let key = self.unlock_address_keys(&address);
                    let mut identity = self.identity.write();
                    match action {
                        EventAction::Create => identity.on_address_created(address, key),
                        _ => identity.on_address_updated(address, key),
                    }
                }
                (action, None) => {
                    warn!(address_id = %event.id, ?action, "Address event without address");
                    continue;
                }
            };

            if self.address_mode == AddressMode::Combined {
                continue;
            }

            match status {
                AddressUpdate::Created | AddressUpdate::Enabled => {
                    self.add_address_connector(&event.id).await?
                }
                AddressUpdate::Disabled | AddressUpdate::Deleted => {
                    self.remove_address_connector(&event.id).await?
                }
                AddressUpdate::Updated | AddressUpdate::Noop => {}
            }
        }
        Ok(())
    }

    fn unlock_address_keys(&self, address: &Address) -> Option<KeyRing> {
        if !address.is_enabled() {
            return None;
        }

        match self.crypto.unlock_address_keys(address) {
            Ok(key) => Some(key),
            Err(err) => {
                warn!(address_id = %address.id, error = %err, "Failed to unlock address keys");
                None
            }
        }
    }

    /// Register a connector for a new address and give it every mailbox.
    async fn add_address_connector(&mut self, address_id: &str) -> Result<()> {
        debug!(%address_id, "Adding connector for address");

        let connector = self.new_connector(address_id);
        self.registry
            .add_connector(connector.clone(), self.sync_state.clone())
            .await?;
        self.connectors.insert(connector.clone());

        let mut single = ConnectorSet::new();
        single.insert(connector);
        let published = publish_label_sync(&single, &self.labels.snapshot(), &self.conflicts).await?;
        wait_all(published.pending).await?;
        if let Some(err) = published.skipped {
            warn!(%address_id, error = %err, "Address connector is missing a conflicting label");
        }
        Ok(())
    }

    async fn remove_address_connector(&mut self, address_id: &str) -> Result<()> {
        let Some(connector) = self.connectors.get(address_id).cloned() else {
            warn!(%address_id, "No connector for removed address");
            return Ok(());
        };

        debug!(%address_id, "Removing connector for address");
        self.registry.remove_connector(address_id, true).await?;
        connector.state_close();
        self.connectors.remove(address_id);
        Ok(())
    }
}
