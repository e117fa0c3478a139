//! Contract with the local protocol server's user manager.

use std::sync::Arc;

use async_trait::async_trait;
use bridge_traits::error::Result;
use core_sync::SyncStateProvider;

use crate::connector::Connector;

/// Registers connectors with the local protocol server.
///
/// # Platform Support
///
/// Implemented by the host around its protocol server. Registering a
/// connector attaches its store (see [`Connector::init`]) and starts draining
/// its update queue; removing one detaches it, optionally deleting the local
/// data of that address.
#[async_trait]
pub trait ConnectorRegistry: Send + Sync {
    async fn add_connector(
        &self,
        connector: Arc<Connector>,
        sync_state: Arc<dyn SyncStateProvider>,
    ) -> Result<()>;

    async fn remove_connector(&self, address_id: &str, delete_data: bool) -> Result<()>;
}
