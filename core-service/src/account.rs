//! # Account Service
//!
//! One actor per logged-in account. It owns the account's connectors and
//! the bulk sync handler, and it is the only place that mutates them.
//!
//! ## Overview
//!
//! [`AccountService::start`] loads the sync status, fetches the labels,
//! registers one connector per exposed address and starts the bulk sync.
//! The spawned account actor then serves, one at a time:
//!
//! - control requests from the [`AccountService`] handle
//! - results of finished sync attempts
//! - publish requests from the sync pipeline (see [`crate::applier`])
//! - remote events from the host's event poller
//! - "server created" notifications, which re-register every connector
//!
//! While the bulk sync runs, message events are handled by the sync-aware
//! handler and the event cursor is rewound to the last handled event once
//! the sync completes.
//!
//! ## Usage
//!
//! ```no_run
//! # use core_service::account::{AccountDeps, AccountInputs, AccountService};
//! # use core_runtime::BridgeConfig;
//! # use core_sync::SharedIdentity;
//! # use tokio_util::sync::CancellationToken;
//! # async fn example(
//! #     config: BridgeConfig,
//! #     identity: SharedIdentity,
//! #     deps: AccountDeps,
//! #     inputs: AccountInputs,
//! # ) -> core_service::Result<()> {
//! let token = CancellationToken::new();
//! let (service, task) =
//!     AccountService::start(&config, identity, deps, inputs, "event-1", token.clone()).await?;
//!
//! let failed = service.get_sync_failed_message_ids().await?;
//! println!("{} messages failed to build", failed.len());
//!
//! token.cancel();
//! task.await.ok();
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use bridge_traits::{
    EventCursor, LabelKind, MessageCrypto, NetworkMonitor, RemoteApi, RemoteEvent, Telemetry,
};
use core_runtime::events::{AccountEvent, CoreEvent, EventBus};
use core_runtime::{AddressMode, BridgeConfig};
use core_sync::identity::fetch_identity;
use core_sync::{
    FileSyncState, LabelConflictManager, LabelDirectory, LabelMap, SharedIdentity, SyncFinished,
    SyncHandler, SyncLimits, SyncReporter, SyncStateProvider,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn, Instrument};

use crate::applier::{serve_request, ApplyRequest, SyncUpdateApplier, APPLY_REQUEST_BUFFER};
use crate::builder::CryptoMessageBuilder;
use crate::connector::{Connector, ConnectorContext, ConnectorSet};
use crate::error::{Result, ServiceError};
use crate::registry::ConnectorRegistry;

/// Capacity of the control request channel.
pub const CONTROL_REQUEST_BUFFER: usize = 8;

/// Collaborators provided by the host.
#[derive(Clone)]
pub struct AccountDeps {
    pub api: Arc<dyn RemoteApi>,
    pub crypto: Arc<dyn MessageCrypto>,
    pub registry: Arc<dyn ConnectorRegistry>,
    pub cursor: Arc<dyn EventCursor>,
    pub events: EventBus,
}

/// Streams the actor consumes besides its own control requests.
pub struct AccountInputs {
    /// Decoded remote events, in stream order
    pub remote_events: mpsc::Receiver<RemoteEvent>,
    /// Fires whenever the local protocol server was (re)created
    pub server_created: mpsc::Receiver<()>,
}

type Reply<T> = oneshot::Sender<Result<T>>;

enum ControlRequest {
    SetAddressMode(AddressMode, Reply<()>),
    Resync(Reply<()>),
    CancelSync(Reply<()>),
    ResumeSync(Reply<()>),
    OnBadEvent(Reply<()>),
    OnBadEventResync(Reply<()>),
    OnLogout(Reply<()>),
    ShowAllMail(bool, Reply<()>),
    GetLabels(Reply<LabelMap>),
    GetSyncFailedMessageIds(Reply<Vec<String>>),
    ConnectivityChanged(bool, Reply<()>),
}

// ============================================================================
// Handle
// ============================================================================

/// Cloneable handle to a running account actor.
#[derive(Clone, Debug)]
pub struct AccountService {
    user_id: String,
    requests: mpsc::Sender<ControlRequest>,
}

impl AccountService {
    /// Bring up the account and spawn its actor.
    ///
    /// The returned task resolves when `token` is cancelled or a remote event
    /// could not be handled.
    #[instrument(skip_all, fields(user_id = %identity.user_id()))]
    pub async fn start(
        config: &BridgeConfig,
        identity: SharedIdentity,
        deps: AccountDeps,
        inputs: AccountInputs,
        last_event_id: impl Into<String>,
        token: CancellationToken,
    ) -> Result<(AccountService, JoinHandle<Result<()>>)> {
        let user_id = identity.user_id();
        let sync_state: Arc<dyn SyncStateProvider> =
            Arc::new(FileSyncState::load(config.sync_state_path(&user_id)).await?);

        let labels = LabelDirectory::new(deps.api.get_labels(&LabelKind::EXPOSED).await?);
        debug!(labels = labels.read().len(), "Fetched labels");

        let limits = SyncLimits::new(
            config.max_sync_memory,
            config.system_memory.total_memory(),
            config.features.force_minimum_sync_spec,
        );
        let sync = SyncHandler::new(
            user_id.clone(),
            deps.api.clone(),
            sync_state.clone(),
            config.telemetry.clone(),
            limits,
        );
        let sync_finished = sync
            .take_sync_finished()
            .ok_or_else(|| ServiceError::ConnectorState("sync results already taken".into()))?;
        let (applier, apply_requests) = SyncUpdateApplier::channel(APPLY_REQUEST_BUFFER);

        let mut actor = AccountActor {
            user_id: user_id.clone(),
            builder: Arc::new(CryptoMessageBuilder::new(identity.clone(), deps.crypto.clone())),
            conflicts: LabelConflictManager::new(
                deps.api.clone(),
                config.telemetry.clone(),
                config.features,
            ),
            reporter: Arc::new(SyncReporter::new(user_id.clone(), deps.events.clone())),
            api: deps.api,
            crypto: deps.crypto,
            registry: deps.registry,
            cursor: deps.cursor,
            events: deps.events,
            telemetry: config.telemetry.clone(),
            identity,
            labels,
            sync_state,
            address_mode: config.address_mode,
            show_all_mail: config.show_all_mail,
            retry_cooldown: config.retry_cooldown,
            connectors: ConnectorSet::new(),
            sync,
            applier,
            is_syncing: false,
            last_handled_event_id: last_event_id.into(),
        };

        actor.connectors = actor.build_connectors()?;
        actor.add_connectors_to_server().await?;
        actor.start_syncing();

        let (tx, rx) = mpsc::channel(CONTROL_REQUEST_BUFFER);
        let service = AccountService {
            user_id: user_id.clone(),
            requests: tx,
        };

        if config.features.enable_network_awareness {
            if let Some(monitor) = config.network_monitor.clone() {
                spawn_network_forwarder(monitor, service.clone(), token.child_token());
            }
        }

        let channels = ActorChannels {
            requests: rx,
            sync_finished,
            apply_requests,
            remote_events: inputs.remote_events,
            server_created: inputs.server_created,
        };
        let span = tracing::info_span!("account", %user_id);
        let task = tokio::spawn(actor.run(channels, token).instrument(span));

        info!("Account service started");
        Ok((service, task))
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> ControlRequest) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(make(reply))
            .await
            .map_err(|_| ServiceError::ServiceStopped)?;
        response.await.map_err(|_| ServiceError::ServiceStopped)?
    }

    /// Switch between combined and split mode, rebuilding every connector.
    pub async fn set_address_mode(&self, mode: AddressMode) -> Result<()> {
        self.request(|reply| ControlRequest::SetAddressMode(mode, reply))
            .await
    }

    /// Drop local state and sync everything again.
    pub async fn resync(&self) -> Result<()> {
        self.request(ControlRequest::Resync).await
    }

    pub async fn cancel_sync(&self) -> Result<()> {
        self.request(ControlRequest::CancelSync).await
    }

    pub async fn resume_sync(&self) -> Result<()> {
        self.request(ControlRequest::ResumeSync).await
    }

    /// Detach connectors after the event stream went out of sync.
    pub async fn on_bad_event(&self) -> Result<()> {
        self.request(ControlRequest::OnBadEvent).await
    }

    /// Reattach connectors once the host decided to resync.
    pub async fn on_bad_event_resync(&self) -> Result<()> {
        self.request(ControlRequest::OnBadEventResync).await
    }

    pub async fn on_logout(&self) -> Result<()> {
        self.request(ControlRequest::OnLogout).await
    }

    pub async fn show_all_mail(&self, show: bool) -> Result<()> {
        self.request(|reply| ControlRequest::ShowAllMail(show, reply))
            .await
    }

    pub async fn get_labels(&self) -> Result<LabelMap> {
        self.request(ControlRequest::GetLabels).await
    }

    pub async fn get_sync_failed_message_ids(&self) -> Result<Vec<String>> {
        self.request(ControlRequest::GetSyncFailedMessageIds).await
    }

    /// Pause bulk sync while offline and resume it once back online.
    pub async fn connectivity_changed(&self, connected: bool) -> Result<()> {
        self.request(|reply| ControlRequest::ConnectivityChanged(connected, reply))
            .await
    }
}

fn spawn_network_forwarder(
    monitor: Arc<dyn NetworkMonitor>,
    service: AccountService,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut changes = match monitor.subscribe_changes().await {
            Ok(changes) => changes,
            Err(err) => {
                warn!(error = %err, "Connectivity changes unavailable");
                return;
            }
        };

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                change = changes.next() => {
                    let Some(info) = change else { break };
                    debug!(status = ?info.status, "Connectivity changed");
                    if service.connectivity_changed(info.is_connected()).await.is_err() {
                        break;
                    }
                }
            }
        }
    })
}

// ============================================================================
// Actor
// ============================================================================

struct ActorChannels {
    requests: mpsc::Receiver<ControlRequest>,
    sync_finished: mpsc::Receiver<SyncFinished>,
    apply_requests: mpsc::Receiver<ApplyRequest>,
    remote_events: mpsc::Receiver<RemoteEvent>,
    server_created: mpsc::Receiver<()>,
}

/// State owned by the account task.
pub(crate) struct AccountActor {
    pub(crate) user_id: String,
    pub(crate) api: Arc<dyn RemoteApi>,
    pub(crate) crypto: Arc<dyn MessageCrypto>,
    pub(crate) registry: Arc<dyn ConnectorRegistry>,
    pub(crate) cursor: Arc<dyn EventCursor>,
    pub(crate) events: EventBus,
    pub(crate) telemetry: Arc<dyn Telemetry>,
    pub(crate) identity: SharedIdentity,
    pub(crate) labels: LabelDirectory,
    pub(crate) builder: Arc<CryptoMessageBuilder>,
    pub(crate) sync_state: Arc<dyn SyncStateProvider>,
    pub(crate) conflicts: LabelConflictManager,
    pub(crate) address_mode: AddressMode,
    pub(crate) show_all_mail: bool,
    pub(crate) retry_cooldown: Duration,
    pub(crate) connectors: ConnectorSet,
    pub(crate) sync: SyncHandler,
    pub(crate) applier: SyncUpdateApplier,
    pub(crate) reporter: Arc<SyncReporter>,
    pub(crate) is_syncing: bool,
    pub(crate) last_handled_event_id: String,
}

impl AccountActor {
    async fn run(mut self, mut channels: ActorChannels, token: CancellationToken) -> Result<()> {
        let result = loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("Account service cancelled");
                    break Ok(());
                }
                Some(request) = channels.requests.recv() => {
                    self.handle_control(request).await;
                }
                Some(result) = channels.sync_finished.recv() => {
                    self.on_sync_finished(result).await;
                }
                Some(request) = channels.apply_requests.recv() => {
                    serve_request(request, &self.connectors, self.address_mode, &self.conflicts).await;
                }
                Some(event) = channels.remote_events.recv() => {
                    if let Err(err) = self.handle_remote_event(event).await {
                        error!(error = %err, "Failed to handle remote event");
                        break Err(err);
                    }
                }
                Some(()) = channels.server_created.recv() => {
                    debug!("Server created, registering connectors");
                    if let Err(err) = self.add_connectors_to_server().await {
                        error!(error = %err, "Failed to register connectors with new server");
                    }
                }
            }
        };

        self.sync.close().await;
        for connector in self.connectors.iter() {
            connector.state_close();
        }
        info!("Account service stopped");

        result
    }

    async fn handle_control(&mut self, request: ControlRequest) {
        match request {
            ControlRequest::SetAddressMode(mode, reply) => {
                reply.send(self.set_address_mode(mode).await).ok();
            }
            ControlRequest::Resync(reply) => {
                info!("Resync requested");
                reply.send(self.handle_refresh().await).ok();
            }
            ControlRequest::CancelSync(reply) => {
                self.sync.cancel();
                reply.send(Ok(())).ok();
            }
            ControlRequest::ResumeSync(reply) => {
                self.cancel_sync().await;
                self.start_syncing();
                reply.send(Ok(())).ok();
            }
            ControlRequest::OnBadEvent(reply) => {
                reply.send(self.remove_connectors_from_server(false).await).ok();
            }
            ControlRequest::OnBadEventResync(reply) => {
                reply.send(self.add_connectors_to_server().await).ok();
            }
            ControlRequest::OnLogout(reply) => {
                reply.send(self.remove_connectors_from_server(false).await).ok();
            }
            ControlRequest::ShowAllMail(show, reply) => {
                self.set_show_all_mail(show);
                reply.send(Ok(())).ok();
            }
            ControlRequest::GetLabels(reply) => {
                reply.send(Ok(self.labels.snapshot())).ok();
            }
            ControlRequest::GetSyncFailedMessageIds(reply) => {
                let ids = self
                    .sync_state
                    .status()
                    .await
                    .map(|status| status.failed_message_ids.into_iter().collect())
                    .map_err(ServiceError::from);
                reply.send(ids).ok();
            }
            ControlRequest::ConnectivityChanged(connected, reply) => {
                reply.send(self.on_connectivity_changed(connected).await).ok();
            }
        }
    }

    async fn on_sync_finished(&mut self, result: SyncFinished) {
        if let Err(err) = result {
            error!(error = %err, "Sync failed");
            return;
        }

        info!(event_id = %self.last_handled_event_id, "Sync complete, rewinding event stream");
        if let Err(err) = self.cursor.rewind_event_id(&self.last_handled_event_id).await {
            error!(error = %err, "Failed to rewind event stream");
            self.emit(AccountEvent::BadEvent {
                user_id: self.user_id.clone(),
                message: format!("failed to rewind event stream: {err}"),
            });
        }
        self.is_syncing = false;
    }

    async fn on_connectivity_changed(&mut self, connected: bool) -> Result<()> {
        if !connected {
            info!("Connection lost, pausing sync");
            self.cancel_sync().await;
            return Ok(());
        }

        if !self.sync_state.status().await?.is_complete() {
            info!("Connection restored, resuming sync");
            self.start_syncing();
        }
        Ok(())
    }

    fn set_show_all_mail(&mut self, show: bool) {
        if self.show_all_mail == show {
            return;
        }
        self.show_all_mail = show;
        for connector in self.connectors.iter() {
            connector.show_all_mail(show);
        }
    }

    #[instrument(skip(self), fields(user_id = %self.user_id))]
    async fn set_address_mode(&mut self, mode: AddressMode) -> Result<()> {
        if self.address_mode == mode {
            debug!("Address mode unchanged");
            return Ok(());
        }

        info!(?mode, "Changing address mode");
        self.address_mode = mode;

        self.cancel_sync().await;
        self.remove_connectors_from_server(true).await?;
        self.sync_state.clear().await?;

        for connector in self.connectors.drain() {
            connector.state_close();
        }
        self.connectors = self.build_connectors()?;

        self.add_connectors_to_server().await?;
        self.start_syncing();

        self.emit(AccountEvent::AddressModeChanged {
            user_id: self.user_id.clone(),
            split: mode == AddressMode::Split,
        });
        Ok(())
    }

    /// Start over from a fresh identity and an empty sync status.
    #[instrument(skip(self), fields(user_id = %self.user_id))]
    pub(crate) async fn handle_refresh(&mut self) -> Result<()> {
        let (user, addresses, keys) = fetch_identity(self.api.as_ref(), self.crypto.as_ref()).await?;
        self.identity.write().apply_refresh(user, addresses, keys);

        self.cancel_sync().await;
        self.remove_connectors_from_server(true).await?;
        self.sync_state.clear().await?;
        self.add_connectors_to_server().await?;
        self.start_syncing();

        info!("Account refreshed");
        self.emit(AccountEvent::Refreshed {
            user_id: self.user_id.clone(),
        });
        Ok(())
    }

    async fn handle_remote_event(&mut self, event: RemoteEvent) -> Result<()> {
        debug!(event_id = %event.event_id, syncing = self.is_syncing, "Handling remote event");

        if event.refresh {
            self.handle_refresh().await?;
            self.last_handled_event_id = event.event_id;
            return Ok(());
        }

        let syncing = self.is_syncing;
        let event_id = event.event_id;

        if let Some(user) = event.user {
            self.identity.write().on_user_event(user);
        }
        if !event.addresses.is_empty() {
            self.handle_address_events(event.addresses).await?;
        }
        if !event.labels.is_empty() {
            self.handle_label_events(event.labels).await?;
        }
        if !event.messages.is_empty() {
            self.handle_message_events(event.messages, syncing).await?;
        }

        if !syncing {
            self.last_handled_event_id = event_id;
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Connectors
    // ------------------------------------------------------------------------

    pub(crate) fn connector_context(&self) -> ConnectorContext {
        ConnectorContext {
            api: self.api.clone(),
            builder: self.builder.clone(),
            identity: self.identity.clone(),
            labels: self.labels.clone(),
            telemetry: self.telemetry.clone(),
            sync_state: self.sync_state.clone(),
            address_mode: self.address_mode,
        }
    }

    pub(crate) fn new_connector(&self, address_id: &str) -> Arc<Connector> {
        Arc::new(Connector::new(
            address_id,
            self.connector_context(),
            self.show_all_mail,
        ))
    }

    /// One connector for the primary address, or one per enabled address.
    pub(crate) fn build_connectors(&self) -> Result<ConnectorSet> {
        let address_ids: Vec<String> = {
            let identity = self.identity.read();
            match self.address_mode {
                AddressMode::Combined => {
                    let primary = identity.primary_address().ok_or_else(|| {
                        ServiceError::ConnectorState("account has no primary address".into())
                    })?;
                    vec![primary.id.clone()]
                }
                AddressMode::Split => identity
                    .addresses()
                    .iter()
                    .filter(|address| address.is_enabled())
                    .map(|address| address.id.clone())
                    .collect(),
            }
        };

        let mut connectors = ConnectorSet::new();
        for address_id in &address_ids {
            connectors.insert(self.new_connector(address_id));
        }
        Ok(connectors)
    }

    /// Register every connector; on failure undo the registrations so far.
    pub(crate) async fn add_connectors_to_server(&self) -> Result<()> {
        let mut added: Vec<String> = Vec::new();

        for connector in self.connectors.iter() {
            let address_id = connector.address_id().to_string();
            if let Err(err) = self
                .registry
                .add_connector(connector.clone(), self.sync_state.clone())
                .await
            {
                error!(%address_id, error = %err, "Failed to add connector to server");
                for address_id in &added {
                    if let Err(err) = self.registry.remove_connector(address_id, false).await {
                        error!(%address_id, error = %err, "Failed to remove connector from server");
                    }
                }
                return Err(err.into());
            }
            added.push(address_id);
        }
        Ok(())
    }

    pub(crate) async fn remove_connectors_from_server(&self, delete_data: bool) -> Result<()> {
        for connector in self.connectors.iter() {
            self.registry
                .remove_connector(connector.address_id(), delete_data)
                .await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Sync
    // ------------------------------------------------------------------------

    pub(crate) fn start_syncing(&mut self) {
        self.is_syncing = true;
        self.sync.execute(
            self.reporter.clone(),
            self.labels.snapshot(),
            Arc::new(self.applier.clone()),
            self.builder.clone(),
            self.retry_cooldown,
        );
    }

    pub(crate) async fn cancel_sync(&mut self) {
        self.sync.cancel_and_wait().await;
        self.is_syncing = false;
    }

    pub(crate) fn emit(&self, event: AccountEvent) {
        self.events.emit(CoreEvent::Account(event)).ok();
    }
}

#[cfg(test)]
mod tests;
