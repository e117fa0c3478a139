//! # Sync Handler
//!
//! Owns the bulk sync of one account: at most one sync attempt loop runs at
//! a time, retrying after a cooldown until it succeeds or is cancelled.
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use core_sync::handler::SyncHandler;
//! # use core_sync::{labels::LabelMap, pipeline::{UpdateApplier, MessageBuilder, ProgressReporter}};
//!
//! # async fn example(
//! #     handler: SyncHandler,
//! #     reporter: Arc<dyn ProgressReporter>,
//! #     applier: Arc<dyn UpdateApplier>,
//! #     builder: Arc<dyn MessageBuilder>,
//! # ) {
//! let mut finished = handler.take_sync_finished().expect("receiver taken once");
//! handler.execute(reporter, LabelMap::new(), applier, builder, std::time::Duration::from_secs(20));
//!
//! if let Some(result) = finished.recv().await {
//!     println!("sync done: {:?}", result.is_ok());
//! }
//! # }
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use bridge_traits::{label_ids, RemoteApi, Telemetry};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn, Instrument};
use uuid::Uuid;

use crate::error::{Result, SyncError};
use crate::labels::LabelMap;
use crate::limits::SyncLimits;
use crate::pipeline::{MessageBuilder, ProgressReporter, SyncJob, UpdateApplier, NUM_SYNC_STAGES};
use crate::status::SyncStateProvider;

/// Result of one finished sync attempt loop.
pub type SyncFinished = Result<()>;

struct ActiveSync {
    sync_id: Uuid,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Clone)]
struct SyncContext {
    user_id: String,
    api: Arc<dyn RemoteApi>,
    state: Arc<dyn SyncStateProvider>,
    telemetry: Arc<dyn Telemetry>,
    limits: SyncLimits,
}

pub struct SyncHandler {
    ctx: SyncContext,
    root: CancellationToken,
    active: Mutex<Option<ActiveSync>>,
    finished_tx: Mutex<Option<mpsc::Sender<SyncFinished>>>,
    finished_rx: Mutex<Option<mpsc::Receiver<SyncFinished>>>,
}

impl SyncHandler {
    pub fn new(
        user_id: impl Into<String>,
        api: Arc<dyn RemoteApi>,
        state: Arc<dyn SyncStateProvider>,
        telemetry: Arc<dyn Telemetry>,
        limits: SyncLimits,
    ) -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            ctx: SyncContext {
                user_id: user_id.into(),
                api,
                state,
                telemetry,
                limits,
            },
            root: CancellationToken::new(),
            active: Mutex::new(None),
            finished_tx: Mutex::new(Some(tx)),
            finished_rx: Mutex::new(Some(rx)),
        }
    }

    /// Receiver of sync attempt results. Available once.
    pub fn take_sync_finished(&self) -> Option<mpsc::Receiver<SyncFinished>> {
        self.finished_rx.lock().take()
    }

    pub fn is_running(&self) -> bool {
        self.active
            .lock()
            .as_ref()
            .is_some_and(|active| !active.handle.is_finished())
    }

    /// Start the sync attempt loop unless one is already running.
    pub fn execute(
        &self,
        reporter: Arc<dyn ProgressReporter>,
        labels: LabelMap,
        applier: Arc<dyn UpdateApplier>,
        builder: Arc<dyn MessageBuilder>,
        cooldown: Duration,
    ) {
        let mut active = self.active.lock();
        if active.as_ref().is_some_and(|a| !a.handle.is_finished()) {
            info!(user_id = %self.ctx.user_id, "Sync already running");
            return;
        }

        let Some(finished_tx) = self.finished_tx.lock().clone() else {
            warn!(user_id = %self.ctx.user_id, "Sync handler is closed");
            return;
        };

        let sync_id = Uuid::new_v4();
        let token = self.root.child_token();
        let attempt = SyncAttempt {
            ctx: self.ctx.clone(),
            labels: Arc::new(labels),
            reporter,
            applier,
            builder,
            cooldown,
            token: token.clone(),
        };

        info!(user_id = %self.ctx.user_id, %sync_id, "Sync triggered");
        let span = tracing::info_span!("sync", user_id = %self.ctx.user_id, %sync_id);
        let handle = tokio::spawn(
            async move {
                let result = attempt.run_until_done().await;
                tokio::select! {
                    _ = attempt.token.cancelled() => {}
                    _ = finished_tx.send(result) => {}
                }
            }
            .instrument(span),
        );

        *active = Some(ActiveSync {
            sync_id,
            token,
            handle,
        });
    }

    /// Cancel the running sync attempt loop, if any.
    pub fn cancel(&self) {
        if let Some(active) = self.active.lock().as_ref() {
            info!(sync_id = %active.sync_id, "Cancelling sync");
            active.token.cancel();
        }
    }

    /// Cancel and wait until the running loop has exited.
    pub async fn cancel_and_wait(&self) {
        let active = self.active.lock().take();
        if let Some(active) = active {
            active.token.cancel();
            if let Err(err) = active.handle.await {
                error!(sync_id = %active.sync_id, error = %err, "Sync task panicked");
            }
        }
    }

    /// Stop everything and close the finished channel.
    pub async fn close(&self) {
        self.root.cancel();
        self.cancel_and_wait().await;
        self.finished_tx.lock().take();
    }
}

impl std::fmt::Debug for SyncHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncHandler")
            .field("user_id", &self.ctx.user_id)
            .field("running", &self.is_running())
            .finish()
    }
}

struct SyncAttempt {
    ctx: SyncContext,
    labels: Arc<LabelMap>,
    reporter: Arc<dyn ProgressReporter>,
    applier: Arc<dyn UpdateApplier>,
    builder: Arc<dyn MessageBuilder>,
    cooldown: Duration,
    token: CancellationToken,
}

impl SyncAttempt {
    async fn run_until_done(&self) -> SyncFinished {
        let start = Instant::now();
        info!("Beginning user sync");
        self.reporter.on_start();

        let result = loop {
            if self.token.is_cancelled() {
                break Err(SyncError::Cancelled);
            }

            // Applier replies stop while the account waits for a cancelled sync.
            let attempt = tokio::select! {
                _ = self.token.cancelled() => Err(SyncError::Cancelled),
                result = self.run() => result,
            };

            match attempt {
                Ok(()) => break Ok(()),
                Err(err) if err.is_cancelled() => break Err(err),
                Err(err) => {
                    error!(error = %err, "Failed to sync, will retry later");
                    tokio::select! {
                        _ = self.token.cancelled() => {}
                        _ = tokio::time::sleep(self.cooldown) => {}
                    }
                }
            }
        };

        match &result {
            Ok(()) => self.reporter.on_finished(),
            Err(err) => self.reporter.on_error(err),
        }
        info!(duration_ms = start.elapsed().as_millis() as u64, "Finished user sync");

        result
    }

    async fn total_message_count(&self) -> Result<i64> {
        let counts = self.ctx.api.get_grouped_message_count().await?;
        Ok(counts
            .iter()
            .find(|count| count.label_id == label_ids::ALL_MAIL)
            .map_or(0, |count| count.total as i64))
    }

    #[instrument(skip(self))]
    async fn run(&self) -> Result<()> {
        let mut status = self.ctx.state.status().await?;

        if status.is_complete() {
            info!("Sync already complete, updating labels");
            return self.applier.sync_labels(&self.labels).await;
        }

        if !status.has_labels {
            info!("Syncing labels");
            self.applier.sync_labels(&self.labels).await?;
            self.ctx.state.set_has_labels(true).await?;
            info!("Synced labels");
        }

        if !status.has_message_count {
            let total = self.total_message_count().await?;
            self.ctx.state.set_message_count(total).await?;
            status.total_message_count = total;
        }

        self.reporter.initialize_progress_counter(
            status.num_synced_messages * NUM_SYNC_STAGES,
            status.total_message_count * NUM_SYNC_STAGES,
        );

        if status.has_messages {
            info!("Messages are already synced, skipping");
            return Ok(());
        }

        info!("Syncing messages");
        let job = Arc::new(SyncJob::new(
            self.ctx.user_id.clone(),
            self.ctx.api.clone(),
            self.labels.clone(),
            self.builder.clone(),
            self.applier.clone(),
            self.reporter.clone(),
            self.ctx.state.clone(),
            self.ctx.telemetry.clone(),
            self.ctx.limits,
            self.token.child_token(),
        ));
        job.run().await?;

        self.ctx.state.set_has_messages(true).await?;
        info!("Synced messages");

        Ok(())
    }
}
