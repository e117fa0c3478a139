//! # Bulk Sync Pipeline
//!
//! Downloads, decrypts and imports every message of an account into the
//! local store.
//!
//! ## Stages
//!
//! ```text
//! metadata ──► download ──► build ──► apply
//! ```
//!
//! - **metadata** pages through message metadata (newest first) and cuts it
//!   into download batches bounded by expected bytes and message count
//! - **download** fetches full messages and attachment data in parallel
//! - **build** re-batches by build memory and assembles RFC 822 literals on
//!   blocking worker threads
//! - **apply** hands each batch to the [`UpdateApplier`], then records the
//!   batch's last message id so an interrupted sync resumes after it
//!
//! Stages run as separate tasks linked by bounded channels holding a single
//! batch, so a slow stage stalls the ones before it. All stages share one
//! [`CancellationToken`]; the first stage error cancels it and becomes the
//! result of the run.

mod apply;
mod build;
mod download;
mod metadata;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use bridge_traits::{BridgeError, FullMessage, KeyRing, RemoteApi, Telemetry};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{Result, SyncError};
use crate::labels::LabelMap;
use crate::limits::SyncLimits;
use crate::message::BuildResult;
use crate::status::SyncStateProvider;

pub use build::chunk_build_batch;

/// Number of progress steps each message goes through.
pub const NUM_SYNC_STAGES: i64 = 4;
pub const METADATA_PAGE_SIZE: usize = 150;
pub const METADATA_MAX_MESSAGES: usize = 250;

/// Sink for everything the pipeline produces.
#[async_trait]
pub trait UpdateApplier: Send + Sync {
    /// Create the mailboxes of `labels` on every connector and wait until
    /// they are applied.
    async fn sync_labels(&self, labels: &LabelMap) -> Result<()>;

    /// Publish built messages and wait until they are applied.
    async fn apply_sync_updates(&self, updates: Vec<BuildResult>) -> Result<()>;
}

/// Turns downloaded messages into local-store literals.
///
/// `build_message` is CPU-bound and called from blocking worker threads.
pub trait MessageBuilder: Send + Sync {
    /// Unlocked keyrings by address id.
    fn key_rings(&self) -> HashMap<String, KeyRing>;

    fn build_message(
        &self,
        labels: &LabelMap,
        message: &FullMessage,
        key: &KeyRing,
    ) -> std::result::Result<BuildResult, BridgeError>;
}

/// Receives sync lifecycle and progress notifications.
pub trait ProgressReporter: Send + Sync {
    fn on_start(&self);

    fn on_finished(&self);

    fn on_error(&self, error: &SyncError);

    /// `delta` progress steps were completed.
    fn on_progress(&self, delta: i64);

    fn initialize_progress_counter(&self, current: i64, total: i64);
}

/// Progress marker travelling with each batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BatchMarker {
    /// Last message of the batch in paging order
    pub last_message_id: String,
    pub count: i64,
}

pub(crate) struct DownloadRequest {
    pub marker: BatchMarker,
    pub ids: Vec<String>,
}

pub(crate) struct BuildRequest {
    pub marker: BatchMarker,
    pub messages: Vec<FullMessage>,
}

pub(crate) struct ApplyRequest {
    pub marker: BatchMarker,
    pub results: Vec<BuildResult>,
}

/// Everything one message sync run needs.
pub struct SyncJob {
    pub(crate) user_id: String,
    pub(crate) api: Arc<dyn RemoteApi>,
    pub(crate) labels: Arc<LabelMap>,
    pub(crate) builder: Arc<dyn MessageBuilder>,
    pub(crate) applier: Arc<dyn UpdateApplier>,
    pub(crate) reporter: Arc<dyn ProgressReporter>,
    pub(crate) state: Arc<dyn SyncStateProvider>,
    pub(crate) telemetry: Arc<dyn Telemetry>,
    pub(crate) limits: SyncLimits,
    pub(crate) token: CancellationToken,
}

impl SyncJob {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        user_id: impl Into<String>,
        api: Arc<dyn RemoteApi>,
        labels: Arc<LabelMap>,
        builder: Arc<dyn MessageBuilder>,
        applier: Arc<dyn UpdateApplier>,
        reporter: Arc<dyn ProgressReporter>,
        state: Arc<dyn SyncStateProvider>,
        telemetry: Arc<dyn Telemetry>,
        limits: SyncLimits,
        token: CancellationToken,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            api,
            labels,
            builder,
            applier,
            reporter,
            state,
            telemetry,
            limits,
            token,
        }
    }

    /// Run `fut` unless the job is cancelled first.
    pub(crate) async fn cancellable<T>(&self, fut: impl Future<Output = T>) -> Result<T> {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(SyncError::Cancelled),
            out = fut => Ok(out),
        }
    }

    /// Pass `item` to the next stage, waiting while it is busy.
    ///
    /// A stage only drops its input after failing, in which case its own
    /// error is the one reported, so a closed channel counts as cancellation.
    pub(crate) async fn forward<T>(&self, tx: &mpsc::Sender<T>, item: T) -> Result<()> {
        self.cancellable(tx.send(item))
            .await?
            .map_err(|_| SyncError::Cancelled)
    }

    /// Next item from the previous stage; `None` once it is done.
    pub(crate) async fn next<T>(&self, rx: &mut mpsc::Receiver<T>) -> Result<Option<T>> {
        self.cancellable(rx.recv()).await
    }

    /// Download and import every message not synced yet.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        info!(user_id = %self.user_id, "Starting message sync");

        let (download_tx, download_rx) = mpsc::channel(1);
        let (build_tx, build_rx) = mpsc::channel(1);
        let (apply_tx, apply_rx) = mpsc::channel(1);

        let stages = [
            ("metadata", spawn_stage(self.clone(), metadata::run(self.clone(), download_tx))),
            ("download", spawn_stage(self.clone(), download::run(self.clone(), download_rx, build_tx))),
            ("build", spawn_stage(self.clone(), build::run(self.clone(), build_rx, apply_tx))),
            ("apply", spawn_stage(self.clone(), apply::run(self.clone(), apply_rx))),
        ];

        let mut first_error: Option<SyncError> = None;
        for (name, handle) in stages {
            let result = handle
                .await
                .map_err(|err| SyncError::Task(format!("{name} stage panicked: {err}")))
                .and_then(|result| result);

            if let Err(err) = result {
                debug!(sync_stage = name, error = %err, "Sync stage stopped with error");
                match &first_error {
                    Some(existing) if !existing.is_cancelled() => {}
                    _ => first_error = Some(err),
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None if self.token.is_cancelled() => Err(SyncError::Cancelled),
            None => {
                info!(user_id = %self.user_id, "Message sync finished");
                Ok(())
            }
        }
    }
}

fn spawn_stage(
    job: Arc<SyncJob>,
    stage: impl Future<Output = Result<()>> + Send + 'static,
) -> tokio::task::JoinHandle<Result<()>> {
    tokio::spawn(async move {
        let result = stage.await;
        if result.is_err() {
            job.token.cancel();
        }
        result
    })
}

impl std::fmt::Debug for SyncJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncJob")
            .field("user_id", &self.user_id)
            .field("labels", &self.labels.len())
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}
