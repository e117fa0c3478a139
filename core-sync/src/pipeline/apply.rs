use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, instrument};

use super::{ApplyRequest, SyncJob};
use crate::error::Result;

#[instrument(skip_all, fields(sync_stage = "apply", user_id = %job.user_id))]
pub(crate) async fn run(job: Arc<SyncJob>, mut input: mpsc::Receiver<ApplyRequest>) -> Result<()> {
    while let Some(request) = job.next(&mut input).await? {
        let count = request.results.len();

        if count > 0 {
            job.cancellable(job.applier.apply_sync_updates(request.results))
                .await??;
        }
        job.reporter.on_progress(request.marker.count);

        if let Err(err) = job
            .state
            .set_last_message_id(&request.marker.last_message_id, request.marker.count)
            .await
        {
            error!(error = %err, "Failed to store last synced message id");
            return Err(err);
        }
        job.reporter.on_progress(request.marker.count);

        debug!(
            applied = count,
            last_message_id = %request.marker.last_message_id,
            "Sync batch applied"
        );
    }

    Ok(())
}
