use std::sync::Arc;

use bridge_traits::{FullMessage, RemoteMessage};
use bytes::Bytes;
use futures::stream::{self, StreamExt, TryStreamExt};
use tokio::sync::mpsc;
use tracing::{debug, instrument};

use super::{BuildRequest, DownloadRequest, SyncJob};
use crate::error::{Result, SyncError};

/// Fetch the messages of `ids`, dropping those deleted in the meantime.
async fn download_messages(job: &SyncJob, ids: &[String], parallel: usize) -> Result<Vec<RemoteMessage>> {
    let fetched: Vec<Option<RemoteMessage>> = stream::iter(ids.to_vec())
        .map(|id| {
            let api = job.api.clone();
            async move {
                match api.get_message(&id).await {
                    Ok(message) => Ok(Some(message)),
                    Err(err) if err.is_not_found() => {
                        debug!(message_id = %id, "Message disappeared before download");
                        Ok(None)
                    }
                    Err(err) => Err(SyncError::from(err)),
                }
            }
        })
        .buffered(parallel)
        .try_collect()
        .await?;

    Ok(fetched.into_iter().flatten().collect())
}

/// Fetch the attachment bytes of every message, in attachment order.
async fn download_attachments(
    job: &SyncJob,
    messages: Vec<RemoteMessage>,
    parallel: usize,
) -> Result<Vec<FullMessage>> {
    let attachment_ids: Vec<(usize, String)> = messages
        .iter()
        .enumerate()
        .flat_map(|(idx, msg)| msg.attachments.iter().map(move |att| (idx, att.id.clone())))
        .collect();

    let data: Vec<(usize, Bytes)> = stream::iter(attachment_ids)
        .map(|(idx, id)| {
            let api = job.api.clone();
            async move {
                let bytes = api.get_attachment(&id).await?;
                Ok::<_, SyncError>((idx, bytes))
            }
        })
        .buffered(parallel)
        .try_collect()
        .await?;

    let mut full: Vec<FullMessage> = messages
        .into_iter()
        .map(|message| FullMessage {
            attachment_data: Vec::with_capacity(message.attachments.len()),
            message,
        })
        .collect();

    // `buffered` keeps input order, so attachments land in their original slots.
    for (idx, bytes) in data {
        full[idx].attachment_data.push(bytes);
    }

    Ok(full)
}

#[instrument(skip_all, fields(sync_stage = "download", user_id = %job.user_id))]
pub(crate) async fn run(
    job: Arc<SyncJob>,
    mut input: mpsc::Receiver<DownloadRequest>,
    output: mpsc::Sender<BuildRequest>,
) -> Result<()> {
    let parallel = job.limits.max_parallel_downloads.max(1) * 2;

    while let Some(request) = job.next(&mut input).await? {
        let messages = job
            .cancellable(download_messages(&job, &request.ids, parallel))
            .await??;
        let messages = job
            .cancellable(download_attachments(&job, messages, parallel))
            .await??;

        debug!(
            requested = request.ids.len(),
            downloaded = messages.len(),
            "Download batch finished"
        );
        job.reporter.on_progress(request.marker.count);

        job.forward(
            &output,
            BuildRequest {
                marker: request.marker,
                messages,
            },
        )
        .await?;
    }

    Ok(())
}
