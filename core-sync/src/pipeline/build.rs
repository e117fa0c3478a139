use std::collections::HashMap;
use std::sync::Arc;

use bridge_traits::telemetry::report_context;
use bridge_traits::{FullMessage, KeyRing};
use futures::stream::{self, StreamExt};
use tokio::sync::mpsc;
use tracing::{error, instrument, warn};

use super::{ApplyRequest, BatchMarker, BuildRequest, MessageBuilder, SyncJob};
use crate::error::{Result, SyncError};
use crate::labels::LabelMap;
use crate::message::{failed_message_created, BuildResult};

const NO_KEYRING_REPORT: &str = "Failed to build message - no unlocked keyring (sync)";
const BUILD_FAILED_REPORT: &str = "Failed to build message (sync)";

/// Memory needed to build `message`: attachments count twice for the
/// decrypted copy.
fn build_cost(message: &FullMessage) -> u64 {
    let attachments: u64 = message.message.attachments.iter().map(|a| a.size).sum();
    attachments * 2 + message.message.body.len() as u64
}

/// Split a download batch into chunks whose build cost stays below
/// `max_memory`. A single oversized message gets a chunk of its own.
pub fn chunk_build_batch(batch: Vec<FullMessage>, max_memory: u64) -> Vec<Vec<FullMessage>> {
    let mut chunks = Vec::new();
    let mut current = Vec::new();
    let mut expected = 0u64;

    for message in batch {
        let cost = build_cost(&message);
        if expected + cost >= max_memory && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
            expected = 0;
        }
        expected += cost;
        current.push(message);
    }

    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Split `marker` across `chunks`: each chunk but the last ends at its own
/// last message, the last one keeps the original marker and the remainder of
/// the count.
fn divide_marker(marker: &BatchMarker, chunks: &[Vec<FullMessage>]) -> Vec<BatchMarker> {
    let mut markers = Vec::with_capacity(chunks.len());
    let mut assigned = 0i64;

    for chunk in chunks.iter().take(chunks.len().saturating_sub(1)) {
        let count = chunk.len() as i64;
        assigned += count;
        markers.push(BatchMarker {
            last_message_id: chunk.last().map(|m| m.id().to_string()).unwrap_or_default(),
            count,
        });
    }

    markers.push(BatchMarker {
        last_message_id: marker.last_message_id.clone(),
        count: (marker.count - assigned).max(0),
    });
    markers
}

enum Built {
    Ok(BuildResult),
    Failed { result: BuildResult, error: String, no_keyring: bool },
}

fn build_one(
    builder: &dyn MessageBuilder,
    labels: &LabelMap,
    keys: &HashMap<String, KeyRing>,
    message: &FullMessage,
) -> Built {
    let metadata = message.metadata();
    let failed = |error: String, no_keyring: bool| Built::Failed {
        result: BuildResult {
            address_id: metadata.address_id.clone(),
            message_id: metadata.id.clone(),
            update: failed_message_created(labels, metadata, &error),
        },
        error,
        no_keyring,
    };

    let Some(key) = keys.get(&metadata.address_id) else {
        return failed(
            format!("address {} has no unlocked keyring", metadata.address_id),
            true,
        );
    };

    match builder.build_message(labels, message, key) {
        Ok(result) => Built::Ok(result),
        Err(err) => failed(err.to_string(), false),
    }
}

async fn build_chunk(
    job: &SyncJob,
    keys: &Arc<HashMap<String, KeyRing>>,
    chunk: Vec<FullMessage>,
) -> Result<Vec<BuildResult>> {
    let parallel = std::thread::available_parallelism().map_or(1, |n| n.get());

    let built: Vec<Built> = stream::iter(chunk)
        .map(|message| {
            let builder = job.builder.clone();
            let labels = job.labels.clone();
            let keys = keys.clone();
            tokio::task::spawn_blocking(move || build_one(builder.as_ref(), &labels, &keys, &message))
        })
        .buffered(parallel)
        .collect::<Vec<_>>()
        .await
        .into_iter()
        .collect::<std::result::Result<_, _>>()
        .map_err(|err| SyncError::Task(format!("message build task failed: {err}")))?;

    let mut results = Vec::with_capacity(built.len());
    let mut succeeded = Vec::new();
    let mut failed = Vec::new();

    for outcome in built {
        match outcome {
            Built::Ok(result) => {
                succeeded.push(result.message_id.clone());
                results.push(result);
            }
            Built::Failed { result, error: err, no_keyring } => {
                error!(message_id = %result.message_id, error = %err, "Failed to build message (sync)");
                let report = if no_keyring { NO_KEYRING_REPORT } else { BUILD_FAILED_REPORT };
                let mut context = report_context([
                    ("messageID", result.message_id.as_str()),
                    ("userID", job.user_id.as_str()),
                ]);
                if !no_keyring {
                    context.insert("error".into(), err.into());
                }
                if let Err(report_err) = job.telemetry.report_message(report, context) {
                    warn!(error = %report_err, "Failed to report message build error");
                }

                failed.push(result.message_id.clone());
                results.push(result);
            }
        }
    }

    if !failed.is_empty() {
        if let Err(err) = job.state.add_failed_message_ids(&failed).await {
            error!(error = %err, "Failed to record failed message ids");
        }
    }
    if !succeeded.is_empty() {
        if let Err(err) = job.state.remove_failed_message_ids(&succeeded).await {
            error!(error = %err, "Failed to clear failed message ids");
        }
    }

    Ok(results)
}

#[instrument(skip_all, fields(sync_stage = "build", user_id = %job.user_id))]
pub(crate) async fn run(
    job: Arc<SyncJob>,
    mut input: mpsc::Receiver<BuildRequest>,
    output: mpsc::Sender<ApplyRequest>,
) -> Result<()> {
    while let Some(request) = job.next(&mut input).await? {
        // A mass delete elsewhere can empty a whole download batch.
        if request.messages.is_empty() {
            job.reporter.on_progress(request.marker.count);
            job.forward(
                &output,
                ApplyRequest {
                    marker: request.marker,
                    results: Vec::new(),
                },
            )
            .await?;
            continue;
        }

        let keys = Arc::new(job.builder.key_rings());
        let chunks = chunk_build_batch(request.messages, job.limits.message_build_mem);
        let markers = divide_marker(&request.marker, &chunks);

        for (chunk, marker) in chunks.into_iter().zip(markers) {
            let results = job.cancellable(build_chunk(&job, &keys, chunk)).await??;
            job.reporter.on_progress(marker.count);
            job.forward(&output, ApplyRequest { marker, results }).await?;
        }
    }

    Ok(())
}
