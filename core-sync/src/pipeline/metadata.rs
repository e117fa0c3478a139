use std::collections::BTreeSet;
use std::sync::Arc;

use bridge_traits::{MessageFilter, MessageMetadata};
use tokio::sync::mpsc;
use tracing::{debug, error, instrument};

use super::{BatchMarker, DownloadRequest, SyncJob, METADATA_MAX_MESSAGES, METADATA_PAGE_SIZE};
use crate::error::Result;

/// Pages through message metadata and cuts it into download batches.
pub(crate) struct MetadataIterator {
    last_message_id: String,
    failed: BTreeSet<String>,
    remaining: Vec<MessageMetadata>,
    pending: Vec<String>,
    expected_size: u64,
    page_size: usize,
    max_messages: usize,
    max_download_mem: u64,
}

impl MetadataIterator {
    pub(crate) fn new(
        last_message_id: String,
        failed: BTreeSet<String>,
        page_size: usize,
        max_messages: usize,
        max_download_mem: u64,
    ) -> Self {
        Self {
            last_message_id,
            failed,
            remaining: Vec::new(),
            pending: Vec::with_capacity(page_size),
            expected_size: 0,
            page_size,
            max_messages,
            max_download_mem,
        }
    }

    async fn fetch_page(&self, job: &SyncJob) -> Result<Vec<MessageMetadata>> {
        let filter = MessageFilter {
            end_id: (!self.last_message_id.is_empty()).then(|| self.last_message_id.clone()),
            desc: true,
            ..MessageFilter::default()
        };

        let mut page = job
            .cancellable(job.api.get_message_metadata_page(0, self.page_size, &filter))
            .await??;

        // Paging by end id returns the end id itself first.
        if page.first().is_some_and(|meta| meta.id == self.last_message_id) {
            page.remove(0);
        }

        Ok(page)
    }

    fn take_batch(&mut self) -> Option<DownloadRequest> {
        let last = self.pending.last()?.clone();
        let ids = std::mem::replace(&mut self.pending, Vec::with_capacity(self.page_size));
        self.expected_size = 0;

        Some(DownloadRequest {
            marker: BatchMarker {
                last_message_id: last,
                count: ids.len() as i64,
            },
            ids,
        })
    }

    /// The next download batch, or `None` when every message was listed.
    pub(crate) async fn next(&mut self, job: &SyncJob) -> Result<Option<DownloadRequest>> {
        loop {
            if self.remaining.is_empty() {
                let page = self.fetch_page(job).await.inspect_err(|err| {
                    error!(last_message_id = %self.last_message_id, error = %err, "Failed to fetch message metadata");
                })?;

                if let Some(last) = page.last() {
                    self.last_message_id = last.id.clone();
                }
                self.remaining = page;
            }

            if self.remaining.is_empty() {
                return Ok(self.take_batch());
            }

            let mut consumed = 0;
            for meta in &self.remaining {
                let next_size = self.expected_size + meta.size;
                let full = next_size >= self.max_download_mem || self.pending.len() >= self.max_messages;
                if full && !self.pending.is_empty() {
                    break;
                }

                consumed += 1;
                if self.failed.contains(&meta.id) {
                    debug!(message_id = %meta.id, "Skipping previously failed message");
                    continue;
                }
                self.pending.push(meta.id.clone());
                self.expected_size = next_size;
            }

            self.remaining.drain(..consumed);
            if !self.remaining.is_empty() {
                return Ok(self.take_batch());
            }
        }
    }
}

#[instrument(skip_all, fields(sync_stage = "metadata", user_id = %job.user_id))]
pub(crate) async fn run(job: Arc<SyncJob>, output: mpsc::Sender<DownloadRequest>) -> Result<()> {
    let status = job.state.status().await?;
    let mut iterator = MetadataIterator::new(
        status.last_synced_message_id,
        status.failed_message_ids,
        METADATA_PAGE_SIZE,
        METADATA_MAX_MESSAGES,
        job.limits.download_request_mem,
    );

    while let Some(request) = iterator.next(&job).await? {
        debug!(count = request.ids.len(), last_message_id = %request.marker.last_message_id, "Metadata batch ready");
        job.forward(&output, request).await?;
    }

    Ok(())
}
