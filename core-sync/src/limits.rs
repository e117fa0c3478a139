//! Memory budget of the bulk sync pipeline.
//!
//! The download and build stages each hold up to their budget of message
//! data at once, and the pipeline keeps roughly four batches of each in
//! flight, so the effective peak is about `4 × (download + build)`.

use tracing::{debug, warn};

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;
pub const GIB: u64 = 1024 * MIB;

const MAX_DOWNLOAD_REQUEST_MEM: u64 = 128 * MIB;
const MIN_DOWNLOAD_REQUEST_MEM: u64 = 40 * MIB;
const MAX_MESSAGE_BUILD_MEM: u64 = 128 * MIB;
const MIN_MESSAGE_BUILD_MEM: u64 = 64 * MIB;
const MAX_PARALLEL_DOWNLOADS: usize = 32;
const MIN_SYNC_MEMORY: u64 = 800 * MIB;
const BASELINE_SYNC_MEMORY: u64 = 2 * GIB;

fn to_mb(bytes: u64) -> u64 {
    bytes / MIB
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncLimits {
    pub max_download_request_mem: u64,
    pub min_download_request_mem: u64,
    pub max_message_build_mem: u64,
    pub min_message_build_mem: u64,
    pub max_sync_memory: u64,
    pub max_parallel_downloads: usize,
    /// Expected bytes of messages requested per download batch.
    pub download_request_mem: u64,
    /// Bytes of message data handed to one build batch.
    pub message_build_mem: u64,
}

impl SyncLimits {
    pub fn new(max_sync_memory: u64, total_system_memory: u64, force_minimum: bool) -> Self {
        let mut limits = Self {
            max_download_request_mem: MAX_DOWNLOAD_REQUEST_MEM,
            min_download_request_mem: MIN_DOWNLOAD_REQUEST_MEM,
            max_message_build_mem: MAX_MESSAGE_BUILD_MEM,
            min_message_build_mem: MIN_MESSAGE_BUILD_MEM,
            max_sync_memory,
            max_parallel_downloads: MAX_PARALLEL_DOWNLOADS,
            download_request_mem: 0,
            message_build_mem: 0,
        };

        if force_minimum {
            warn!("Sync specs forced to minimum");
            limits.max_download_request_mem = 50 * MIB;
            limits.max_message_build_mem = 80 * MIB;
            limits.max_parallel_downloads = 2;
            limits.max_sync_memory = MIN_SYNC_MEMORY;
        }

        let half = total_system_memory / 2;
        if limits.max_sync_memory >= half {
            warn!(
                requested_mb = to_mb(limits.max_sync_memory),
                half_system_mb = to_mb(half),
                "Requested sync memory exceeds half of system memory, clamping"
            );
            limits.max_sync_memory = half;
        }

        if limits.max_sync_memory < MIN_SYNC_MEMORY {
            warn!(
                requested_mb = to_mb(limits.max_sync_memory),
                "Requested sync memory is below the 800 MB minimum, raising"
            );
            limits.max_sync_memory = MIN_SYNC_MEMORY;
        }

        match limits.max_sync_memory.cmp(&BASELINE_SYNC_MEMORY) {
            std::cmp::Ordering::Less => {
                limits.download_request_mem = limits.min_download_request_mem;
                limits.message_build_mem = limits.min_message_build_mem;
            }
            std::cmp::Ordering::Equal => {
                limits.download_request_mem = limits.max_download_request_mem;
                limits.message_build_mem = limits.max_message_build_mem;
            }
            std::cmp::Ordering::Greater => {
                let extra = (limits.max_sync_memory - BASELINE_SYNC_MEMORY) / 8;
                limits.download_request_mem = limits.max_download_request_mem + extra;
                limits.message_build_mem = limits.max_message_build_mem + extra;
            }
        }

        debug!(
            total_system_mb = to_mb(total_system_memory),
            download_mb = to_mb(limits.download_request_mem),
            build_mb = to_mb(limits.message_build_mem),
            predicted_peak_mb = to_mb(4 * (limits.download_request_mem + limits.message_build_mem)),
            "Computed sync limits"
        );

        limits
    }
}
