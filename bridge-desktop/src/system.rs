//! System Memory Probe

use bridge_traits::system::SystemMemory;
use std::path::PathBuf;
use tracing::warn;

/// Used when the platform does not expose its memory size.
const FALLBACK_TOTAL_MEMORY: u64 = 8 * 1024 * 1024 * 1024;

/// Reads total physical memory from `/proc/meminfo`.
///
/// Hosts without procfs (macOS, Windows) get [`FALLBACK_TOTAL_MEMORY`]; the
/// bulk sync clamps its budget against this value only.
#[derive(Debug, Clone)]
pub struct DesktopSystemMemory {
    meminfo_path: PathBuf,
}

impl DesktopSystemMemory {
    pub fn new() -> Self {
        Self {
            meminfo_path: PathBuf::from("/proc/meminfo"),
        }
    }

    /// Read from a custom meminfo-formatted file.
    pub fn with_meminfo_path(path: impl Into<PathBuf>) -> Self {
        Self {
            meminfo_path: path.into(),
        }
    }
}

impl Default for DesktopSystemMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemMemory for DesktopSystemMemory {
    fn total_memory(&self) -> u64 {
        match std::fs::read_to_string(&self.meminfo_path)
            .ok()
            .and_then(|content| parse_mem_total(&content))
        {
            Some(total) => total,
            None => {
                warn!(
                    fallback = FALLBACK_TOTAL_MEMORY,
                    "Could not read total memory, using fallback"
                );
                FALLBACK_TOTAL_MEMORY
            }
        }
    }
}

/// Parse the `MemTotal:` line (in kB) into bytes.
fn parse_mem_total(content: &str) -> Option<u64> {
    content
        .lines()
        .find_map(|line| line.strip_prefix("MemTotal:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb * 1024)
}
