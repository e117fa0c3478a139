//! System Resource Probes

/// Reports physical memory of the host.
///
/// Used to clamp the bulk sync memory budget.
pub trait SystemMemory: Send + Sync {
    /// Total physical memory in bytes.
    fn total_memory(&self) -> u64;
}

/// Fixed memory size, for tests and hosts that cannot probe.
#[derive(Debug, Clone, Copy)]
pub struct FixedSystemMemory(pub u64);

impl SystemMemory for FixedSystemMemory {
    fn total_memory(&self) -> u64 {
        self.0
    }
}
