//! Connectivity Monitoring Abstraction
//!
//! Tells the account actor whether the remote mail service is reachable so
//! it can pause bulk sync while offline and resume it once back online.

use chrono::{DateTime, Utc};

use crate::error::Result;

/// Connectivity to the remote service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkStatus {
    /// Service reachable
    Connected,
    /// Service unreachable
    Disconnected,
    /// Not probed yet, or the probe was inconclusive
    Indeterminate,
}

/// Result of one connectivity probe
#[derive(Debug, Clone)]
pub struct NetworkInfo {
    pub status: NetworkStatus,
    pub checked_at: DateTime<Utc>,
}

impl NetworkInfo {
    pub fn new(status: NetworkStatus) -> Self {
        Self {
            status,
            checked_at: Utc::now(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.status == NetworkStatus::Connected
    }
}

/// Network monitor trait
///
/// # Platform Support
///
/// - **Desktop**: periodic TCP reachability probe of the API host
///   (`bridge_desktop::DesktopNetworkMonitor`)
#[async_trait::async_trait]
pub trait NetworkMonitor: Send + Sync {
    /// Probe connectivity now
    async fn get_network_info(&self) -> Result<NetworkInfo>;

    /// Check if the service is currently reachable
    async fn is_connected(&self) -> bool {
        matches!(self.get_network_info().await, Ok(info) if info.is_connected())
    }

    /// Subscribe to connectivity changes
    ///
    /// Implementations emit an update only when the status changes.
    async fn subscribe_changes(&self) -> Result<Box<dyn NetworkChangeStream>>;
}

/// Stream of connectivity changes
#[async_trait::async_trait]
pub trait NetworkChangeStream: Send {
    /// Next status change, `None` when the stream is closed.
    async fn next(&mut self) -> Option<NetworkInfo>;
}
