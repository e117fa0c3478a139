//! # Desktop Bridge Implementations
//!
//! Default implementations of bridge traits for desktop platforms
//! (macOS, Windows, Linux).
//!
//! ## Overview
//!
//! - `NetworkMonitor` using a TCP reachability probe of the API host
//! - `SystemMemory` using `/proc/meminfo`, with a fixed fallback elsewhere
//!
//! ## Usage
//!
//! ```ignore
//! use bridge_desktop::{DesktopNetworkMonitor, DesktopSystemMemory};
//! use std::sync::Arc;
//!
//! let config = BridgeConfig::builder()
//!     .sync_config_dir(dir)
//!     .system_memory(Arc::new(DesktopSystemMemory::new()))
//!     .network_monitor(Arc::new(DesktopNetworkMonitor::new("mail-api.example:443")))
//!     .build()?;
//! ```

mod network;
mod system;

pub use network::DesktopNetworkMonitor;
pub use system::DesktopSystemMemory;
