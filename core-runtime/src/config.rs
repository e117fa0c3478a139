//! # Bridge Configuration Module
//!
//! Configuration of one account's sync core.
//!
//! ## Overview
//!
//! The configuration system uses a builder pattern to construct a
//! [`BridgeConfig`] that holds the settings and injected capabilities the
//! account actor needs. Validation is fail-fast: `build()` refuses
//! inconsistent settings with an actionable message.
//!
//! ## Required Settings
//!
//! - `sync_config_dir` - Directory holding the per-user sync state files
//!
//! ## Optional Capabilities (with platform defaults)
//!
//! - `SystemMemory` - Physical memory probe (desktop default: `/proc/meminfo`)
//! - `NetworkMonitor` - Connectivity detection (required with network awareness)
//! - `Telemetry` - Vendor reports (default: dropped)
//!
//! ## Usage
//!
//! ```ignore
//! use core_runtime::config::{AddressMode, BridgeConfig, FeatureFlags};
//!
//! let config = BridgeConfig::builder()
//!     .sync_config_dir("/home/me/.config/bridge")
//!     .address_mode(AddressMode::Split)
//!     .features(FeatureFlags::default().with_env_overrides())
//!     .build()?;
//! ```

use crate::error::{Error, Result};
use crate::events::DEFAULT_EVENT_BUFFER_SIZE;
use bridge_traits::{NetworkMonitor, NoopTelemetry, SystemMemory, Telemetry};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Default bulk sync memory budget (2 GiB).
pub const DEFAULT_MAX_SYNC_MEMORY: u64 = 2 * 1024 * 1024 * 1024;

/// Cooldown between two failed bulk sync attempts.
pub const DEFAULT_RETRY_COOLDOWN: Duration = Duration::from_secs(20);

/// Environment variable forcing the minimum bulk sync resources.
pub const FORCE_MINIMUM_SPEC_ENV: &str = "BRIDGE_SYNC_FORCE_MINIMUM_SPEC";

/// How the account's addresses are exposed to mail clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AddressMode {
    /// One mailbox tree holding every address (only the primary is registered)
    #[default]
    Combined,
    /// One mailbox tree per address
    Split,
}

/// Account sync configuration.
///
/// Use [`BridgeConfigBuilder`] to construct instances.
#[derive(Clone)]
pub struct BridgeConfig {
    /// Directory holding `sync-<user id>` state files
    pub sync_config_dir: PathBuf,

    /// Upper bound for bulk sync memory, before clamping to system memory
    pub max_sync_memory: u64,

    /// Pause between failed bulk sync attempts
    pub retry_cooldown: Duration,

    /// Expose the "All Mail" mailbox to clients
    pub show_all_mail: bool,

    pub address_mode: AddressMode,

    /// Capacity of the lifecycle event bus
    pub event_buffer_size: usize,

    /// Physical memory probe
    pub system_memory: Arc<dyn SystemMemory>,

    /// Connectivity monitor (optional)
    pub network_monitor: Option<Arc<dyn NetworkMonitor>>,

    pub telemetry: Arc<dyn Telemetry>,

    pub features: FeatureFlags,
}

impl std::fmt::Debug for BridgeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeConfig")
            .field("sync_config_dir", &self.sync_config_dir)
            .field("max_sync_memory", &self.max_sync_memory)
            .field("retry_cooldown", &self.retry_cooldown)
            .field("show_all_mail", &self.show_all_mail)
            .field("address_mode", &self.address_mode)
            .field("event_buffer_size", &self.event_buffer_size)
            .field("system_memory", &"SystemMemory { ... }")
            .field(
                "network_monitor",
                &self
                    .network_monitor
                    .as_ref()
                    .map(|_| "NetworkMonitor { ... }"),
            )
            .field("telemetry", &"Telemetry { ... }")
            .field("features", &self.features)
            .finish()
    }
}

/// Feature flags toggling optional behaviour.
///
/// The conflict-resolver switches are kill switches for the remote feature
/// flag service; they default to the resolvers being active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FeatureFlags {
    /// Replace the label conflict resolver with a no-op
    pub disable_label_conflict_resolver: bool,

    /// Replace the placeholder ("Folders"/"Labels") conflict resolver with a no-op
    pub disable_internal_label_conflict_resolver: bool,

    /// Let the placeholder resolver delete a conflicting mailbox that still holds messages
    pub allow_non_empty_mailbox_deletion: bool,

    /// Force the minimum bulk sync resources regardless of system memory
    pub force_minimum_sync_spec: bool,

    /// Pause bulk sync while offline (requires NetworkMonitor)
    pub enable_network_awareness: bool,
}

impl FeatureFlags {
    /// Apply overrides from the process environment.
    pub fn with_env_overrides(mut self) -> Self {
        if std::env::var(FORCE_MINIMUM_SPEC_ENV).is_ok_and(|v| !v.is_empty()) {
            self.force_minimum_sync_spec = true;
        }
        self
    }
}

impl BridgeConfig {
    /// Creates a new builder for constructing a `BridgeConfig`.
    pub fn builder() -> BridgeConfigBuilder {
        BridgeConfigBuilder::default()
    }

    /// Path of the sync state file of `user_id`.
    pub fn sync_state_path(&self, user_id: &str) -> PathBuf {
        self.sync_config_dir.join(format!("sync-{user_id}"))
    }

    /// Validates the configuration and returns an error if invalid.
    pub fn validate(&self) -> Result<()> {
        if self.sync_config_dir.as_os_str().is_empty() {
            return Err(Error::Config(
                "Sync config directory cannot be empty".to_string(),
            ));
        }

        if self.max_sync_memory == 0 {
            return Err(Error::Config(
                "Max sync memory must be greater than 0 bytes".to_string(),
            ));
        }

        if self.retry_cooldown.is_zero() {
            return Err(Error::Config(
                "Retry cooldown must be greater than zero".to_string(),
            ));
        }

        if self.event_buffer_size == 0 {
            return Err(Error::Config(
                "Event buffer size must be greater than 0".to_string(),
            ));
        }

        if self.features.enable_network_awareness && self.network_monitor.is_none() {
            return Err(Error::Config(
                "Network awareness enabled but no NetworkMonitor provided. \
                 Disable the feature or inject a NetworkMonitor implementation."
                    .to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(feature = "desktop-shims")]
fn provide_default_system_memory() -> Result<Arc<dyn SystemMemory>> {
    use bridge_desktop::DesktopSystemMemory;

    let probe: Arc<dyn SystemMemory> = Arc::new(DesktopSystemMemory::new());
    Ok(probe)
}

#[cfg(not(feature = "desktop-shims"))]
fn provide_default_system_memory() -> Result<Arc<dyn SystemMemory>> {
    Err(Error::CapabilityMissing {
        capability: "SystemMemory".to_string(),
        message: "SystemMemory implementation is required to size the bulk sync. \
                 Desktop: ensure the 'desktop-shims' feature is enabled to use DesktopSystemMemory. \
                 Other hosts: inject a platform probe or FixedSystemMemory."
            .to_string(),
    })
}

/// Builder for [`BridgeConfig`].
#[derive(Default)]
pub struct BridgeConfigBuilder {
    sync_config_dir: Option<PathBuf>,
    max_sync_memory: Option<u64>,
    retry_cooldown: Option<Duration>,
    show_all_mail: Option<bool>,
    address_mode: AddressMode,
    event_buffer_size: Option<usize>,
    system_memory: Option<Arc<dyn SystemMemory>>,
    network_monitor: Option<Arc<dyn NetworkMonitor>>,
    telemetry: Option<Arc<dyn Telemetry>>,
    features: FeatureFlags,
}

impl BridgeConfigBuilder {
    /// Sets the directory holding the sync state files (required).
    pub fn sync_config_dir<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.sync_config_dir = Some(path.into());
        self
    }

    /// Sets the bulk sync memory budget in bytes (default 2 GiB).
    pub fn max_sync_memory(mut self, bytes: u64) -> Self {
        self.max_sync_memory = Some(bytes);
        self
    }

    /// Sets the pause between failed sync attempts (default 20 s).
    pub fn retry_cooldown(mut self, cooldown: Duration) -> Self {
        self.retry_cooldown = Some(cooldown);
        self
    }

    /// Shows or hides "All Mail" (shown by default).
    pub fn show_all_mail(mut self, show: bool) -> Self {
        self.show_all_mail = Some(show);
        self
    }

    pub fn address_mode(mut self, mode: AddressMode) -> Self {
        self.address_mode = mode;
        self
    }

    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.event_buffer_size = Some(size);
        self
    }

    pub fn system_memory(mut self, probe: Arc<dyn SystemMemory>) -> Self {
        self.system_memory = Some(probe);
        self
    }

    pub fn network_monitor(mut self, monitor: Arc<dyn NetworkMonitor>) -> Self {
        self.network_monitor = Some(monitor);
        self
    }

    pub fn telemetry(mut self, telemetry: Arc<dyn Telemetry>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Replaces all feature flags at once.
    pub fn features(mut self, features: FeatureFlags) -> Self {
        self.features = features;
        self
    }

    /// Builds the final `BridgeConfig` instance.
    ///
    /// Returns an error if the sync directory is missing, a capability
    /// cannot be defaulted, or [`BridgeConfig::validate`] fails.
    pub fn build(self) -> Result<BridgeConfig> {
        let sync_config_dir = self.sync_config_dir.ok_or_else(|| {
            Error::Config(
                "Sync config directory is required. Use .sync_config_dir() to set it.".to_string(),
            )
        })?;

        let system_memory = match self.system_memory {
            Some(probe) => probe,
            None => provide_default_system_memory()?,
        };

        let config = BridgeConfig {
            sync_config_dir,
            max_sync_memory: self.max_sync_memory.unwrap_or(DEFAULT_MAX_SYNC_MEMORY),
            retry_cooldown: self.retry_cooldown.unwrap_or(DEFAULT_RETRY_COOLDOWN),
            show_all_mail: self.show_all_mail.unwrap_or(true),
            address_mode: self.address_mode,
            event_buffer_size: self.event_buffer_size.unwrap_or(DEFAULT_EVENT_BUFFER_SIZE),
            system_memory,
            network_monitor: self.network_monitor,
            telemetry: self
                .telemetry
                .unwrap_or_else(|| Arc::new(NoopTelemetry)),
            features: self.features,
        };

        config.validate()?;

        Ok(config)
    }
}
