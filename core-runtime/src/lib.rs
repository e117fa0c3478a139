//! # Core Runtime Module
//!
//! Foundational runtime infrastructure for the mail bridge core:
//! - Logging and tracing setup
//! - Account configuration and feature flags
//! - Lifecycle event bus
//!
//! ## Overview
//!
//! Every other crate of the workspace depends on this one for its ambient
//! concerns. It holds no account state of its own.

pub mod config;
pub mod error;
pub mod events;
pub mod logging;

pub use config::{AddressMode, BridgeConfig, FeatureFlags};
pub use error::{Error, Result};
pub use events::{AccountEvent, CoreEvent, EventBus, SyncEvent};
