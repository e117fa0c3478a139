//! Workspace facade crate.
//!
//! Exposes the feature flags that map to the individual workspace crates
//! (`core-service`, `core-sync`). Host applications can depend on
//! `mail-bridge-workspace` and enable the documented features without wiring
//! each crate individually.

#[cfg(feature = "desktop-shims")]
pub use core_service;
#[cfg(feature = "desktop-shims")]
pub use core_sync;
