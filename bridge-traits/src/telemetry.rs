//! Telemetry Abstraction
//!
//! Error and configuration reports sent to the vendor. Reports carry a small
//! key/value context; callers must hash anything user-identifying (label
//! paths, addresses) before putting it in the context.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::Result;

/// Structured context attached to a report.
pub type ReportContext = BTreeMap<String, Value>;

pub trait Telemetry: Send + Sync {
    /// Report an unexpected condition.
    fn report_message(&self, message: &str, context: ReportContext) -> Result<()>;

    /// Report a recoverable but noteworthy condition.
    fn report_warning(&self, message: &str, context: ReportContext) -> Result<()> {
        self.report_message(message, context)
    }

    /// A mail client authenticated successfully.
    fn config_status_success(&self) {}

    /// A mail client failed to authenticate.
    fn config_status_failure(&self, _details: &str) {}
}

/// Telemetry sink that drops everything.
#[derive(Debug, Clone, Default)]
pub struct NoopTelemetry;

impl Telemetry for NoopTelemetry {
    fn report_message(&self, _message: &str, _context: ReportContext) -> Result<()> {
        Ok(())
    }
}

/// Build a [`ReportContext`] from key/value pairs.
pub fn report_context<I, K, V>(pairs: I) -> ReportContext
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<Value>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}
