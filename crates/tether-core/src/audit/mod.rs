//! Fire-and-forget audit event delivery.
//!
//! Every policy rejection, soft flag and rate-limit kick is reported here
//! with enough context (ip, captured headers, decoded transaction, reason)
//! for offline review. Reporting never blocks the decision path: the default
//! sink writes a structured `tracing` event synchronously and cheaply; a
//! remote transport, if any, belongs behind the same trait in the embedding
//! process.

use serde::Serialize;
use std::sync::Arc;

/// Severity ladder for audit events, ordered least to most urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Default,
    Debug,
    Info,
    Notice,
    Warning,
    Error,
    Critical,
    Alert,
    Emergency,
}

/// Destination for audit events. Implementations must not block.
pub trait AuditSink: Send + Sync {
    /// Delivers one event. Failures are the sink's problem; callers never
    /// observe them.
    fn report(&self, event: &str, context: serde_json::Value, severity: Severity);
}

/// Shared handle to the configured sink.
pub type SharedAuditSink = Arc<dyn AuditSink>;

/// Default sink: structured `tracing` events under the `audit` target.
#[derive(Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn report(&self, event: &str, context: serde_json::Value, severity: Severity) {
        match severity {
            Severity::Warning |
            Severity::Error |
            Severity::Critical |
            Severity::Alert |
            Severity::Emergency => {
                tracing::warn!(target: "audit", event, severity = ?severity, %context, "audit event");
            }
            _ => {
                tracing::info!(target: "audit", event, severity = ?severity, %context, "audit event");
            }
        }
    }
}

/// Sink that drops everything; used where audit output is irrelevant.
#[derive(Debug, Default)]
pub struct NullAuditSink;

impl AuditSink for NullAuditSink {
    fn report(&self, _event: &str, _context: serde_json::Value, _severity: Severity) {}
}

/// In-memory sink for unit tests elsewhere in the crate.
#[cfg(test)]
pub(crate) mod testing {
    use super::{AuditSink, Severity};
    use parking_lot::Mutex;

    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub events: Mutex<Vec<(String, serde_json::Value, Severity)>>,
    }

    impl AuditSink for RecordingSink {
        fn report(&self, event: &str, context: serde_json::Value, severity: Severity) {
            self.events.lock().push((event.to_string(), context, severity));
        }
    }
}
