//! Request/response rewriting with id round-tripping.
//!
//! Some requests are rewritten before they reach an uplink (a
//! self-referential trust-line query gets a neutral placeholder account).
//! The matching response must come back looking untouched, so each rewrite
//! registers a side-table entry keyed by a core-generated correlation id.
//! The outgoing request carries the correlation id in its `id` field; the
//! response normalizer looks the correlation id up, restores the original
//! wire `id` (string, structured, or absent alike) and splices the original
//! field value back into the result.

use dashmap::DashMap;
use serde_json::Value;
use uuid::Uuid;

/// Marker prefix for correlation ids. Collisions with client-chosen ids are
/// guarded against by the uuid suffix.
const CORRELATION_PREFIX: &str = "tether-corr-";

/// One registered rewrite awaiting its response.
#[derive(Debug, Clone)]
pub struct PendingRewrite {
    /// The wire id the client originally sent, if any.
    pub original_id: Option<Value>,
    /// Result field whose value was substituted (e.g. `account`).
    pub field: String,
    /// The original value to splice back in.
    pub value: String,
}

/// Correlation side table, owned per client connection.
#[derive(Debug, Default)]
pub struct RewriteTable {
    entries: DashMap<String, PendingRewrite>,
}

impl RewriteTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a rewrite and returns the correlation id to put on the wire.
    #[must_use]
    pub fn register(&self, original_id: Option<Value>, field: &str, value: &str) -> String {
        let correlation = format!("{CORRELATION_PREFIX}{}", Uuid::new_v4().simple());
        self.entries.insert(
            correlation.clone(),
            PendingRewrite { original_id, field: field.to_string(), value: value.to_string() },
        );
        correlation
    }

    /// Whether a wire id looks like one of our correlation ids.
    #[must_use]
    pub fn is_correlation_id(id: &Value) -> bool {
        id.as_str().is_some_and(|s| s.starts_with(CORRELATION_PREFIX))
    }

    /// Restores a response in place if its id matches a registered rewrite.
    ///
    /// Puts the original wire id back (removing the `id` key when the request
    /// had none) and splices the original value into the result object, both
    /// at the top level and as the result's own field. Returns `true` when a
    /// restore happened; the entry is consumed.
    pub fn restore(&self, response: &mut Value) -> bool {
        let Some(correlation) = response.get("id").and_then(Value::as_str) else {
            return false;
        };
        if !correlation.starts_with(CORRELATION_PREFIX) {
            return false;
        }
        let Some((_, pending)) = self.entries.remove(correlation) else {
            return false;
        };

        let Some(object) = response.as_object_mut() else {
            return false;
        };
        match &pending.original_id {
            Some(id) => {
                object.insert("id".to_string(), id.clone());
            }
            None => {
                object.remove("id");
            }
        }
        if let Some(result) = object.get_mut("result").and_then(Value::as_object_mut) {
            result.insert(pending.field.clone(), Value::String(pending.value.clone()));
        }
        true
    }

    /// Number of rewrites still awaiting a response.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.entries.len()
    }
}
