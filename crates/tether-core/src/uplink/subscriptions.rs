//! Per-client subscription bookkeeping.
//!
//! Every subscribe/unsubscribe a client sends through its uplink is
//! normalized into this ordered set so a replacement uplink can be brought
//! to the same state by replaying it. Two normalized entry forms exist:
//!
//! - `accounts:<address>` / `accounts_proposed:<address>` for account-level
//!   stream subscriptions, extracted out of the carrying command;
//! - the full subscribe/unsubscribe command as compact JSON, stripped of its
//!   `id` and any connection-url fields.
//!
//! The set is idempotent: re-subscribing to an already-tracked stream is a
//! no-op, and an unsubscribe cancels the matching earlier subscribe instead
//! of being recorded alongside it.

use crate::types::REPLAY_TAG_ID;
use serde_json::Value;

/// Subscription-carrying command fields that hold per-account stream lists.
const ACCOUNT_LIST_FIELDS: &[&str] = &["accounts", "accounts_proposed"];

/// Fields never replayed to a different node.
const STRIPPED_FIELDS: &[&str] = &["id", "url", "url_username", "url_password"];

/// Ordered, idempotent set of normalized subscription commands.
#[derive(Debug, Default)]
pub struct SubscriptionSet {
    entries: Vec<String>,
}

impl SubscriptionSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in registration order.
    #[must_use]
    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    /// Inspects an outbound frame and updates the set if it is a
    /// subscribe/unsubscribe command.
    ///
    /// Replayed frames (tagged with the replay sentinel id) still maintain
    /// the account-level entries idempotently but are never re-recorded as
    /// fresh full-command subscriptions.
    pub fn register(&mut self, raw: &str) {
        let Ok(mut message) = serde_json::from_str::<Value>(raw) else {
            return;
        };
        let Some(command) =
            message.get("command").and_then(Value::as_str).map(str::to_ascii_lowercase)
        else {
            return;
        };
        if command != "subscribe" && command != "unsubscribe" {
            return;
        }

        let replayed = message.get("id").and_then(Value::as_str) == Some(REPLAY_TAG_ID);

        let Some(object) = message.as_object_mut() else {
            return;
        };
        for field in STRIPPED_FIELDS {
            object.remove(*field);
        }
        object.insert("command".to_string(), Value::String(command.clone()));

        // Account-level streams are tracked individually and removed from
        // the carrying command.
        for field in ACCOUNT_LIST_FIELDS {
            let Some(list) = object.remove(*field).and_then(|v| {
                v.as_array().map(|accounts| {
                    accounts
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect::<Vec<_>>()
                })
            }) else {
                continue;
            };
            for account in list {
                let key = format!("{field}:{account}");
                if command == "subscribe" {
                    if !self.entries.contains(&key) {
                        self.entries.push(key);
                    }
                } else if let Some(position) = self.entries.iter().position(|e| *e == key) {
                    self.entries.remove(position);
                }
            }
        }

        // Anything left beyond the bare command is a full-command subscription.
        if object.len() <= 1 || replayed {
            return;
        }
        let Ok(normalized) = serde_json::to_string(&message) else {
            return;
        };

        if command == "unsubscribe" {
            let matching = normalized.replacen("unsubscribe", "subscribe", 1);
            if let Some(position) = self.entries.iter().position(|e| *e == matching) {
                self.entries.remove(position);
                return;
            }
        }
        if !self.entries.contains(&normalized) {
            self.entries.push(normalized);
        }
    }

    /// Frames to bring a fresh uplink to this subscription state, each
    /// tagged with the replay sentinel id.
    #[must_use]
    pub fn replay_frames(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|entry| {
                if let Some(stripped) = entry.strip_suffix('}') {
                    format!("{stripped},\"id\":\"{REPLAY_TAG_ID}\"}}")
                } else {
                    let (field, account) = entry.split_once(':').unwrap_or(("accounts", entry));
                    format!(
                        "{{\"id\":\"{REPLAY_TAG_ID}\",\"command\":\"subscribe\",\"{field}\":[\"{account}\"]}}"
                    )
                }
            })
            .collect()
    }
}
