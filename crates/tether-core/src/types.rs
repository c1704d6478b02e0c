//! Core type definitions shared across the proxy: traffic roles, wire
//! sentinels, per-client counters and the out-of-band control envelope.
//!
//! # Type Categories
//!
//! ## Traffic classification
//! - [`Role`]: the traffic class assigned to a client or endpoint
//! - [`UplinkAction`]: administrative status transitions for an endpoint
//!
//! ## Downstream bookkeeping
//! - [`Counters`] / [`CounterSnapshot`]: lock-free rx/tx accounting
//! - [`ClientHeaders`]: headers captured at accept time, attached to audit events
//! - [`ControlRequest`] / [`StateSnapshot`]: the reserved `__api` envelope

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Wire id used by the periodic uplink liveness probe.
///
/// Responses tagged with this id are consumed by the uplink connection itself
/// and never forwarded downstream.
pub const LIVENESS_PROBE_ID: &str = "CONNECTION_PING_TEST";

/// Wire id used by the first-contact probe sent right after an uplink opens.
/// The first inbound payload (usually the reply to this probe) is what
/// promotes a fresh uplink from `Open` to `Sane`.
pub const FIRST_CONTACT_PROBE_ID: &str = "NEW_CONNECTION_TEST";

/// Wire id stamped on subscriptions replayed onto a replacement uplink, so
/// the replay is not re-registered as a fresh subscription.
pub const REPLAY_TAG_ID: &str = "REPLAYED_SUBSCRIPTION";

/// Returns `true` if the head of the message carries one of the internal
/// sentinel ids. Only the first 100 bytes are inspected; the sentinels are
/// always serialized near the front of internally generated frames.
#[must_use]
pub fn is_internal_frame(message: &str) -> bool {
    let cut = message.len().min(100);
    // Back off to a char boundary so multi-byte payloads cannot panic the slice.
    let mut end = cut;
    while end > 0 && !message.is_char_boundary(end) {
        end -= 1;
    }
    let head = &message[..end];
    head.contains(LIVENESS_PROBE_ID) ||
        head.contains(FIRST_CONTACT_PROBE_ID) ||
        head.contains(REPLAY_TAG_ID)
}

/// Traffic class assigned to a client connection or an upstream endpoint.
///
/// `Basic` and `Priority` are the two default (client-facing) classes; the
/// remaining roles are auxiliary upstream pools a client is routed to per
/// message.
///
/// # Example
///
/// ```
/// use tether_core::types::Role;
///
/// assert_eq!("nonfh".parse::<Role>().unwrap(), Role::NonFh);
/// assert_eq!(Role::Submit.as_str(), "submit");
/// assert!(Role::Priority.is_default_class());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Default public traffic.
    Basic,
    /// Upgraded client traffic, routed to the priority pool.
    Priority,
    /// Transaction submission and fee queries.
    Submit,
    /// Read queries relaxed to accept partial-history nodes.
    NonFh,
    /// Pathfinding commands.
    Path,
    /// Reporting-mode nodes (admin-selectable pool).
    Reporting,
}

impl Role {
    /// Static string form, matching the configuration spelling.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Basic => "basic",
            Role::Priority => "priority",
            Role::Submit => "submit",
            Role::NonFh => "nonfh",
            Role::Path => "path",
            Role::Reporting => "reporting",
        }
    }

    /// `true` for the two client-facing classes (`basic`, `priority`).
    ///
    /// Auxiliary roles are excluded from per-IP accounting and from
    /// re-entrant classification in the filter.
    #[must_use]
    pub fn is_default_class(&self) -> bool {
        matches!(self, Role::Basic | Role::Priority)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "basic" => Ok(Role::Basic),
            "priority" => Ok(Role::Priority),
            "submit" => Ok(Role::Submit),
            "nonfh" => Ok(Role::NonFh),
            "path" => Ok(Role::Path),
            "reporting" => Ok(Role::Reporting),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// Administrative status transition for an upstream endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UplinkAction {
    /// Mark the endpoint healthy again.
    Up,
    /// Mark the endpoint unhealthy; existing clients stay until their uplink drops.
    Down,
    /// Mark the endpoint unhealthy and move every bound client off it now.
    Migrate,
}

impl std::str::FromStr for UplinkAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "up" => Ok(UplinkAction::Up),
            "down" => Ok(UplinkAction::Down),
            "migrate" => Ok(UplinkAction::Migrate),
            other => Err(format!("unknown uplink action: {other}")),
        }
    }
}

/// Lock-free per-client message accounting.
///
/// `rx` counts traffic received from the uplink side, `tx` traffic received
/// from the downstream client, mirroring the directionality the status
/// snapshot reports.
#[derive(Debug, Default)]
pub struct Counters {
    pub rx_count: AtomicU64,
    pub tx_count: AtomicU64,
    pub rx_size: AtomicU64,
    pub tx_size: AtomicU64,
    pub uplink_reconnects: AtomicU64,
}

impl Counters {
    /// Records one inbound (uplink to downstream) message of `bytes` length.
    pub fn record_rx(&self, bytes: usize) {
        self.rx_count.fetch_add(1, Ordering::Relaxed);
        self.rx_size.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Records one outbound (downstream to uplink) message of `bytes` length.
    pub fn record_tx(&self, bytes: usize) {
        self.tx_count.fetch_add(1, Ordering::Relaxed);
        self.tx_size.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Records one uplink replacement.
    pub fn record_reconnect(&self) {
        self.uplink_reconnects.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy for status reporting.
    #[must_use]
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            rx_count: self.rx_count.load(Ordering::Relaxed),
            tx_count: self.tx_count.load(Ordering::Relaxed),
            rx_size: self.rx_size.load(Ordering::Relaxed),
            tx_size: self.tx_size.load(Ordering::Relaxed),
            uplink_reconnects: self.uplink_reconnects.load(Ordering::Relaxed),
        }
    }
}

/// Serializable view of [`Counters`], using the wire spelling clients expect.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterSnapshot {
    pub rx_count: u64,
    pub tx_count: u64,
    pub rx_size: u64,
    pub tx_size: u64,
    pub uplink_reconnects: u64,
}

/// Downstream request headers captured once at accept time.
///
/// Attached to audit events so policy rejections can be reviewed offline with
/// their originating context.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientHeaders {
    pub origin: String,
    pub user_agent: String,
    pub accept_language: String,
    pub x_forwarded_for: String,
    pub request_url: String,
}

/// Command carried by the reserved `__api` control envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    /// Report a status snapshot of the client connection.
    State,
    /// Switch the client to the `priority` class and migrate its uplink.
    Upgrade,
    /// Switch the client back to the `basic` class and migrate its uplink.
    Downgrade,
}

/// A parsed out-of-band control request. These frames never reach an uplink.
#[derive(Debug, Clone)]
pub struct ControlRequest {
    pub command: ControlCommand,
    /// Original request id, echoed in the response when present.
    pub id: Option<serde_json::Value>,
}

impl ControlRequest {
    /// Recognizes the control envelope in a raw downstream frame.
    ///
    /// Only frames up to `max_len` bytes are inspected (control frames are
    /// tiny; the cap keeps JSON parsing off the relay hot path). Returns
    /// `None` for anything that is not a well-formed `__api` object, in which
    /// case the frame is relayed as ordinary traffic.
    #[must_use]
    pub fn parse(raw: &str, max_len: usize) -> Option<Self> {
        if raw.len() > max_len {
            return None;
        }
        let value: serde_json::Value = serde_json::from_str(raw).ok()?;
        let command = match value.get("__api")?.as_str()? {
            "state" => ControlCommand::State,
            "upgrade" => ControlCommand::Upgrade,
            "downgrade" => ControlCommand::Downgrade,
            _ => return None,
        };
        Some(ControlRequest { command, id: value.get("id").cloned() })
    }
}

/// Status snapshot returned for a `__api: state` control request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,
    pub status: &'static str,
    #[serde(rename = "type")]
    pub kind: &'static str,
    /// Endpoint of the currently adopted uplink, if any.
    pub endpoint: Option<String>,
    pub preferred_server: String,
    pub uplink_type: Role,
    pub counters: CounterSnapshot,
    pub headers: ClientHeaders,
    pub uplink_count: u64,
    pub connect_moment: chrono::DateTime<chrono::Utc>,
}

impl StateSnapshot {
    /// Serializes the snapshot for the downstream socket.
    #[must_use]
    pub fn to_frame(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }
}
