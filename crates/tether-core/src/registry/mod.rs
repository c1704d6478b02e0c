//! Endpoint health registry with penalty-based circuit breaking.
//!
//! Tracks every known upstream endpoint: its traffic role, health flag,
//! maintenance flag and an accrued penalty record. Uplink connections report
//! transport failures here; the admin surface toggles maintenance; selection
//! draws uniformly at random among the currently healthy endpoints of a role.
//!
//! The registry is the one piece of state shared across all client
//! connections, so it is an injected [`Arc<HealthRegistry>`] with all
//! mutation behind a single `parking_lot::RwLock` rather than a module-level
//! global.
//!
//! # Penalty lifecycle
//!
//! A failure increments the endpoint's count and stamps the failure time.
//! A count strictly above the trip threshold flips the endpoint unhealthy
//! ("tripped") and asks the connection manager to migrate every client bound
//! to it. A record untouched for the decay window resets to zero on the next
//! read and the tripped flag clears, and the endpoint re-enters selection on
//! probation.

use crate::{
    config::{PenaltyConfig, FALLBACK_ENDPOINT},
    types::{Role, UplinkAction},
};
use parking_lot::RwLock;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::time::Instant;

/// Per-endpoint penalty record.
#[derive(Debug, Clone, Default)]
struct PenaltyRecord {
    count: u32,
    last: Option<Instant>,
    tripped: bool,
}

impl PenaltyRecord {
    /// Resets the record if the decay window has elapsed since the last
    /// failure. Returns `true` if a reset happened.
    fn decay_if_expired(&mut self, window: std::time::Duration) -> bool {
        match self.last {
            Some(last) if self.count > 0 && last.elapsed() >= window => {
                self.count = 0;
                self.last = None;
                self.tripped = false;
                true
            }
            _ => false,
        }
    }
}

#[derive(Debug)]
struct EndpointEntry {
    uri: String,
    role: Role,
    healthy: bool,
    maintenance: bool,
    penalty: PenaltyRecord,
}

impl EndpointEntry {
    fn selectable(&self) -> bool {
        self.healthy && !self.maintenance && !self.penalty.tripped
    }
}

/// Snapshot of one endpoint for the admin surface and tests.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointInfo {
    /// Stable identifier derived from the URI, usable in admin URLs.
    pub id: String,
    pub uri: String,
    pub role: Role,
    pub healthy: bool,
    pub maintenance: bool,
    pub penalty_count: u32,
    pub tripped: bool,
}

/// Outcome of [`HealthRegistry::note_error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PenaltyVerdict {
    pub count: u32,
    /// `true` exactly when this failure pushed the endpoint over the trip
    /// threshold; the caller must migrate clients bound to the endpoint.
    pub tripped_now: bool,
}

/// Registry of upstream endpoints, their health and their penalties.
pub struct HealthRegistry {
    entries: RwLock<Vec<EndpointEntry>>,
    penalty: PenaltyConfig,
}

impl HealthRegistry {
    #[must_use]
    pub fn new(penalty: PenaltyConfig) -> Self {
        Self { entries: RwLock::new(Vec::new()), penalty }
    }

    /// Stable hex identifier for an endpoint URI, used by the admin surface
    /// instead of URL-encoding the URI itself.
    #[must_use]
    pub fn endpoint_id(uri: &str) -> String {
        let digest = Sha256::digest(uri.as_bytes());
        hex::encode(&digest[..8])
    }

    /// Registers an endpoint. Idempotent by URI: re-adding an existing
    /// endpoint leaves its current health and penalty untouched.
    pub fn add(&self, role: Role, uri: &str, healthy: bool) {
        let mut entries = self.entries.write();
        if entries.iter().any(|e| e.uri == uri) {
            return;
        }
        tracing::debug!(endpoint = uri, role = %role, healthy, "registering endpoint");
        entries.push(EndpointEntry {
            uri: uri.to_string(),
            role,
            healthy,
            maintenance: false,
            penalty: PenaltyRecord::default(),
        });
    }

    /// Snapshot of every endpoint serving `role`.
    #[must_use]
    pub fn list(&self, role: Role) -> Vec<EndpointInfo> {
        self.entries.read().iter().filter(|e| e.role == role).map(Self::info).collect()
    }

    /// Snapshot of all endpoints, for the admin status view.
    #[must_use]
    pub fn list_all(&self) -> Vec<EndpointInfo> {
        self.entries.read().iter().map(Self::info).collect()
    }

    fn info(entry: &EndpointEntry) -> EndpointInfo {
        EndpointInfo {
            id: Self::endpoint_id(&entry.uri),
            uri: entry.uri.clone(),
            role: entry.role,
            healthy: entry.healthy,
            maintenance: entry.maintenance,
            penalty_count: entry.penalty.count,
            tripped: entry.penalty.tripped,
        }
    }

    /// Selects an endpoint for `role` uniformly at random among the healthy
    /// candidates, falling back to the hard-coded endpoint when none are.
    ///
    /// Expired penalties decay here, so a tripped endpoint re-enters the draw
    /// once its probation window has passed. The draw is random rather than
    /// round-robin; there is no fairness guarantee beyond uniformity.
    #[must_use]
    pub fn select(&self, role: Role) -> String {
        use rand::Rng;

        let mut entries = self.entries.write();
        for entry in entries.iter_mut() {
            if entry.penalty.decay_if_expired(self.penalty.decay()) {
                entry.healthy = !entry.maintenance;
                tracing::debug!(endpoint = %entry.uri, "penalty expired, endpoint on probation");
            }
        }

        let candidates: Vec<&EndpointEntry> =
            entries.iter().filter(|e| e.role == role && e.selectable()).collect();

        match candidates.len() {
            0 => {
                tracing::warn!(role = %role, "no healthy endpoint, using fallback");
                FALLBACK_ENDPOINT.to_string()
            }
            1 => candidates[0].uri.clone(),
            n => candidates[rand::rng().random_range(0..n)].uri.clone(),
        }
    }

    /// Records a failure against an endpoint.
    ///
    /// Expired history decays first, then the count increments. A count
    /// strictly above the trip threshold trips the endpoint unhealthy; the
    /// verdict tells the caller whether this particular failure did so.
    pub fn note_error(&self, uri: &str) -> PenaltyVerdict {
        let mut entries = self.entries.write();
        let Some(entry) = entries.iter_mut().find(|e| e.uri == uri) else {
            // Unregistered endpoints (e.g. the fallback) accrue nothing.
            return PenaltyVerdict { count: 0, tripped_now: false };
        };

        entry.penalty.decay_if_expired(self.penalty.decay());
        entry.penalty.count += 1;
        entry.penalty.last = Some(Instant::now());

        let newly_tripped = !entry.penalty.tripped && entry.penalty.count > self.penalty.trip_threshold;
        if newly_tripped {
            entry.penalty.tripped = true;
            entry.healthy = false;
            tracing::warn!(
                endpoint = uri,
                penalty = entry.penalty.count,
                "endpoint tripped unhealthy, bound clients will migrate"
            );
        } else {
            tracing::debug!(endpoint = uri, penalty = entry.penalty.count, "endpoint penalized");
        }

        PenaltyVerdict { count: entry.penalty.count, tripped_now: newly_tripped }
    }

    /// Applies the decay window to one endpoint's penalty record.
    ///
    /// Selection does this implicitly; the explicit form exists for the
    /// penalty maintenance timer and for tests.
    pub fn clear_if_expired(&self, uri: &str) {
        let mut entries = self.entries.write();
        if let Some(entry) = entries.iter_mut().find(|e| e.uri == uri) {
            if entry.penalty.decay_if_expired(self.penalty.decay()) {
                entry.healthy = !entry.maintenance;
            }
        }
    }

    /// Administrative health transition. Returns the affected URI when the
    /// endpoint exists (callers use it to drive client migration on
    /// [`UplinkAction::Migrate`]).
    pub fn set_status(&self, id_or_uri: &str, action: UplinkAction) -> Option<String> {
        let mut entries = self.entries.write();
        let entry = entries
            .iter_mut()
            .find(|e| e.uri == id_or_uri || Self::endpoint_id(&e.uri) == id_or_uri)?;

        tracing::info!(endpoint = %entry.uri, action = ?action, "endpoint status change");
        match action {
            UplinkAction::Up => {
                entry.healthy = true;
                entry.maintenance = false;
                entry.penalty = PenaltyRecord::default();
            }
            UplinkAction::Down | UplinkAction::Migrate => {
                entry.healthy = false;
                entry.maintenance = true;
            }
        }
        Some(entry.uri.clone())
    }

    /// Whether the endpoint is currently selectable.
    #[must_use]
    pub fn is_selectable(&self, uri: &str) -> bool {
        self.entries.read().iter().any(|e| e.uri == uri && e.selectable())
    }
}
