//! In-memory proxy counters.
//!
//! Tracks connection totals, live clients, relayed and rejected message
//! counts, plus the per-IP / per-destination rejection tallies the filter
//! maintains. Exposed through the admin status endpoint; there is no
//! exporter layer.

use dashmap::DashMap;
use serde::Serialize;
use std::{
    collections::HashMap,
    sync::atomic::{AtomicI64, AtomicU64, Ordering},
};

/// Process-wide counters, shared as an `Arc<ProxyMetrics>`.
#[derive(Debug, Default)]
pub struct ProxyMetrics {
    connections_total: AtomicU64,
    clients_live: AtomicI64,
    messages_relayed: AtomicU64,
    messages_rejected: AtomicU64,
    rejected_by_ip: DashMap<String, u64>,
    rejected_by_destination: DashMap<String, u64>,
    rejected_by_fee: DashMap<String, u64>,
}

impl ProxyMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an accepted downstream connection.
    pub fn record_connection(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.clients_live.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a downstream disconnect.
    pub fn record_disconnect(&self) {
        self.clients_live.fetch_sub(1, Ordering::Relaxed);
    }

    /// Records one message relayed toward an uplink.
    pub fn record_relay(&self) {
        self.messages_relayed.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a policy rejection attributed to a client IP.
    pub fn record_rejection(&self, ip: &str) {
        self.messages_rejected.fetch_add(1, Ordering::Relaxed);
        *self.rejected_by_ip.entry(ip.to_string()).or_insert(0) += 1;
    }

    /// Records a blacklist hit on a destination address.
    pub fn record_destination_block(&self, destination: &str) {
        *self.rejected_by_destination.entry(destination.to_string()).or_insert(0) += 1;
    }

    /// Records a fee-cap rejection attributed to a client IP.
    pub fn record_fee_block(&self, ip: &str) {
        *self.rejected_by_fee.entry(ip.to_string()).or_insert(0) += 1;
    }

    /// Point-in-time copy for the admin status endpoint.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            clients_live: self.clients_live.load(Ordering::Relaxed),
            messages_relayed: self.messages_relayed.load(Ordering::Relaxed),
            messages_rejected: self.messages_rejected.load(Ordering::Relaxed),
            rejected_by_ip: self
                .rejected_by_ip
                .iter()
                .map(|kv| (kv.key().clone(), *kv.value()))
                .collect(),
            rejected_by_destination: self
                .rejected_by_destination
                .iter()
                .map(|kv| (kv.key().clone(), *kv.value()))
                .collect(),
            rejected_by_fee: self
                .rejected_by_fee
                .iter()
                .map(|kv| (kv.key().clone(), *kv.value()))
                .collect(),
        }
    }
}

/// Serializable view of [`ProxyMetrics`].
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub clients_live: i64,
    pub messages_relayed: u64,
    pub messages_rejected: u64,
    pub rejected_by_ip: HashMap<String, u64>,
    pub rejected_by_destination: HashMap<String, u64>,
    pub rejected_by_fee: HashMap<String, u64>,
}
