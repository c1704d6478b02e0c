//! External advisory data: address reputation and destination-tag requirements.
//!
//! Both feeds are read-only lookup tables refreshed on a fixed interval by a
//! background task. The filter only ever sees an eventually-consistent
//! snapshot behind an [`ArcSwap`]; a failed refresh keeps the previous
//! snapshot and degrades soft with a warning instead of surfacing to any
//! client.
//!
//! Reputation tiers, least to most suspicious: `0` unknown, `1` probable,
//! `2` high probability, `3` confirmed. A destination at or above
//! [`CONFIRMED_TIER`] hard-rejects; a flagged sender below that is allowed
//! and audited.

use crate::config::AdvisoryConfig;
use arc_swap::ArcSwap;
use serde::Deserialize;
use std::{collections::HashMap, sync::Arc};
use tokio::time::interval;

/// Reputation tier at which a destination address is blocked outright.
pub const CONFIRMED_TIER: i64 = 3;

/// A reputation feed wire entry: `{address: {address, status}}` values.
#[derive(Debug, Clone, Deserialize)]
pub struct ReputationEntry {
    pub address: String,
    pub status: i64,
}

/// Feeds below this entry count are treated as truncated and discarded.
const MIN_FEED_ENTRIES: usize = 100;

/// Shared advisory snapshots consulted by the filter.
pub struct AdvisoryStore {
    reputation: ArcSwap<HashMap<String, ReputationEntry>>,
    tag_required: ArcSwap<HashMap<String, String>>,
}

impl Default for AdvisoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl AdvisoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            reputation: ArcSwap::from_pointee(HashMap::new()),
            tag_required: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    /// Reputation tier for an address, if the feed lists it.
    #[must_use]
    pub fn reputation_of(&self, address: &str) -> Option<i64> {
        self.reputation.load().get(address).map(|entry| entry.status)
    }

    /// Whether the destination-tag feed requires a tag for this address.
    #[must_use]
    pub fn requires_destination_tag(&self, address: &str) -> bool {
        self.tag_required.load().contains_key(address)
    }

    /// Label attached to a tag-required address (e.g. an exchange name).
    #[must_use]
    pub fn destination_tag_label(&self, address: &str) -> Option<String> {
        self.tag_required.load().get(address).cloned()
    }

    /// Installs a fresh reputation snapshot (refresher and tests).
    pub fn install_reputation(&self, entries: HashMap<String, ReputationEntry>) {
        self.reputation.store(Arc::new(entries));
    }

    /// Installs a fresh destination-tag snapshot (refresher and tests).
    pub fn install_tags(&self, entries: HashMap<String, String>) {
        self.tag_required.store(Arc::new(entries));
    }

    /// Number of addresses in the current reputation snapshot.
    #[must_use]
    pub fn reputation_len(&self) -> usize {
        self.reputation.load().len()
    }
}

/// Background task refreshing both feeds on the configured interval.
pub struct AdvisoryRefresher {
    store: Arc<AdvisoryStore>,
    config: AdvisoryConfig,
    client: reqwest::Client,
}

impl AdvisoryRefresher {
    #[must_use]
    pub fn new(store: Arc<AdvisoryStore>, config: AdvisoryConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self { store, config, client }
    }

    /// Spawns the refresh loop. The first tick fires immediately so the
    /// filter has data as soon as the feeds answer.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.config.refresh_interval());
            loop {
                ticker.tick().await;
                self.refresh_once().await;
            }
        })
    }

    /// One refresh pass over both feeds. Failures keep the stale snapshot.
    pub async fn refresh_once(&self) {
        if let Some(url) = &self.config.reputation_url {
            match self.fetch_reputation(url).await {
                Ok(entries) => {
                    tracing::info!(entries = entries.len(), "updated reputation advisory");
                    self.store.install_reputation(entries);
                }
                Err(error) => {
                    tracing::warn!(%error, "reputation advisory refresh failed, keeping stale data");
                }
            }
        }
        if let Some(url) = &self.config.destination_tag_url {
            match self.fetch_tags(url).await {
                Ok(entries) => {
                    tracing::info!(entries = entries.len(), "updated destination-tag advisory");
                    self.store.install_tags(entries);
                }
                Err(error) => {
                    tracing::warn!(%error, "destination-tag advisory refresh failed, keeping stale data");
                }
            }
        }
    }

    async fn fetch_reputation(
        &self,
        url: &str,
    ) -> Result<HashMap<String, ReputationEntry>, AdvisoryError> {
        let entries: HashMap<String, ReputationEntry> =
            self.client.get(url).send().await?.error_for_status()?.json().await?;
        if entries.len() < MIN_FEED_ENTRIES {
            return Err(AdvisoryError::Truncated(entries.len()));
        }
        Ok(entries)
    }

    async fn fetch_tags(&self, url: &str) -> Result<HashMap<String, String>, AdvisoryError> {
        let entries: HashMap<String, String> =
            self.client.get(url).send().await?.error_for_status()?.json().await?;
        Ok(entries)
    }
}

/// Errors from a single feed refresh attempt.
#[derive(Debug, thiserror::Error)]
pub enum AdvisoryError {
    #[error("feed transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("feed looks truncated ({0} entries)")]
    Truncated(usize),
}
