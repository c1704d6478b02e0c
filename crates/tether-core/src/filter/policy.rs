//! Transaction policy enforcement and the privileged-command guard.
//!
//! The checks here are pure: they look at a decoded transaction (or a parsed
//! command object) plus the advisory snapshots and produce a verdict. Audit
//! delivery and counters stay with the caller.

use crate::{
    advisory::{AdvisoryStore, CONFIRMED_TIER},
    config::PolicyConfig,
    filter::decode::DecodedTx,
};
use serde_json::Value;
use thiserror::Error;

/// A typed policy rejection. The display string becomes the reason text in
/// the local-failure envelope returned to the client.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PolicyRejection {
    #[error("DESTINATION ACCOUNT {address} FOUND IN ADVISORY, level {tier}")]
    BlacklistedDestination { address: String, tier: i64 },

    #[error("DESTINATION ACCOUNT {address} REQUIRES A DESTINATION TAG")]
    DestinationTagMissing { address: String },

    #[error("FEE {fee} EXCEEDS FEE LIMIT {cap}")]
    FeeExceedsCap { fee: u64, cap: u64 },

    #[error("TRANSACTION TYPE {tx_type} IS DISABLED")]
    DisabledTxType { tx_type: String },
}

/// Non-blocking observations made while checking a transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicyObservations {
    /// Sender address flagged in the advisory (allowed, audited), with tier.
    pub flagged_sender: Option<(String, i64)>,
    /// Destination listed in the advisory below the blocking tier.
    pub listed_destination: Option<(String, i64)>,
}

/// Outcome of the transaction policy pipeline.
#[derive(Debug, Clone, Default)]
pub struct PolicyOutcome {
    pub rejection: Option<PolicyRejection>,
    pub observations: PolicyObservations,
}

/// Runs the transaction-level policy checks in order, short-circuiting on
/// the first rejection: destination blacklist, destination tag, disabled
/// type, fee cap.
#[must_use]
pub fn enforce(
    decoded: &DecodedTx,
    advisory: &AdvisoryStore,
    policy: &PolicyConfig,
) -> PolicyOutcome {
    let mut outcome = PolicyOutcome::default();

    if let Some(destination) = &decoded.destination {
        if let Some(tier) = advisory.reputation_of(destination) {
            if tier >= CONFIRMED_TIER {
                outcome.rejection = Some(PolicyRejection::BlacklistedDestination {
                    address: destination.clone(),
                    tier,
                });
                return outcome;
            }
            outcome.observations.listed_destination = Some((destination.clone(), tier));
        }
    }

    if let Some(account) = &decoded.account {
        if let Some(tier) = advisory.reputation_of(account) {
            if tier >= 1 {
                // A flagged sender is allowed through and audited, never blocked.
                outcome.observations.flagged_sender = Some((account.clone(), tier));
            }
        }
    }

    if let Some(destination) = &decoded.destination {
        if advisory.requires_destination_tag(destination) &&
            decoded.destination_tag.unwrap_or(0) == 0
        {
            outcome.rejection =
                Some(PolicyRejection::DestinationTagMissing { address: destination.clone() });
            return outcome;
        }
    }

    if let Some(tx_type) = decoded.tx_type() {
        if policy.disabled_tx_types.iter().any(|disabled| disabled == tx_type) {
            outcome.rejection =
                Some(PolicyRejection::DisabledTxType { tx_type: tx_type.to_string() });
            return outcome;
        }
    }

    if let Some(fee) = decoded.fee_drops {
        let cap = if decoded.tx_type() == Some("AccountDelete") {
            policy.account_delete_fee_cap_drops
        } else {
            policy.fee_cap_drops
        };
        if fee > cap {
            outcome.rejection = Some(PolicyRejection::FeeExceedsCap { fee, cap });
            return outcome;
        }
    }

    outcome
}

/// Commands reserved for node operators; the proxy never relays them.
const PRIVILEGED_COMMANDS: &[&str] = &[
    "connect",
    "consensus_info",
    "crawl_shards",
    "download_shard",
    "feature",
    "fetch_info",
    "get_counts",
    "ledger_accept",
    "ledger_cleaner",
    "ledger_request",
    "log_level",
    "logrotate",
    "peer_reservations_add",
    "peer_reservations_del",
    "peer_reservations_list",
    "peers",
    "sign",
    "sign_for",
    "stop",
    "validation_create",
    "validation_seed",
    "wallet_propose",
];

/// Request fields that carry key material; any request bearing one is refused.
const SECRET_FIELDS: &[&str] = &["secret", "seed", "seed_hex", "passphrase"];

/// Checks a parsed command object against the privileged-command rules.
///
/// Returns the reason a request must be refused with a no-permission
/// envelope, or `None` when the request may proceed.
#[must_use]
pub fn privileged_rejection(message: &Value) -> Option<String> {
    let command = message.get("command").and_then(Value::as_str).map(str::to_ascii_lowercase);

    for field in SECRET_FIELDS {
        if message.get(*field).is_some() {
            return Some(format!("request carries key material ({field})"));
        }
    }

    let command = command?;

    if PRIVILEGED_COMMANDS.contains(&command.as_str()) {
        return Some(format!("administrative command: {command}"));
    }

    // Structural ledger dumps: full ledger bodies or account enumeration.
    if command == "ledger" {
        let full = message.get("full").and_then(Value::as_bool).unwrap_or(false);
        let accounts = message.get("accounts").and_then(Value::as_bool).unwrap_or(false);
        if full || accounts {
            return Some("ledger query requesting full body or account enumeration".to_string());
        }
    }

    // Peer-status streams expose node topology.
    if command == "subscribe" {
        if let Some(streams) = message.get("streams").and_then(Value::as_array) {
            if streams.iter().any(|s| s.as_str() == Some("peer_status")) {
                return Some("subscription to peer_status stream".to_string());
            }
        }
    }

    None
}
