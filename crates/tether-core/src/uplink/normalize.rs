//! Inbound payload normalization.
//!
//! Every payload an uplink receives passes through here before being
//! forwarded to the downstream socket. Three kinds of surgery happen:
//!
//! 1. **Ledger-range synthesis**: numeric ledger-range strings
//!    (`complete_ledgers`, `validated_ledgers`) are rewritten to a synthetic
//!    "full history since genesis" range so downstream clients cannot tell
//!    partial-history backends apart.
//! 2. **Fee smoothing**: published fee floors are clamped to a minimum and
//!    the open-ledger fee is replaced by the rolling median of the last 500
//!    observed values, damping per-node spikes.
//! 3. **Correlation restore**: responses to rewritten requests get their
//!    original wire id and field value spliced back (see the filter's
//!    rewrite table).
//!
//! The normalizer is also where node unsuitability is detected: error shapes
//! that mean "this node cannot serve this client" (not "the network is
//! down") make the uplink close, penalize the endpoint and reselect.

use crate::{filter::RewriteTable, types::is_internal_frame};
use parking_lot::Mutex;
use serde_json::Value;
use std::{collections::VecDeque, sync::Arc};

/// Earliest ledger index in existence; the synthetic range starts here.
pub const GENESIS_LEDGER: u64 = 32_570;

/// Floor applied to published fee values, in drops.
pub const MIN_FEE_DROPS: u64 = 10;

/// Number of open-ledger fee observations kept for the rolling median.
const FEE_WINDOW: usize = 500;

/// Error codes meaning the node itself is unsuitable, not the request.
const BUSY_ERRORS: &[&str] = &["noCurrent", "noNetwork", "notSynced", "tooBusy"];

/// Why an uplink must be abandoned even though its socket is healthy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Unsuitability {
    #[error("node rejected a well-formed ledger index")]
    MalformedLedgerIndex,

    #[error("node busy or unsynced: {0}")]
    NodeBusy(String),

    #[error("node advertises partial history: {0}")]
    PartialHistory(String),
}

/// Outcome of normalizing one inbound payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Forward this frame downstream.
    Forward(String),
    /// Internal sentinel traffic; consume silently.
    Internal,
    /// Abandon this uplink, penalize the endpoint and reselect.
    Unsuitable(Unsuitability),
}

/// Rolling window of open-ledger fee observations.
#[derive(Debug, Default)]
pub struct FeeSmoother {
    window: VecDeque<u64>,
}

impl FeeSmoother {
    /// Records an observation and returns the current rolling median,
    /// floored to [`MIN_FEE_DROPS`].
    pub fn observe(&mut self, value: u64) -> u64 {
        if self.window.len() == FEE_WINDOW {
            self.window.pop_front();
        }
        self.window.push_back(value);

        let mut sorted: Vec<u64> = self.window.iter().copied().collect();
        sorted.sort_unstable();
        let mid = sorted.len() / 2;
        let median = if sorted.len() % 2 == 0 {
            sorted[mid - 1].midpoint(sorted[mid])
        } else {
            sorted[mid]
        };
        median.max(MIN_FEE_DROPS)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.window.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }
}

/// Per-client inbound normalizer, shared across uplink generations so the
/// fee window and correlation table survive a switchover.
pub struct Normalizer {
    /// Whether this link's clients expect a full-history backend; partial
    /// ranges then force a reselect instead of being papered over.
    enforce_full_history: bool,
    fee: Mutex<FeeSmoother>,
    rewrites: Arc<RewriteTable>,
}

impl Normalizer {
    #[must_use]
    pub fn new(enforce_full_history: bool, rewrites: Arc<RewriteTable>) -> Self {
        Self { enforce_full_history, fee: Mutex::new(FeeSmoother::default()), rewrites }
    }

    /// Normalizes one inbound payload.
    pub fn process(&self, raw: &str) -> Inbound {
        if is_internal_frame(raw) {
            return Inbound::Internal;
        }
        let Ok(mut value) = serde_json::from_str::<Value>(raw) else {
            return Inbound::Forward(raw.to_string());
        };
        if !value.is_object() {
            return Inbound::Forward(raw.to_string());
        }

        if let Some(error) = value.get("error").and_then(Value::as_str) {
            if error == "lgrIdxMalformed" {
                return Inbound::Unsuitable(Unsuitability::MalformedLedgerIndex);
            }
            if BUSY_ERRORS.contains(&error) {
                return Inbound::Unsuitable(Unsuitability::NodeBusy(error.to_string()));
            }
        }

        let mut mutated = false;

        // Ledger streams carry the range at the top level, server_info under
        // result.info.
        if let Some(range) =
            value.get("validated_ledgers").and_then(Value::as_str).map(str::to_string)
        {
            match self.check_range(&range) {
                Err(unsuitable) => return Inbound::Unsuitable(unsuitable),
                Ok(Some(synthetic)) => {
                    if let Some(object) = value.as_object_mut() {
                        object.insert("validated_ledgers".to_string(), Value::String(synthetic));
                        mutated = true;
                    }
                }
                Ok(None) => {}
            }
        }
        if let Some(range) = value
            .get("result")
            .and_then(|r| r.get("info"))
            .and_then(|i| i.get("complete_ledgers"))
            .and_then(Value::as_str)
            .map(str::to_string)
        {
            match self.check_range(&range) {
                Err(unsuitable) => return Inbound::Unsuitable(unsuitable),
                Ok(Some(synthetic)) => {
                    if let Some(info) = value
                        .get_mut("result")
                        .and_then(|r| r.get_mut("info"))
                        .and_then(Value::as_object_mut)
                    {
                        info.insert("complete_ledgers".to_string(), Value::String(synthetic));
                        mutated = true;
                    }
                }
                Ok(None) => {}
            }
        }

        mutated |= self.normalize_fees(&mut value);

        if self.rewrites.restore(&mut value) {
            mutated = true;
        }

        if mutated {
            Inbound::Forward(serde_json::to_string(&value).unwrap_or_else(|_| raw.to_string()))
        } else {
            Inbound::Forward(raw.to_string())
        }
    }

    /// Judges an advertised ledger range: an error means the node must be
    /// abandoned, `Some` carries the synthetic replacement presentation.
    fn check_range(&self, range: &str) -> Result<Option<String>, Unsuitability> {
        if self.enforce_full_history && !range_is_full(range) {
            return Err(Unsuitability::PartialHistory(range.to_string()));
        }
        match synthesize_range(range) {
            Some(synthetic) if synthetic != range => Ok(Some(synthetic)),
            _ => Ok(None),
        }
    }

    /// Applies fee floors and open-ledger fee smoothing. Returns whether the
    /// payload changed.
    fn normalize_fees(&self, value: &mut Value) -> bool {
        let mut mutated = false;

        // Ledger stream: fee_base as a number.
        if let Some(fee_base) = value.get("fee_base").and_then(Value::as_u64) {
            if fee_base < MIN_FEE_DROPS {
                if let Some(object) = value.as_object_mut() {
                    object.insert("fee_base".to_string(), Value::from(MIN_FEE_DROPS));
                    mutated = true;
                }
            }
        }

        // Fee command response: result.drops.* as decimal strings.
        let Some(drops) = value
            .get_mut("result")
            .and_then(|r| r.get_mut("drops"))
            .and_then(Value::as_object_mut)
        else {
            return mutated;
        };

        for field in ["base_fee", "minimum_fee"] {
            if let Some(fee) = drops.get(field).and_then(Value::as_str).and_then(parse_drops) {
                if fee < MIN_FEE_DROPS {
                    drops.insert(field.to_string(), Value::String(MIN_FEE_DROPS.to_string()));
                    mutated = true;
                }
            }
        }

        if let Some(fee) =
            drops.get("open_ledger_fee").and_then(Value::as_str).and_then(parse_drops)
        {
            let smoothed = self.fee.lock().observe(fee);
            if smoothed != fee {
                drops.insert("open_ledger_fee".to_string(), Value::String(smoothed.to_string()));
                mutated = true;
            }
        }

        mutated
    }
}

fn parse_drops(value: &str) -> Option<u64> {
    value.parse().ok()
}

/// Parses every numeric bound out of a range string like `"32570-901234"`
/// or `"2000000-2400000,2500000-2600000"`.
fn range_bounds(range: &str) -> Vec<u64> {
    range
        .split(|c: char| c == '-' || c == ',')
        .filter_map(|part| part.trim().parse().ok())
        .collect()
}

/// Whether the advertised range is one contiguous span reaching back to
/// genesis.
fn range_is_full(range: &str) -> bool {
    if range.contains(',') {
        return false;
    }
    let bounds = range_bounds(range);
    match bounds.first() {
        Some(&lowest) => lowest <= GENESIS_LEDGER,
        None => false,
    }
}

/// The synthetic "full history since genesis" presentation of a range.
/// Non-numeric ranges (e.g. `"empty"`) pass through untouched.
fn synthesize_range(range: &str) -> Option<String> {
    let highest = range_bounds(range).into_iter().max()?;
    Some(format!("{GENESIS_LEDGER}-{highest}"))
}
