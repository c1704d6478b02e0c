//! # Tether Core
//!
//! Core library for the tether WebSocket ledger-node proxy: one stable
//! logical connection per downstream client, transparently multiplexed,
//! healed and rewritten against a fluctuating pool of upstream nodes.
//!
//! This crate provides the foundational components for:
//!
//! - **[`registry`]**: Per-endpoint health tracking with penalty-based
//!   circuit breaking, random healthy-endpoint selection and maintenance
//!   transitions.
//!
//! - **[`uplink`]**: The upstream connection state machine: connect/open/
//!   sane/closing lifecycle, liveness probing, subscription replay and
//!   inbound payload normalization.
//!
//! - **[`client`]**: Downstream connection lifecycle: the accept-side
//!   manager with per-IP ceilings, and the per-client session driving
//!   bounded buffering, failover and up to four auxiliary uplink roles.
//!
//! - **[`filter`]**: The pure routing/classification pipeline: transaction
//!   decoding, policy enforcement, privileged-command guarding, request
//!   rewriting with id round-tripping, and upstream-class selection.
//!
//! - **[`advisory`]**: Eventually-consistent snapshots of the external
//!   address-reputation and destination-tag feeds.
//!
//! - **[`audit`]**: Fire-and-forget structured audit event delivery.
//!
//! - **[`metrics`]**: In-memory proxy counters for the admin surface.
//!
//! ## Message Flow
//!
//! ```text
//! downstream socket
//!       │
//!       ▼
//! ┌──────────────────┐   __api envelope   ┌────────────────┐
//! │  ClientSession   │ ─────────────────► │ state/upgrade  │
//! └────────┬─────────┘                    └────────────────┘
//!          │ raw frame
//!          ▼
//! ┌──────────────────┐  reject envelope
//! │   filter::route  │ ────────────────► downstream socket
//! └────────┬─────────┘
//!          │ Relay { class }
//!          ▼
//! ┌──────────────────┐        ┌─────────────────────────────┐
//! │ Link (per class) │ ─────► │ UplinkConnection (per gen.) │
//! │  buffer/recent   │        │  probe / replay / normalize │
//! └──────────────────┘        └──────────────┬──────────────┘
//!                                            │ normalized inbound
//!                                            ▼
//!                                     downstream socket
//! ```

pub mod advisory;
pub mod audit;
pub mod client;
pub mod config;
pub mod filter;
pub mod metrics;
pub mod registry;
pub mod types;
pub mod uplink;
