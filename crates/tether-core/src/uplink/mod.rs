//! Upstream ("uplink") connection handling.
//!
//! One [`connection`] task per logical upstream socket, owning the
//! connect/open/sane/closing state machine, liveness probing, penalty
//! accrual, outbound subscription bookkeeping and inbound payload
//! normalization. The owning client connection talks to it through a typed
//! command channel and receives a fixed, enumerated set of signals back;
//! there are no stringly-typed events.

pub mod connection;
pub mod errors;
pub mod normalize;
pub mod subscriptions;

pub use connection::{spawn_uplink, UplinkHandle, UplinkParams};
pub use errors::UplinkError;
pub use normalize::{FeeSmoother, Inbound, Normalizer, Unsuitability};
pub use subscriptions::SubscriptionSet;

/// Which link of a client connection an uplink serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkSlot {
    /// The client's default (basic/priority) link.
    Main,
    /// Transaction submission link.
    Submit,
    /// Partial-history read link.
    NonFh,
    /// Pathfinding link.
    Path,
    /// Reporting-mode link.
    Reporting,
}

impl LinkSlot {
    /// Slots other than [`LinkSlot::Main`] carry specialized traffic.
    #[must_use]
    pub fn is_aux(&self) -> bool {
        !matches!(self, LinkSlot::Main)
    }
}

/// Lifecycle states of an uplink connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UplinkState {
    Connecting,
    Open,
    Sane,
    Closing,
    Closed,
}

/// Why an uplink reported itself gone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GoneReason {
    /// The transport connect failed.
    ConnectFailed,
    /// The transport connect did not finish inside the deadline.
    ConnectTimeout,
    /// No inbound payload arrived within the first-contact window.
    FirstContactTimeout,
    /// No inbound payload arrived within the pong window.
    PongTimeout,
    /// The upstream closed the socket (not on purpose from our side).
    RemoteClosed,
    /// The socket errored mid-stream.
    TransportError,
    /// An inbound payload shape marked this node unsuitable.
    Unsuitable(Unsuitability),
}

impl GoneReason {
    /// Whether the owner should replay its most recent commands onto the
    /// replacement uplink instead of waiting for client retransmission.
    #[must_use]
    pub fn replay_recent(&self) -> bool {
        matches!(self, GoneReason::Unsuitable(_))
    }
}

/// Signal from an uplink task to its owning client connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UplinkEvent {
    pub slot: LinkSlot,
    pub generation: u64,
    pub kind: UplinkEventKind,
}

/// The closed set of uplink signals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UplinkEventKind {
    /// Transport-level connect succeeded; subscriptions are being replayed.
    Open,
    /// First inbound payload arrived; the uplink is sane and adoptable.
    FirstLive,
    /// The uplink is gone and will not recover; the endpoint has already
    /// been penalized where the reason warrants it.
    Gone(GoneReason),
    /// The task has fully shut down (follows both purposeful closes and
    /// `Gone`).
    Closed,
}

/// Command from the owning client connection to an uplink task.
#[derive(Debug)]
pub enum UplinkCommand {
    /// Relay one frame upstream.
    Send(String),
    /// Tear the connection down. `on_purpose` suppresses the `Gone` signal
    /// and therefore automatic reconnection.
    Close { on_purpose: bool },
}
