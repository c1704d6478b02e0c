//! Final command classification into an upstream class.
//!
//! Runs last in the filter pipeline and only for connections that are not
//! already a specialized auxiliary link (preventing recursive re-routing).

/// Upstream class a relayed message is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamClass {
    /// The connection's own (basic/priority) uplink.
    Default,
    /// Transaction submission pool.
    Submit,
    /// Pathfinding pool.
    Path,
    /// Partial-history pool for broad read queries.
    NonFh,
}

/// Transaction submissions and fee queries.
const SUBMIT_COMMANDS: &[&str] = &["fee", "submit"];

/// Pathfinding commands.
const PATH_COMMANDS: &[&str] = &["path_find", "ripple_path_find"];

/// Read queries that want broader-than-default history or looser ledger
/// constraints; a partial-history node answers these fine.
const NONFH_COMMANDS: &[&str] = &["account_tx", "ledger_data", "tx", "tx_history"];

/// Classifies a parsed command into its upstream class.
#[must_use]
pub fn classify(command: Option<&str>) -> UpstreamClass {
    let Some(command) = command else {
        return UpstreamClass::Default;
    };
    if SUBMIT_COMMANDS.contains(&command) {
        return UpstreamClass::Submit;
    }
    if PATH_COMMANDS.contains(&command) {
        return UpstreamClass::Path;
    }
    if NONFH_COMMANDS.contains(&command) {
        return UpstreamClass::NonFh;
    }
    UpstreamClass::Default
}
