//! The message routing / classification pipeline.
//!
//! [`route`] is a pure decision function over `(raw message, client state)`.
//! It parses at most once, applies the policy checks in a fixed order with
//! short-circuiting, performs the request rewrites that need id
//! round-tripping, and finally classifies the message into the upstream
//! class it belongs to. Inbound (uplink to downstream) traffic never passes
//! through here; that direction is handled by the uplink normalizer.
//!
//! Pipeline order:
//!
//! 1. bare-JSON-object gate (anything else passes through unclassified)
//! 2. transaction decode for `submit` + hex blob (failure degrades to a
//!    generic command)
//! 3. transaction policy (blacklist, destination tag, disabled type, fee cap)
//! 4. privileged-command guard (no-permission envelope)
//! 5. self-referential trust-line rewrite (correlation side table)
//! 6. result-count `limit` clamp
//! 7. classification into `submit` / `path` / `nonfh` / default
//!
//! Steps 2–7 are skipped entirely on auxiliary links: a specialized
//! connection never re-routes or re-polices traffic that already passed
//! through its parent.

pub mod classify;
pub mod decode;
pub mod policy;
pub mod rewrite;

pub use classify::UpstreamClass;
pub use decode::{decode_tx_blob, DecodedTx};
pub use policy::{PolicyOutcome, PolicyRejection};
pub use rewrite::RewriteTable;

use crate::{
    advisory::AdvisoryStore,
    audit::{AuditSink, Severity},
    config::PolicyConfig,
    metrics::ProxyMetrics,
    types::{ClientHeaders, Role},
};
use serde_json::Value;

/// Everything the pipeline needs to know about the submitting client.
pub struct FilterContext<'a> {
    pub role: Role,
    /// `true` when this connection is itself a specialized auxiliary link.
    pub is_aux: bool,
    pub ip: &'a str,
    pub headers: &'a ClientHeaders,
    pub advisory: &'a AdvisoryStore,
    pub policy: &'a PolicyConfig,
    pub rewrites: &'a RewriteTable,
    pub audit: &'a dyn AuditSink,
    pub metrics: &'a ProxyMetrics,
}

/// Outcome of routing one downstream message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    /// Relay `frame` to the uplink of `class`.
    Relay { class: UpstreamClass, frame: String },
    /// Do not relay; send `frame` back to the client.
    Reject { frame: String },
}

/// Routes one raw downstream message.
#[must_use]
pub fn route(raw: &str, ctx: &FilterContext<'_>) -> RouteDecision {
    // Specialized links relay verbatim; their parent already ran the pipeline.
    if ctx.is_aux {
        return RouteDecision::Relay { class: UpstreamClass::Default, frame: raw.to_string() };
    }

    let trimmed = raw.trim();
    if !(trimmed.starts_with('{') && trimmed.ends_with('}')) {
        return RouteDecision::Relay { class: UpstreamClass::Default, frame: raw.to_string() };
    }
    let Ok(mut message) = serde_json::from_str::<Value>(trimmed) else {
        tracing::debug!(ip = ctx.ip, "unparseable frame relayed unclassified");
        return RouteDecision::Relay { class: UpstreamClass::Default, frame: raw.to_string() };
    };
    if !message.is_object() {
        return RouteDecision::Relay { class: UpstreamClass::Default, frame: raw.to_string() };
    }

    let command =
        message.get("command").and_then(Value::as_str).map(str::to_ascii_lowercase);

    let decoded = decode_submission(&message, command.as_deref(), ctx);

    if let Some(decoded) = &decoded {
        let outcome = policy::enforce(decoded, ctx.advisory, ctx.policy);

        if let Some((address, _tier)) = &outcome.observations.listed_destination {
            ctx.metrics.record_destination_block(address);
        }
        if let Some((address, tier)) = &outcome.observations.flagged_sender {
            ctx.audit.report(
                "Reject transaction",
                serde_json::json!({
                    "ip": ctx.ip,
                    "headers": ctx.headers,
                    "transaction": decoded.to_audit_json(),
                    "reason": format!("SENDING ACCOUNT {address} FOUND IN ADVISORY, level {tier}"),
                    "soft": true,
                }),
                Severity::Critical,
            );
        }

        if let Some(rejection) = outcome.rejection {
            return reject_transaction(&message, decoded, &rejection, ctx);
        }
    }

    if let Some(reason) = policy::privileged_rejection(&message) {
        ctx.metrics.record_rejection(ctx.ip);
        ctx.audit.report(
            "No Permission",
            serde_json::json!({
                "ip": ctx.ip,
                "headers": ctx.headers,
                "command": command,
                "reason": reason,
            }),
            Severity::Warning,
        );
        return RouteDecision::Reject { frame: no_permission_frame(message.get("id")) };
    }

    let mut mutated = false;

    // A trust-line query against itself walks every line in existence on
    // some backends; neutralize the account and round-trip the original
    // value through the correlation table.
    if command.as_deref() == Some("account_lines") {
        let account = message.get("account").and_then(Value::as_str);
        let peer = message.get("peer").and_then(Value::as_str);
        if let (Some(account), Some(peer)) = (account, peer) {
            if !account.is_empty() && account == peer {
                let original = account.to_string();
                let correlation =
                    ctx.rewrites.register(message.get("id").cloned(), "account", &original);
                if let Some(object) = message.as_object_mut() {
                    object.insert(
                        "account".to_string(),
                        Value::String(ctx.policy.neutral_account.clone()),
                    );
                    object.insert("id".to_string(), Value::String(correlation));
                    mutated = true;
                    tracing::debug!(ip = ctx.ip, "self-referential trust-line query neutralized");
                }
            }
        }
    }

    if let Some(limit) = message.get("limit").and_then(Value::as_u64) {
        if limit > ctx.policy.limit_ceiling {
            if let Some(object) = message.as_object_mut() {
                object.insert("limit".to_string(), Value::from(ctx.policy.limit_ceiling));
                mutated = true;
            }
        }
    }

    let class = classify::classify(command.as_deref());
    let frame = if mutated {
        serde_json::to_string(&message).unwrap_or_else(|_| raw.to_string())
    } else {
        raw.to_string()
    };
    RouteDecision::Relay { class, frame }
}

/// Decodes the transaction blob of a submission, if this message is one.
///
/// Decode failures are logged and reported as `None`: an undecodable
/// submission skips transaction-level policy and is handled as a generic
/// command.
fn decode_submission(
    message: &Value,
    command: Option<&str>,
    ctx: &FilterContext<'_>,
) -> Option<DecodedTx> {
    if command != Some("submit") {
        return None;
    }
    let blob = message.get("tx_blob")?.as_str()?;
    match decode_tx_blob(blob) {
        Ok(decoded) => {
            ctx.audit.report(
                "TX Submit",
                serde_json::json!({
                    "ip": ctx.ip,
                    "transaction": decoded.to_audit_json(),
                }),
                Severity::Info,
            );
            Some(decoded)
        }
        Err(error) => {
            tracing::warn!(ip = ctx.ip, %error, "undecodable submission, treating as generic command");
            None
        }
    }
}

/// Builds the rejection path for a transaction policy failure.
fn reject_transaction(
    message: &Value,
    decoded: &DecodedTx,
    rejection: &PolicyRejection,
    ctx: &FilterContext<'_>,
) -> RouteDecision {
    ctx.metrics.record_rejection(ctx.ip);
    match rejection {
        PolicyRejection::BlacklistedDestination { address, .. } => {
            ctx.metrics.record_destination_block(address);
        }
        PolicyRejection::FeeExceedsCap { .. } => {
            ctx.metrics.record_fee_block(ctx.ip);
        }
        _ => {}
    }

    ctx.audit.report(
        "Reject transaction",
        serde_json::json!({
            "ip": ctx.ip,
            "role": ctx.role,
            "headers": ctx.headers,
            "transaction": decoded.to_audit_json(),
            "reason": rejection.to_string(),
        }),
        Severity::Warning,
    );

    RouteDecision::Reject {
        frame: local_failure_frame(
            &rejection.to_string(),
            message.get("id"),
            message.get("tx_blob"),
        ),
    }
}

/// Canned local-failure envelope mirroring an upstream rejection, with the
/// original request id and transaction blob preserved when present.
#[must_use]
pub fn local_failure_frame(reason: &str, id: Option<&Value>, tx_blob: Option<&Value>) -> String {
    let mut result = serde_json::json!({
        "accepted": false,
        "applied": false,
        "broadcast": false,
        "engine_result": "telLOCAL_ERROR",
        "engine_result_code": -399,
        "engine_result_message": format!("Local failure: {reason}"),
        "kept": false,
        "queued": false,
    });
    if let (Some(blob), Some(result_obj)) = (tx_blob, result.as_object_mut()) {
        result_obj.insert("tx_blob".to_string(), blob.clone());
    }

    let mut envelope = serde_json::json!({
        "result": result,
        "status": "success",
        "type": "response",
    });
    if let (Some(id), Some(envelope_obj)) = (id, envelope.as_object_mut()) {
        envelope_obj.insert("id".to_string(), id.clone());
    }
    envelope.to_string()
}

/// No-permission envelope echoing the original request id.
#[must_use]
pub fn no_permission_frame(id: Option<&Value>) -> String {
    let mut envelope = serde_json::json!({
        "error": "noPermission",
        "error_code": 6,
        "error_message": "You don't have permission for this command.",
        "status": "error",
        "type": "response",
    });
    if let (Some(id), Some(envelope_obj)) = (id, envelope.as_object_mut()) {
        envelope_obj.insert("id".to_string(), id.clone());
    }
    envelope.to_string()
}

#[cfg(test)]
mod tests {
    use super::{decode::test_blobs::*, *};
    use crate::{
        advisory::ReputationEntry,
        audit::testing::RecordingSink,
        filter::decode::encode_account_id,
    };
    use serde_json::json;

    struct Fixture {
        advisory: AdvisoryStore,
        policy: PolicyConfig,
        rewrites: RewriteTable,
        audit: RecordingSink,
        metrics: ProxyMetrics,
        headers: ClientHeaders,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                advisory: AdvisoryStore::new(),
                policy: PolicyConfig::default(),
                rewrites: RewriteTable::new(),
                audit: RecordingSink::default(),
                metrics: ProxyMetrics::new(),
                headers: ClientHeaders::default(),
            }
        }

        fn ctx(&self) -> FilterContext<'_> {
            self.ctx_with(Role::Basic, false)
        }

        fn ctx_with(&self, role: Role, is_aux: bool) -> FilterContext<'_> {
            FilterContext {
                role,
                is_aux,
                ip: "192.0.2.7",
                headers: &self.headers,
                advisory: &self.advisory,
                policy: &self.policy,
                rewrites: &self.rewrites,
                audit: &self.audit,
                metrics: &self.metrics,
            }
        }
    }

    fn relay_frame(decision: RouteDecision) -> (UpstreamClass, String) {
        match decision {
            RouteDecision::Relay { class, frame } => (class, frame),
            RouteDecision::Reject { frame } => panic!("unexpected rejection: {frame}"),
        }
    }

    fn reject_frame(decision: RouteDecision) -> Value {
        match decision {
            RouteDecision::Reject { frame } => serde_json::from_str(&frame).unwrap(),
            RouteDecision::Relay { frame, .. } => panic!("unexpected relay: {frame}"),
        }
    }

    #[test]
    fn non_json_passes_through_unclassified() {
        let fixture = Fixture::new();
        for raw in ["plain text", "[1,2,3]", "{\"trunc\":", "42"] {
            let (class, frame) = relay_frame(route(raw, &fixture.ctx()));
            assert_eq!(class, UpstreamClass::Default);
            assert_eq!(frame, raw);
        }
    }

    #[test]
    fn oversized_fee_submission_is_rejected_with_envelope() {
        let fixture = Fixture::new();
        let blob = TxBlobBuilder::new().tx_type(0).fee(50_000_000).account(&ACCOUNT_A).build();
        let raw = json!({"id": 9, "command": "submit", "tx_blob": blob}).to_string();

        let envelope = reject_frame(route(&raw, &fixture.ctx()));
        assert_eq!(envelope["id"], json!(9));
        assert_eq!(envelope["status"], json!("success"));
        assert_eq!(envelope["type"], json!("response"));
        assert_eq!(envelope["result"]["engine_result"], json!("telLOCAL_ERROR"));
        assert_eq!(envelope["result"]["engine_result_code"], json!(-399));
        assert_eq!(envelope["result"]["tx_blob"], json!(blob));
        let reason = envelope["result"]["engine_result_message"].as_str().unwrap();
        assert!(reason.starts_with("Local failure:"));
        assert!(reason.contains("50000000"));

        assert_eq!(fixture.metrics.snapshot().rejected_by_fee["192.0.2.7"], 1);
        let audited = fixture.audit.events.lock();
        assert!(audited.iter().any(|(event, _, _)| event == "Reject transaction"));
    }

    #[test]
    fn submission_at_cap_is_relayed_to_submit_class() {
        let fixture = Fixture::new();
        let blob = TxBlobBuilder::new().tx_type(0).fee(2_000_000).account(&ACCOUNT_A).build();
        let raw = json!({"command": "submit", "tx_blob": blob}).to_string();

        let (class, frame) = relay_frame(route(&raw, &fixture.ctx()));
        assert_eq!(class, UpstreamClass::Submit);
        assert_eq!(frame, raw);
    }

    #[test]
    fn confirmed_destination_blocks_submission() {
        let fixture = Fixture::new();
        let destination = encode_account_id(&ACCOUNT_B);
        fixture.advisory.install_reputation(
            [(destination.clone(), ReputationEntry { address: destination.clone(), status: 3 })]
                .into(),
        );
        let blob = TxBlobBuilder::new()
            .tx_type(0)
            .fee(12)
            .account(&ACCOUNT_A)
            .destination(&ACCOUNT_B)
            .build();
        let raw = json!({"command": "submit", "tx_blob": blob}).to_string();

        let envelope = reject_frame(route(&raw, &fixture.ctx()));
        let reason = envelope["result"]["engine_result_message"].as_str().unwrap();
        assert!(reason.contains("FOUND IN ADVISORY"));
        assert_eq!(fixture.metrics.snapshot().rejected_by_destination[&destination], 1);
    }

    #[test]
    fn flagged_sender_is_relayed_and_audited() {
        let fixture = Fixture::new();
        let sender = encode_account_id(&ACCOUNT_A);
        fixture.advisory.install_reputation(
            [(sender.clone(), ReputationEntry { address: sender.clone(), status: 2 })].into(),
        );
        let blob = TxBlobBuilder::new()
            .tx_type(0)
            .fee(12)
            .account(&ACCOUNT_A)
            .destination(&ACCOUNT_B)
            .build();
        let raw = json!({"command": "submit", "tx_blob": blob}).to_string();

        let (class, _) = relay_frame(route(&raw, &fixture.ctx()));
        assert_eq!(class, UpstreamClass::Submit);

        let audited = fixture.audit.events.lock();
        let soft = audited
            .iter()
            .find(|(event, context, _)| {
                event == "Reject transaction" && context["soft"] == json!(true)
            })
            .expect("soft flag audited");
        assert_eq!(soft.2, Severity::Critical);
    }

    #[test]
    fn missing_destination_tag_blocks_regardless_of_fee() {
        let fixture = Fixture::new();
        let destination = encode_account_id(&ACCOUNT_B);
        fixture
            .advisory
            .install_tags([(destination.clone(), "exchange".to_string())].into());
        let blob = TxBlobBuilder::new()
            .tx_type(0)
            .fee(10)
            .account(&ACCOUNT_A)
            .destination(&ACCOUNT_B)
            .build();
        let raw = json!({"command": "submit", "tx_blob": blob}).to_string();

        let envelope = reject_frame(route(&raw, &fixture.ctx()));
        let reason = envelope["result"]["engine_result_message"].as_str().unwrap();
        assert!(reason.contains("REQUIRES A DESTINATION TAG"));
    }

    #[test]
    fn undecodable_submission_degrades_to_generic_relay() {
        let fixture = Fixture::new();
        let raw = json!({"command": "submit", "tx_blob": "ZZZZ"}).to_string();
        let (class, frame) = relay_frame(route(&raw, &fixture.ctx()));
        assert_eq!(class, UpstreamClass::Submit);
        assert_eq!(frame, raw);
    }

    #[test]
    fn privileged_commands_get_no_permission_echoing_id() {
        let fixture = Fixture::new();
        let raw = json!({"id": {"req": 4}, "command": "wallet_propose"}).to_string();
        let envelope = reject_frame(route(&raw, &fixture.ctx()));
        assert_eq!(envelope["error"], json!("noPermission"));
        assert_eq!(envelope["error_code"], json!(6));
        assert_eq!(envelope["id"], json!({"req": 4}));
    }

    #[test]
    fn secret_bearing_sign_request_is_refused() {
        let fixture = Fixture::new();
        let raw = json!({"command": "sign", "secret": "snoopy"}).to_string();
        let envelope = reject_frame(route(&raw, &fixture.ctx()));
        assert_eq!(envelope["error"], json!("noPermission"));
    }

    #[test]
    fn self_referential_trust_line_query_is_neutralized() {
        let fixture = Fixture::new();
        let raw = json!({"id": 7, "command": "account_lines", "account": "rA", "peer": "rA"})
            .to_string();

        let (class, frame) = relay_frame(route(&raw, &fixture.ctx()));
        assert_eq!(class, UpstreamClass::Default);
        let sent: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(sent["account"], json!(fixture.policy.neutral_account));
        assert_eq!(sent["peer"], json!("rA"));
        assert!(RewriteTable::is_correlation_id(&sent["id"]));

        // The matching response restores both the id and the account value.
        let mut response = json!({
            "id": sent["id"],
            "status": "success",
            "type": "response",
            "result": {"account": fixture.policy.neutral_account, "lines": []}
        });
        assert!(fixture.rewrites.restore(&mut response));
        assert_eq!(response["id"], json!(7));
        assert_eq!(response["result"]["account"], json!("rA"));
    }

    #[test]
    fn distinct_account_and_peer_are_left_alone() {
        let fixture = Fixture::new();
        let raw = json!({"command": "account_lines", "account": "rA", "peer": "rB"}).to_string();
        let (_, frame) = relay_frame(route(&raw, &fixture.ctx()));
        assert_eq!(frame, raw);
        assert_eq!(fixture.rewrites.pending(), 0);
    }

    #[test]
    fn oversized_limit_is_clamped() {
        let fixture = Fixture::new();
        let raw = json!({"command": "account_lines", "account": "rA", "limit": 100_000})
            .to_string();
        let (_, frame) = relay_frame(route(&raw, &fixture.ctx()));
        let sent: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(sent["limit"], json!(400));

        let raw = json!({"command": "account_lines", "account": "rA", "limit": 20}).to_string();
        let (_, frame) = relay_frame(route(&raw, &fixture.ctx()));
        assert_eq!(frame, raw);
    }

    #[test]
    fn auxiliary_links_relay_verbatim() {
        let fixture = Fixture::new();
        let blob = TxBlobBuilder::new().tx_type(0).fee(50_000_000).build();
        let raw = json!({"command": "submit", "tx_blob": blob}).to_string();

        let (class, frame) = relay_frame(route(&raw, &fixture.ctx_with(Role::Submit, true)));
        assert_eq!(class, UpstreamClass::Default);
        assert_eq!(frame, raw);
        assert_eq!(fixture.metrics.snapshot().messages_rejected, 0);
    }

    #[test]
    fn classification_table() {
        let fixture = Fixture::new();
        for (command, expected) in [
            ("fee", UpstreamClass::Submit),
            ("path_find", UpstreamClass::Path),
            ("account_tx", UpstreamClass::NonFh),
            ("server_info", UpstreamClass::Default),
        ] {
            let raw = json!({"command": command}).to_string();
            let (class, _) = relay_frame(route(&raw, &fixture.ctx()));
            assert_eq!(class, expected, "command {command}");
        }
    }
}
