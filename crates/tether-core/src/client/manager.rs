//! The connection manager: accepts downstream sockets, enforces the per-IP
//! ceiling, owns the client roster and drives endpoint-wide migrations.

use crate::{
    audit::Severity,
    client::session::{self, ClientHandle, SessionContext, SessionParams},
    types::{ClientHeaders, Role, UplinkAction},
};
use dashmap::DashMap;
use serde_json::json;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
};
use tokio_tungstenite::tungstenite::{
    handshake::server::{ErrorResponse, Request, Response},
    protocol::{frame::coding::CloseCode, CloseFrame},
};

/// Accepts downstream sockets and wires each one into a session.
pub struct ConnectionManager {
    ctx: SessionContext,
    roster: Arc<DashMap<u64, Arc<ClientHandle>>>,
    next_client_id: AtomicU64,
    tripped_tx: mpsc::UnboundedSender<String>,
}

impl ConnectionManager {
    /// Builds the manager, seeds the health registry from configuration and
    /// starts the endpoint-tripped migration listener.
    #[must_use]
    pub fn new(ctx: SessionContext) -> Arc<Self> {
        for entry in &ctx.config.uplinks {
            ctx.registry.add(entry.role, &entry.url, entry.healthy);
        }

        let (tripped_tx, mut tripped_rx) = mpsc::unbounded_channel::<String>();
        let manager = Arc::new(Self {
            ctx,
            roster: Arc::new(DashMap::new()),
            next_client_id: AtomicU64::new(0),
            tripped_tx,
        });

        // A tripped endpoint migrates every client still bound to it.
        let weak = Arc::downgrade(&manager);
        tokio::spawn(async move {
            while let Some(endpoint) = tripped_rx.recv().await {
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                manager.migrate_clients_bound_to(&endpoint);
            }
        });

        manager
    }

    /// Number of live client connections.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.roster.len()
    }

    /// Live `basic`-class connections from one IP.
    #[must_use]
    pub fn basic_clients_for_ip(&self, ip: &str) -> usize {
        self.roster
            .iter()
            .filter(|entry| {
                let handle = entry.value();
                handle.role() == Role::Basic && !handle.is_closed() && handle.ip == ip
            })
            .count()
    }

    fn is_whitelisted(&self, ip: &str) -> bool {
        self.ctx.config.limits.ip_whitelist.iter().any(|listed| listed == ip)
    }

    /// Registers an endpoint added at runtime; it starts unhealthy until an
    /// administrator marks it up.
    pub fn add_uplink(&self, role: Role, uri: &str) {
        self.ctx.registry.add(role, uri, false);
    }

    /// Administrative endpoint status change; `Migrate` also moves every
    /// client currently bound to the endpoint.
    pub fn set_uplink_status(&self, id_or_uri: &str, action: UplinkAction) -> Option<String> {
        let uri = self.ctx.registry.set_status(id_or_uri, action)?;
        if action == UplinkAction::Migrate {
            self.migrate_clients_bound_to(&uri);
        }
        Some(uri)
    }

    /// Signals every client bound to `endpoint` to pick a new uplink.
    pub fn migrate_clients_bound_to(&self, endpoint: &str) {
        let mut migrated = 0usize;
        for entry in self.roster.iter() {
            let handle = entry.value();
            if !handle.is_closed() && handle.endpoint().as_deref() == Some(endpoint) {
                handle.request_migrate();
                migrated += 1;
            }
        }
        tracing::info!(endpoint, clients = migrated, "migrating clients away from endpoint");
    }

    /// Status document for the admin surface.
    #[must_use]
    pub fn status(&self) -> serde_json::Value {
        let clients: Vec<serde_json::Value> = self
            .roster
            .iter()
            .map(|entry| {
                let handle = entry.value();
                json!({
                    "id": handle.id,
                    "ip": handle.ip,
                    "role": handle.role(),
                    "endpoint": handle.endpoint(),
                })
            })
            .collect();
        json!({
            "clients": clients,
            "uplinks": self.ctx.registry.list_all(),
            "metrics": self.ctx.metrics.snapshot(),
        })
    }

    /// Accept loop; runs until the listener dies.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        tracing::info!(addr = ?listener.local_addr().ok(), "proxy listening");
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let manager = self.clone();
                    tokio::spawn(async move {
                        manager.handle_socket(stream, peer).await;
                    });
                }
                Err(error) => {
                    tracing::warn!(%error, "accept failed");
                }
            }
        }
    }

    /// Performs the WebSocket handshake, applies the per-IP ceiling and
    /// hands the socket to a session.
    async fn handle_socket(self: Arc<Self>, stream: TcpStream, peer: std::net::SocketAddr) {
        let mut headers = ClientHeaders::default();
        let mut forwarded_for: Option<String> = None;

        let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            let header = |name: &str| {
                request
                    .headers()
                    .get(name)
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or_default()
                    .to_string()
            };
            headers = ClientHeaders {
                origin: header("origin"),
                user_agent: header("user-agent"),
                accept_language: header("accept-language"),
                x_forwarded_for: header("x-forwarded-for"),
                request_url: request.uri().to_string(),
            };
            if !headers.x_forwarded_for.is_empty() {
                forwarded_for = Some(headers.x_forwarded_for.clone());
            }
            Ok(response)
        };

        let mut socket = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
            Ok(socket) => socket,
            Err(error) => {
                tracing::debug!(%error, "handshake failed");
                return;
            }
        };

        // The forwarded-for header wins over the transport address, so the
        // ceiling applies to the real client behind a fronting proxy.
        let ip = forwarded_for.unwrap_or_else(|| peer.ip().to_string());

        let ceiling = self.ctx.config.limits.ip_basic;
        let current = self.basic_clients_for_ip(&ip);
        if current >= ceiling && !self.is_whitelisted(&ip) {
            tracing::warn!(%ip, current, ceiling, "per-IP connection ceiling reached, refusing client");
            self.ctx.audit.report(
                "RateLimit",
                json!({ "ip": ip, "headers": headers, "ipLimit": true }),
                Severity::Alert,
            );
            let reason = format!("Connection (public) IP limit reached for {ip}");
            let _ = socket
                .close(Some(CloseFrame { code: CloseCode::Policy, reason: reason.into() }))
                .await;
            return;
        }

        let id = self.next_client_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let handle = Arc::new(ClientHandle::new(id, ip, control_tx));
        self.roster.insert(id, handle.clone());
        self.ctx.metrics.record_connection();
        tracing::info!(
            client_id = id,
            ip = %handle.ip,
            origin = %headers.origin,
            "new client connection"
        );

        session::run(SessionParams {
            ctx: self.ctx.clone(),
            socket,
            handle,
            control_rx,
            headers,
            roster: self.roster.clone(),
            tripped: self.tripped_tx.clone(),
        })
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        advisory::AdvisoryStore,
        audit::TracingAuditSink,
        config::{AppConfig, UplinkEntry},
        metrics::ProxyMetrics,
        registry::HealthRegistry,
        types::{FIRST_CONTACT_PROBE_ID, LIVENESS_PROBE_ID},
    };
    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::Message;

    /// A fake upstream node that answers the first-contact probe and serves
    /// a canned reply for `server_info` and ledger-stream probes.
    async fn spawn_fake_node() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let Ok(socket) = tokio_tungstenite::accept_async(stream).await else {
                        return;
                    };
                    let (mut sink, mut stream) = socket.split();
                    while let Some(Ok(message)) = stream.next().await {
                        let Message::Text(text) = message else { continue };
                        if text.contains(FIRST_CONTACT_PROBE_ID) {
                            let reply =
                                format!("{{\"id\":\"{FIRST_CONTACT_PROBE_ID}\",\"result\":{{}}}}");
                            let _ = sink.send(Message::Text(reply.into())).await;
                        } else if text.contains("server_info") {
                            let reply = serde_json::json!({
                                "id": extract_id(&text),
                                "status": "success",
                                "type": "response",
                                "result": {"info": {"complete_ledgers": "32570-90000000"}}
                            });
                            let _ =
                                sink.send(Message::Text(reply.to_string().into())).await;
                        } else if text.contains("fee_probe") {
                            let reply = serde_json::json!({
                                "type": "ledgerClosed",
                                "fee_base": 1,
                                "validated_ledgers": "32570-90000000"
                            });
                            let _ =
                                sink.send(Message::Text(reply.to_string().into())).await;
                        }
                    }
                });
            }
        });

        format!("ws://127.0.0.1:{port}")
    }

    fn extract_id(frame: &str) -> serde_json::Value {
        serde_json::from_str::<serde_json::Value>(frame)
            .ok()
            .and_then(|v| v.get("id").cloned())
            .unwrap_or(serde_json::Value::Null)
    }

    async fn start_proxy(config: AppConfig) -> (Arc<ConnectionManager>, String) {
        let ctx = SessionContext {
            config: Arc::new(config),
            registry: Arc::new(HealthRegistry::new(Default::default())),
            advisory: Arc::new(AdvisoryStore::new()),
            audit: Arc::new(TracingAuditSink),
            metrics: Arc::new(ProxyMetrics::new()),
        };
        let manager = ConnectionManager::new(ctx);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(manager.clone().serve(listener));
        (manager, format!("ws://{addr}"))
    }

    fn test_config(uplink: &str) -> AppConfig {
        let mut config = AppConfig::default();
        config.uplinks.push(UplinkEntry {
            role: Role::Basic,
            url: uplink.to_string(),
            healthy: true,
        });
        config.timeouts.ping_interval_ms = 500;
        config.timeouts.reconnect_backoff_ms = 50;
        config
    }

    async fn recv_text(
        socket: &mut tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<TcpStream>,
        >,
    ) -> String {
        loop {
            let message =
                tokio::time::timeout(std::time::Duration::from_secs(5), socket.next())
                    .await
                    .expect("frame before timeout")
                    .expect("socket open")
                    .expect("frame ok");
            match message {
                Message::Text(text) => return text.to_string(),
                Message::Ping(payload) => {
                    let _ = socket.send(Message::Pong(payload)).await;
                }
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn relays_and_normalizes_end_to_end() {
        let node = spawn_fake_node().await;
        let (_manager, proxy) = start_proxy(test_config(&node)).await;

        let (mut socket, _) = tokio_tungstenite::connect_async(&proxy).await.unwrap();
        socket
            .send(Message::Text(
                r#"{"id":"q1","command":"server_info"}"#.into(),
            ))
            .await
            .unwrap();

        let reply = recv_text(&mut socket).await;
        let value: serde_json::Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(value["id"], serde_json::json!("q1"));
        assert_eq!(
            value["result"]["info"]["complete_ledgers"],
            serde_json::json!("32570-90000000")
        );
    }

    #[tokio::test]
    async fn fee_floors_apply_on_the_inbound_path() {
        let node = spawn_fake_node().await;
        let (_manager, proxy) = start_proxy(test_config(&node)).await;

        let (mut socket, _) = tokio_tungstenite::connect_async(&proxy).await.unwrap();
        socket
            .send(Message::Text(r#"{"command":"fee_probe"}"#.into()))
            .await
            .unwrap();

        let reply = recv_text(&mut socket).await;
        let value: serde_json::Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(value["fee_base"], serde_json::json!(10));
    }

    #[tokio::test]
    async fn state_envelope_reports_connection_state() {
        let node = spawn_fake_node().await;
        let (_manager, proxy) = start_proxy(test_config(&node)).await;

        let (mut socket, _) = tokio_tungstenite::connect_async(&proxy).await.unwrap();
        socket
            .send(Message::Text(r#"{"__api":"state","id":77}"#.into()))
            .await
            .unwrap();

        let reply = recv_text(&mut socket).await;
        let value: serde_json::Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(value["id"], serde_json::json!(77));
        assert_eq!(value["status"], serde_json::json!("CONNECTED"));
        assert_eq!(value["type"], serde_json::json!("PROXY"));
        assert_eq!(value["uplinkType"], serde_json::json!("basic"));
        assert_eq!(value["preferredServer"], serde_json::json!(node));
    }

    #[tokio::test]
    async fn ip_ceiling_refuses_the_next_connection_with_policy_close() {
        let node = spawn_fake_node().await;
        let mut config = test_config(&node);
        config.limits.ip_basic = 1;
        let (manager, proxy) = start_proxy(config).await;

        let (mut first, _) = tokio_tungstenite::connect_async(&proxy).await.unwrap();
        // Let the first registration land in the roster.
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while manager.client_count() < 1 {
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();

        let (mut second, _) = tokio_tungstenite::connect_async(&proxy).await.unwrap();
        let close = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            loop {
                match second.next().await {
                    Some(Ok(Message::Close(frame))) => return frame,
                    Some(Ok(_)) => {}
                    Some(Err(_)) | None => return None,
                }
            }
        })
        .await
        .unwrap();

        let frame = close.expect("close frame with policy code");
        assert_eq!(frame.code, CloseCode::Policy);
        assert_eq!(manager.ctx.metrics.snapshot().connections_total, 1);

        // The surviving client still works.
        first
            .send(Message::Text(r#"{"id":"q","command":"server_info"}"#.into()))
            .await
            .unwrap();
        let reply = recv_text(&mut first).await;
        assert!(reply.contains("complete_ledgers"));
    }

    #[tokio::test]
    async fn upgrade_control_switches_role_and_migrates() {
        let basic_node = spawn_fake_node().await;
        let priority_node = spawn_fake_node().await;
        let mut config = test_config(&basic_node);
        config.uplinks.push(UplinkEntry {
            role: Role::Priority,
            url: priority_node.clone(),
            healthy: true,
        });
        let (_manager, proxy) = start_proxy(config).await;

        let (mut socket, _) = tokio_tungstenite::connect_async(&proxy).await.unwrap();
        socket
            .send(Message::Text(r#"{"__api":"upgrade"}"#.into()))
            .await
            .unwrap();
        socket
            .send(Message::Text(r#"{"__api":"state","id":1}"#.into()))
            .await
            .unwrap();

        let reply = recv_text(&mut socket).await;
        let value: serde_json::Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(value["uplinkType"], serde_json::json!("priority"));
        assert_eq!(value["preferredServer"], serde_json::json!(priority_node));
    }

    /// A node that records every frame it sees (tagged with a connection
    /// sequence number) and drops the socket when told to.
    async fn spawn_scripted_node() -> (String, mpsc::UnboundedReceiver<(usize, String)>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (seen_tx, seen_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut connection = 0usize;
            while let Ok((stream, _)) = listener.accept().await {
                connection += 1;
                let seen_tx = seen_tx.clone();
                tokio::spawn(async move {
                    let Ok(socket) = tokio_tungstenite::accept_async(stream).await else {
                        return;
                    };
                    let (mut sink, mut stream) = socket.split();
                    while let Some(Ok(message)) = stream.next().await {
                        let Message::Text(text) = message else { continue };
                        let _ = seen_tx.send((connection, text.to_string()));
                        if text.contains("drop_me") {
                            break;
                        }
                        if text.contains(FIRST_CONTACT_PROBE_ID) {
                            let reply =
                                format!("{{\"id\":\"{FIRST_CONTACT_PROBE_ID}\",\"result\":{{}}}}");
                            let _ = sink.send(Message::Text(reply.into())).await;
                        }
                    }
                });
            }
        });

        (format!("ws://127.0.0.1:{port}"), seen_rx)
    }

    #[tokio::test]
    async fn after_gone_replacement_sees_subscriptions_then_buffer_in_order() {
        let (node, mut seen) = spawn_scripted_node().await;
        let (_manager, proxy) = start_proxy(test_config(&node)).await;

        let (mut socket, _) = tokio_tungstenite::connect_async(&proxy).await.unwrap();
        socket
            .send(Message::Text(r#"{"command":"subscribe","streams":["ledger"]}"#.into()))
            .await
            .unwrap();

        // Wait for the subscribe to land on the first connection.
        loop {
            let (connection, frame) =
                tokio::time::timeout(std::time::Duration::from_secs(5), seen.recv())
                    .await
                    .unwrap()
                    .unwrap();
            if connection == 1 && frame.contains("\"streams\":[\"ledger\"]") {
                break;
            }
        }

        // Kill the uplink, wait until the session has noticed the loss,
        // then send while disconnected: the frame buffers.
        socket
            .send(Message::Text(r#"{"id":"k","command":"drop_me"}"#.into()))
            .await
            .unwrap();
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            socket
                .send(Message::Text(r#"{"__api":"state"}"#.into()))
                .await
                .unwrap();
            let reply = recv_text(&mut socket).await;
            let value: serde_json::Value = serde_json::from_str(&reply).unwrap();
            // Either the loss is visible (no endpoint) or the replacement
            // has already been adopted; both are safe points to send from.
            if value["endpoint"].is_null() || value["uplinkCount"].as_u64() >= Some(2) {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "uplink loss never noticed");
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        socket
            .send(Message::Text(r#"{"id":"b1","command":"account_info","account":"rA"}"#.into()))
            .await
            .unwrap();

        // On the replacement connection: first-contact probe, then the
        // replayed subscription, then the buffered message. No duplicates.
        let mut replacement_frames = Vec::new();
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(10);
        while replacement_frames.len() < 3 {
            let (connection, frame) =
                tokio::time::timeout_at(deadline, seen.recv()).await.unwrap().unwrap();
            if connection >= 2 && !frame.contains(LIVENESS_PROBE_ID) {
                replacement_frames.push(frame);
            }
        }
        assert!(replacement_frames[0].contains(FIRST_CONTACT_PROBE_ID));
        assert!(replacement_frames[1].contains("REPLAYED_SUBSCRIPTION"));
        assert!(replacement_frames[1].contains("\"streams\":[\"ledger\"]"));
        assert!(replacement_frames[2].contains("\"id\":\"b1\""));
    }

    #[tokio::test]
    async fn migrate_action_moves_bound_clients() {
        let node_a = spawn_fake_node().await;
        let node_b = spawn_fake_node().await;
        let mut config = test_config(&node_a);
        config.uplinks.push(UplinkEntry {
            role: Role::Basic,
            url: node_b.clone(),
            healthy: false,
        });
        let (manager, proxy) = start_proxy(config).await;

        let (mut socket, _) = tokio_tungstenite::connect_async(&proxy).await.unwrap();
        // Wait until the client has adopted node A.
        socket
            .send(Message::Text(r#"{"id":"q","command":"server_info"}"#.into()))
            .await
            .unwrap();
        let _ = recv_text(&mut socket).await;

        // Bring B up and migrate everyone off A.
        manager.set_uplink_status(&node_b, UplinkAction::Up);
        assert_eq!(
            manager.set_uplink_status(&node_a, UplinkAction::Migrate).as_deref(),
            Some(node_a.as_str())
        );

        // The client lands on B: poll its state until the endpoint flips.
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            socket
                .send(Message::Text(r#"{"__api":"state","id":2}"#.into()))
                .await
                .unwrap();
            let reply = recv_text(&mut socket).await;
            let value: serde_json::Value = serde_json::from_str(&reply).unwrap();
            if value["endpoint"] == serde_json::json!(node_b) {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "client never migrated");
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
    }
}
