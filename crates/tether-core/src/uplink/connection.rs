//! The uplink connection task.
//!
//! Owns one upstream WebSocket for one client link. The task drives the
//! `Connecting → Open → Sane → Closing → Closed` state machine; the owning
//! client connection holds an [`UplinkHandle`] and consumes
//! [`UplinkEvent`]s. An uplink never reconnects itself: it reports `Gone`
//! exactly once and dies, and the owner decides what replaces it.

use super::{
    normalize::{Inbound, Normalizer},
    subscriptions::SubscriptionSet,
    GoneReason, LinkSlot, UplinkCommand, UplinkError, UplinkEvent, UplinkEventKind, UplinkState,
};
use crate::{
    config::TimeoutsConfig,
    registry::HealthRegistry,
    types::{Counters, FIRST_CONTACT_PROBE_ID, LIVENESS_PROBE_ID},
};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{client::IntoClientRequest, http::HeaderValue, Message};

/// Everything an uplink task needs at spawn time.
pub struct UplinkParams {
    pub endpoint: String,
    pub slot: LinkSlot,
    pub generation: u64,
    /// Client id, for log correlation only.
    pub client_id: u64,
    /// Downstream client IP, forwarded to the upstream node.
    pub ip: String,
    pub timeouts: TimeoutsConfig,
    /// Frames longer than this skip subscription bookkeeping.
    pub register_cap: usize,
    pub subscriptions: Arc<Mutex<SubscriptionSet>>,
    pub normalizer: Arc<Normalizer>,
    pub counters: Arc<Counters>,
    pub registry: Arc<HealthRegistry>,
    /// Writer-task channel for the downstream socket.
    pub downstream: mpsc::UnboundedSender<Message>,
    /// Signal channel back to the owning client connection.
    pub events: mpsc::UnboundedSender<UplinkEvent>,
    /// Endpoint-tripped notifications toward the connection manager.
    pub tripped: mpsc::UnboundedSender<String>,
}

/// Owner-side handle to a spawned uplink task.
#[derive(Debug, Clone)]
pub struct UplinkHandle {
    pub endpoint: String,
    pub generation: u64,
    commands: mpsc::UnboundedSender<UplinkCommand>,
}

impl UplinkHandle {
    /// Relays a frame upstream. When the task is already gone the frame
    /// comes back so the caller can re-buffer it.
    pub fn send(&self, frame: String) -> Result<(), String> {
        self.commands.send(UplinkCommand::Send(frame)).map_err(|rejected| match rejected.0 {
            UplinkCommand::Send(frame) => frame,
            UplinkCommand::Close { .. } => String::new(),
        })
    }

    /// Requests teardown. Closing on purpose suppresses the `Gone` signal.
    pub fn close(&self, on_purpose: bool) {
        let _ = self.commands.send(UplinkCommand::Close { on_purpose });
    }
}

/// Spawns the connection task and returns its handle.
#[must_use]
pub fn spawn_uplink(params: UplinkParams) -> UplinkHandle {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let handle = UplinkHandle {
        endpoint: params.endpoint.clone(),
        generation: params.generation,
        commands: command_tx,
    };
    tokio::spawn(run(params, command_rx));
    handle
}

/// Builds the upstream connect request, attaching the forwarded-for and
/// user identification headers.
fn build_request(
    endpoint: &str,
    ip: &str,
) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request, UplinkError> {
    let mut request = endpoint
        .into_client_request()
        .map_err(|e| UplinkError::InvalidEndpoint(e.to_string()))?;
    if let Ok(value) = HeaderValue::from_str(ip) {
        request.headers_mut().insert("X-Forwarded-For", value.clone());
        request.headers_mut().insert("X-User", value);
    }
    Ok(request)
}

struct Task {
    params: UplinkParams,
    state: UplinkState,
}

impl Task {
    fn emit(&self, kind: UplinkEventKind) {
        let _ = self.params.events.send(UplinkEvent {
            slot: self.params.slot,
            generation: self.params.generation,
            kind,
        });
    }

    /// Penalizes the endpoint; a trip notification goes to the manager so
    /// every client bound to the endpoint migrates.
    fn penalize(&self) {
        let verdict = self.params.registry.note_error(&self.params.endpoint);
        if verdict.tripped_now {
            let _ = self.params.tripped.send(self.params.endpoint.clone());
        }
    }

    fn gone(&mut self, reason: GoneReason) {
        self.state = UplinkState::Closing;
        self.emit(UplinkEventKind::Gone(reason));
    }
}

async fn run(params: UplinkParams, mut command_rx: mpsc::UnboundedReceiver<UplinkCommand>) {
    let mut task = Task { params, state: UplinkState::Connecting };
    let endpoint = task.params.endpoint.clone();
    let client_id = task.params.client_id;

    tracing::debug!(client_id, endpoint = %endpoint, generation = task.params.generation, "uplink connecting");

    let request = match build_request(&endpoint, &task.params.ip) {
        Ok(request) => request,
        Err(error) => {
            tracing::warn!(client_id, endpoint = %endpoint, %error, "uplink endpoint unusable");
            task.gone(GoneReason::ConnectFailed);
            task.emit(UplinkEventKind::Closed);
            return;
        }
    };

    let socket = match tokio::time::timeout(
        task.params.timeouts.connect(),
        tokio_tungstenite::connect_async(request),
    )
    .await
    {
        Err(_) => {
            tracing::warn!(client_id, endpoint = %endpoint, "uplink connect timeout");
            task.penalize();
            task.gone(GoneReason::ConnectTimeout);
            task.emit(UplinkEventKind::Closed);
            return;
        }
        Ok(Err(error)) => {
            tracing::warn!(client_id, endpoint = %endpoint, %error, "uplink connect failed");
            task.penalize();
            task.gone(GoneReason::ConnectFailed);
            task.emit(UplinkEventKind::Closed);
            return;
        }
        Ok(Ok((socket, _response))) => socket,
    };

    task.state = UplinkState::Open;
    task.emit(UplinkEventKind::Open);
    tracing::debug!(client_id, endpoint = %endpoint, "uplink open");

    let (mut sink, mut stream) = socket.split();

    // First-contact probe: the reply (any inbound payload, in fact) is what
    // promotes this connection to Sane.
    let first_contact =
        format!("{{\"id\":\"{FIRST_CONTACT_PROBE_ID}\",\"command\":\"ping\"}}");
    if sink.send(Message::Text(first_contact.into())).await.is_err() {
        task.penalize();
        task.gone(GoneReason::TransportError);
        task.emit(UplinkEventKind::Closed);
        return;
    }

    // Replay the accumulated subscription set, re-tagged so the frames are
    // not re-registered as fresh subscriptions.
    let replay = task.params.subscriptions.lock().replay_frames();
    if !replay.is_empty() {
        tracing::debug!(client_id, endpoint = %endpoint, subscriptions = replay.len(), "replaying subscriptions");
    }
    for frame in replay {
        if sink.send(Message::Text(frame.into())).await.is_err() {
            task.penalize();
            task.gone(GoneReason::TransportError);
            task.emit(UplinkEventKind::Closed);
            return;
        }
    }

    let liveness_probe = format!("{{\"id\":\"{LIVENESS_PROBE_ID}\",\"command\":\"ping\"}}");
    let mut ping = tokio::time::interval(task.params.timeouts.ping_interval());
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping.tick().await; // the first tick fires immediately; the probe just went out

    let mut deadline = tokio::time::Instant::now() + task.params.timeouts.first_contact();
    let mut closed_on_purpose = false;

    loop {
        tokio::select! {
            () = tokio::time::sleep_until(deadline) => {
                let reason = if task.state == UplinkState::Sane {
                    tracing::warn!(client_id, endpoint = %endpoint, "no uplink payload within pong window, assuming gone");
                    GoneReason::PongTimeout
                } else {
                    tracing::warn!(client_id, endpoint = %endpoint, "no first payload from fresh uplink, discarding");
                    GoneReason::FirstContactTimeout
                };
                task.penalize();
                task.gone(reason);
                break;
            }

            _ = ping.tick() => {
                if sink.send(Message::Text(liveness_probe.clone().into())).await.is_err() {
                    task.penalize();
                    task.gone(GoneReason::TransportError);
                    break;
                }
            }

            command = command_rx.recv() => {
                match command {
                    Some(UplinkCommand::Send(frame)) => {
                        if frame.len() <= task.params.register_cap {
                            task.params.subscriptions.lock().register(&frame);
                        }
                        if sink.send(Message::Text(frame.into())).await.is_err() {
                            task.penalize();
                            task.gone(GoneReason::TransportError);
                            break;
                        }
                    }
                    Some(UplinkCommand::Close { on_purpose }) => {
                        closed_on_purpose = on_purpose;
                        task.state = UplinkState::Closing;
                        break;
                    }
                    // Owner dropped the handle entirely; treat as purposeful.
                    None => {
                        closed_on_purpose = true;
                        task.state = UplinkState::Closing;
                        break;
                    }
                }
            }

            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        deadline = tokio::time::Instant::now() + task.params.timeouts.pong_window();
                        if task.state != UplinkState::Sane {
                            task.state = UplinkState::Sane;
                            task.emit(UplinkEventKind::FirstLive);
                            tracing::debug!(client_id, endpoint = %endpoint, "first uplink payload, connection sane");
                        }
                        match task.params.normalizer.process(&text) {
                            Inbound::Internal => {}
                            Inbound::Forward(frame) => {
                                task.params.counters.record_rx(frame.len());
                                let _ = task.params.downstream.send(Message::Text(frame.into()));
                            }
                            Inbound::Unsuitable(unsuitability) => {
                                tracing::warn!(client_id, endpoint = %endpoint, reason = %unsuitability, "uplink node unsuitable, reselecting");
                                task.penalize();
                                task.gone(GoneReason::Unsuitable(unsuitability));
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = sink.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        deadline = tokio::time::Instant::now() + task.params.timeouts.pong_window();
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        if !closed_on_purpose {
                            tracing::debug!(client_id, endpoint = %endpoint, "uplink closed by remote");
                            task.penalize();
                            task.gone(GoneReason::RemoteClosed);
                        }
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(error)) => {
                        tracing::warn!(client_id, endpoint = %endpoint, %error, "uplink transport error");
                        task.penalize();
                        task.gone(GoneReason::TransportError);
                        break;
                    }
                }
            }
        }
    }

    // Teardown is idempotent: a close frame if the sink still works, then
    // the final signal.
    let _ = sink.send(Message::Close(None)).await;
    let _ = sink.close().await;
    task.state = UplinkState::Closed;
    task.emit(UplinkEventKind::Closed);
    tracing::debug!(client_id, endpoint = %endpoint, on_purpose = closed_on_purpose, "uplink closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::PenaltyConfig,
        filter::RewriteTable,
        types::Role,
        uplink::Unsuitability,
    };
    use tokio::net::TcpListener;

    struct Fixture {
        registry: Arc<HealthRegistry>,
        downstream_rx: mpsc::UnboundedReceiver<Message>,
        events_rx: mpsc::UnboundedReceiver<UplinkEvent>,
        tripped_rx: mpsc::UnboundedReceiver<String>,
        handle: UplinkHandle,
    }

    fn short_timeouts() -> TimeoutsConfig {
        TimeoutsConfig {
            connect_ms: 1000,
            ping_interval_ms: 200,
            pong_window_ms: 5000,
            reconnect_backoff_ms: 10,
            heartbeat_ms: 5000,
            first_contact_ms: 2000,
            close_grace_ms: 10,
        }
    }

    fn connect(endpoint: &str, timeouts: TimeoutsConfig) -> Fixture {
        let registry = Arc::new(HealthRegistry::new(PenaltyConfig::default()));
        registry.add(Role::Basic, endpoint, true);
        let subscriptions = Arc::new(Mutex::new(SubscriptionSet::new()));
        let (downstream_tx, downstream_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (tripped_tx, tripped_rx) = mpsc::unbounded_channel();

        let handle = spawn_uplink(UplinkParams {
            endpoint: endpoint.to_string(),
            slot: LinkSlot::Main,
            generation: 1,
            client_id: 1,
            ip: "192.0.2.1".to_string(),
            timeouts,
            register_cap: 1024 * 1024,
            subscriptions,
            normalizer: Arc::new(Normalizer::new(false, Arc::new(RewriteTable::new()))),
            counters: Arc::new(Counters::default()),
            registry: registry.clone(),
            downstream: downstream_tx,
            events: events_tx,
            tripped: tripped_tx,
        });

        Fixture { registry, downstream_rx, events_rx, tripped_rx, handle }
    }

    async fn next_kind(fixture: &mut Fixture) -> UplinkEventKind {
        tokio::time::timeout(std::time::Duration::from_secs(5), fixture.events_rx.recv())
            .await
            .expect("event before timeout")
            .expect("events channel open")
            .kind
    }

    /// A fake upstream node: answers the first-contact probe, echoes
    /// nothing else, records what it receives.
    async fn spawn_fake_node() -> (String, mpsc::UnboundedReceiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (seen_tx, seen_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let seen_tx = seen_tx.clone();
                tokio::spawn(async move {
                    let Ok(socket) = tokio_tungstenite::accept_async(stream).await else {
                        return;
                    };
                    let (mut sink, mut stream) = socket.split();
                    while let Some(Ok(message)) = stream.next().await {
                        if let Message::Text(text) = message {
                            let _ = seen_tx.send(text.to_string());
                            if text.contains(FIRST_CONTACT_PROBE_ID) {
                                let reply = format!(
                                    "{{\"id\":\"{FIRST_CONTACT_PROBE_ID}\",\"result\":{{}}}}"
                                );
                                let _ = sink.send(Message::Text(reply.into())).await;
                            }
                        }
                    }
                });
            }
        });

        (format!("ws://127.0.0.1:{port}"), seen_rx)
    }

    #[tokio::test]
    async fn connect_failure_penalizes_and_reports_gone() {
        // Nothing listens on this port.
        let endpoint = "ws://127.0.0.1:9".to_string();
        let mut fixture = connect(&endpoint, short_timeouts());

        assert!(matches!(
            next_kind(&mut fixture).await,
            UplinkEventKind::Gone(GoneReason::ConnectFailed | GoneReason::ConnectTimeout)
        ));
        assert_eq!(next_kind(&mut fixture).await, UplinkEventKind::Closed);
        assert_eq!(fixture.registry.list(Role::Basic)[0].penalty_count, 1);
    }

    #[tokio::test]
    async fn open_then_first_live_then_purposeful_close() {
        let (endpoint, mut seen) = spawn_fake_node().await;
        let mut fixture = connect(&endpoint, short_timeouts());

        assert_eq!(next_kind(&mut fixture).await, UplinkEventKind::Open);
        assert_eq!(next_kind(&mut fixture).await, UplinkEventKind::FirstLive);

        // The first frame the node saw is the first-contact probe.
        let first = seen.recv().await.unwrap();
        assert!(first.contains(FIRST_CONTACT_PROBE_ID));

        fixture.handle.close(true);
        assert_eq!(next_kind(&mut fixture).await, UplinkEventKind::Closed);
        // Closing on purpose suppresses Gone entirely.
        assert!(fixture.events_rx.try_recv().is_err());
        assert_eq!(fixture.registry.list(Role::Basic)[0].penalty_count, 0);
    }

    #[tokio::test]
    async fn subscriptions_replay_on_open_and_sends_register() {
        let (endpoint, mut seen) = spawn_fake_node().await;

        let subscriptions = Arc::new(Mutex::new(SubscriptionSet::new()));
        subscriptions.lock().register(r#"{"command":"subscribe","streams":["ledger"]}"#);
        let registry = Arc::new(HealthRegistry::new(PenaltyConfig::default()));
        registry.add(Role::Basic, &endpoint, true);
        let (downstream_tx, _downstream_rx) = mpsc::unbounded_channel();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (tripped_tx, _tripped_rx) = mpsc::unbounded_channel();
        let handle = spawn_uplink(UplinkParams {
            endpoint: endpoint.clone(),
            slot: LinkSlot::Main,
            generation: 2,
            client_id: 1,
            ip: "192.0.2.1".to_string(),
            timeouts: short_timeouts(),
            register_cap: 1024 * 1024,
            subscriptions: subscriptions.clone(),
            normalizer: Arc::new(Normalizer::new(false, Arc::new(RewriteTable::new()))),
            counters: Arc::new(Counters::default()),
            registry,
            downstream: downstream_tx,
            events: events_tx,
            tripped: tripped_tx,
        });

        // Wait for FirstLive so the node has certainly seen the replay.
        loop {
            let event = tokio::time::timeout(
                std::time::Duration::from_secs(5),
                events_rx.recv(),
            )
            .await
            .unwrap()
            .unwrap();
            if event.kind == UplinkEventKind::FirstLive {
                break;
            }
        }

        // The node sees the replayed subscription (tagged) shortly after the
        // first-contact probe.
        loop {
            let frame =
                tokio::time::timeout(std::time::Duration::from_secs(5), seen.recv())
                    .await
                    .expect("replay frame before timeout")
                    .expect("node channel open");
            if frame.contains("REPLAYED_SUBSCRIPTION") {
                assert!(frame.contains("\"streams\":[\"ledger\"]"));
                break;
            }
        }

        // A fresh subscribe sent through the handle registers in the set.
        handle
            .send(r#"{"command":"subscribe","streams":["transactions"]}"#.to_string())
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert_eq!(subscriptions.lock().len(), 2);
        handle.close(true);
    }

    #[tokio::test]
    async fn unsuitable_payload_penalizes_and_reselects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("ws://127.0.0.1:{}", listener.local_addr().unwrap().port());

        // A node that answers every frame with a busy error.
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let Ok(socket) = tokio_tungstenite::accept_async(stream).await else {
                        return;
                    };
                    let (mut sink, mut stream) = socket.split();
                    while let Some(Ok(message)) = stream.next().await {
                        if matches!(message, Message::Text(_)) {
                            let reply = r#"{"error":"tooBusy","status":"error"}"#;
                            let _ = sink.send(Message::Text(reply.into())).await;
                        }
                    }
                });
            }
        });

        let mut fixture = connect(&endpoint, short_timeouts());
        assert_eq!(next_kind(&mut fixture).await, UplinkEventKind::Open);
        assert_eq!(next_kind(&mut fixture).await, UplinkEventKind::FirstLive);
        assert_eq!(
            next_kind(&mut fixture).await,
            UplinkEventKind::Gone(GoneReason::Unsuitable(Unsuitability::NodeBusy(
                "tooBusy".to_string()
            )))
        );
        assert_eq!(next_kind(&mut fixture).await, UplinkEventKind::Closed);
        assert_eq!(fixture.registry.list(Role::Basic)[0].penalty_count, 1);
        // Nothing was forwarded downstream.
        assert!(fixture.downstream_rx.try_recv().is_err());
        drop(fixture.tripped_rx);
    }

    #[tokio::test]
    async fn second_failure_trips_and_notifies_migration() {
        let endpoint = "ws://127.0.0.1:9".to_string();
        let mut first = connect(&endpoint, short_timeouts());
        while !matches!(next_kind(&mut first).await, UplinkEventKind::Closed) {}

        let registry = first.registry.clone();
        let subscriptions = Arc::new(Mutex::new(SubscriptionSet::new()));
        let (downstream_tx, _downstream_rx) = mpsc::unbounded_channel();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (tripped_tx, mut tripped_rx) = mpsc::unbounded_channel();
        let _handle = spawn_uplink(UplinkParams {
            endpoint: endpoint.clone(),
            slot: LinkSlot::Main,
            generation: 2,
            client_id: 1,
            ip: "192.0.2.1".to_string(),
            timeouts: short_timeouts(),
            register_cap: 1024,
            subscriptions,
            normalizer: Arc::new(Normalizer::new(false, Arc::new(RewriteTable::new()))),
            counters: Arc::new(Counters::default()),
            registry: registry.clone(),
            downstream: downstream_tx,
            events: events_tx,
            tripped: tripped_tx,
        });

        loop {
            let event = tokio::time::timeout(
                std::time::Duration::from_secs(5),
                events_rx.recv(),
            )
            .await
            .unwrap()
            .unwrap();
            if event.kind == UplinkEventKind::Closed {
                break;
            }
        }

        // Second consecutive failure crossed the threshold: tripped and
        // flagged for migration.
        assert_eq!(
            tokio::time::timeout(std::time::Duration::from_secs(1), tripped_rx.recv())
                .await
                .unwrap()
                .as_deref(),
            Some(endpoint.as_str())
        );
        assert!(!registry.is_selectable(&endpoint));
    }
}
