//! Per-client session task.
//!
//! One session per downstream socket. The session owns the client's links
//! (main plus lazily created auxiliary links), routes every downstream
//! message through the filter, buffers while no uplink is adopted, and
//! consumes the uplink signal stream to drive failover: a replacement uplink
//! is only adopted on its first successful liveness check, the superseded
//! one is retired first, and the buffer flushes exactly once afterwards.
//!
//! All downstream writes (uplink forwards, rejection envelopes, control
//! responses, heartbeat pings) serialize through one writer task, which is
//! what preserves per-client ordering across an uplink switchover.

use crate::{
    advisory::AdvisoryStore,
    audit::SharedAuditSink,
    client::ClientControl,
    config::AppConfig,
    filter::{self, FilterContext, RewriteTable, RouteDecision, UpstreamClass},
    metrics::ProxyMetrics,
    registry::HealthRegistry,
    types::{
        ClientHeaders, ControlCommand, ControlRequest, Counters, Role, StateSnapshot,
    },
    uplink::{
        spawn_uplink, LinkSlot, Normalizer, SubscriptionSet, UplinkEvent, UplinkEventKind,
        UplinkHandle, UplinkParams,
    },
};
use dashmap::DashMap;
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::{net::TcpStream, sync::mpsc};
use tokio_tungstenite::{tungstenite::Message, WebSocketStream};

/// Shared collaborators injected into every session.
#[derive(Clone)]
pub struct SessionContext {
    pub config: Arc<AppConfig>,
    pub registry: Arc<HealthRegistry>,
    pub advisory: Arc<AdvisoryStore>,
    pub audit: SharedAuditSink,
    pub metrics: Arc<ProxyMetrics>,
}

/// Roster entry for one client connection, owned by the connection manager.
pub struct ClientHandle {
    pub id: u64,
    pub ip: String,
    role: RwLock<Role>,
    closed: AtomicBool,
    endpoint: RwLock<Option<String>>,
    control: mpsc::UnboundedSender<ClientControl>,
}

impl ClientHandle {
    #[must_use]
    pub fn new(id: u64, ip: String, control: mpsc::UnboundedSender<ClientControl>) -> Self {
        Self {
            id,
            ip,
            role: RwLock::new(Role::Basic),
            closed: AtomicBool::new(false),
            endpoint: RwLock::new(None),
            control,
        }
    }

    #[must_use]
    pub fn role(&self) -> Role {
        *self.role.read()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    /// Endpoint of the currently adopted main uplink.
    #[must_use]
    pub fn endpoint(&self) -> Option<String> {
        self.endpoint.read().clone()
    }

    /// Asks the session to move its main uplink to a new endpoint.
    pub fn request_migrate(&self) {
        let _ = self.control.send(ClientControl::Migrate);
    }
}

/// Everything a session needs at spawn time.
pub struct SessionParams {
    pub ctx: SessionContext,
    pub socket: WebSocketStream<TcpStream>,
    pub handle: Arc<ClientHandle>,
    pub control_rx: mpsc::UnboundedReceiver<ClientControl>,
    pub headers: ClientHeaders,
    pub roster: Arc<DashMap<u64, Arc<ClientHandle>>>,
    /// Endpoint-tripped notifications toward the connection manager.
    pub tripped: mpsc::UnboundedSender<String>,
}

/// Why a session ended; drives the shutdown log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    DownstreamClosed,
    /// Buffer cap exceeded: the client is stuck, both sides close.
    Stuck,
    HeartbeatLost,
}

/// One link (main or auxiliary): the uplink generation machinery plus its
/// bounded buffers.
struct Link {
    role: Role,
    preferred: String,
    generation: u64,
    active: Option<UplinkHandle>,
    pending: Option<UplinkHandle>,
    buffer: VecDeque<String>,
    recent: VecDeque<String>,
    replay_recent: bool,
    subscriptions: Arc<Mutex<SubscriptionSet>>,
    normalizer: Arc<Normalizer>,
}

impl Link {
    fn new(slot: LinkSlot, role: Role, rewrites: Arc<RewriteTable>) -> Self {
        // Only the default-class link insists on full-history backends;
        // auxiliary pools may legitimately serve partial history.
        let enforce_full_history = !slot.is_aux();
        Self {
            role,
            preferred: String::new(),
            generation: 0,
            active: None,
            pending: None,
            buffer: VecDeque::new(),
            recent: VecDeque::new(),
            replay_recent: false,
            subscriptions: Arc::new(Mutex::new(SubscriptionSet::new())),
            normalizer: Arc::new(Normalizer::new(enforce_full_history, rewrites)),
        }
    }
}

struct Session {
    ctx: SessionContext,
    handle: Arc<ClientHandle>,
    headers: ClientHeaders,
    counters: Arc<Counters>,
    rewrites: Arc<RewriteTable>,
    connect_moment: chrono::DateTime<chrono::Utc>,
    links: HashMap<LinkSlot, Link>,
    writer: mpsc::UnboundedSender<Message>,
    events_tx: mpsc::UnboundedSender<UplinkEvent>,
    timer_tx: mpsc::UnboundedSender<(LinkSlot, u64)>,
    tripped_tx: mpsc::UnboundedSender<String>,
    roster: Arc<DashMap<u64, Arc<ClientHandle>>>,
    missed_heartbeats: u32,
}

/// Runs one client session to completion.
pub async fn run(params: SessionParams) {
    let SessionParams { ctx, socket, handle, mut control_rx, headers, roster, tripped } = params;
    let client_id = handle.id;

    let (sink, mut stream) = socket.split();
    let (writer_tx, writer_rx) = mpsc::unbounded_channel();
    tokio::spawn(write_loop(sink, writer_rx));

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let (timer_tx, mut timer_rx) = mpsc::unbounded_channel();

    let mut session = Session {
        rewrites: Arc::new(RewriteTable::new()),
        counters: Arc::new(Counters::default()),
        connect_moment: chrono::Utc::now(),
        links: HashMap::new(),
        writer: writer_tx,
        events_tx,
        timer_tx,
        tripped_tx: tripped,
        roster,
        missed_heartbeats: 0,
        ctx,
        handle,
        headers,
    };

    // Main link comes up immediately; auxiliary links wait for first use.
    let mut main = Link::new(LinkSlot::Main, session.handle.role(), session.rewrites.clone());
    main.preferred = session.ctx.registry.select(main.role);
    session.links.insert(LinkSlot::Main, main);
    session.connect_link(LinkSlot::Main);

    let mut heartbeat = tokio::time::interval(session.ctx.config.timeouts.heartbeat());
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    heartbeat.tick().await; // immediate first tick; the client just connected

    let end = loop {
        tokio::select! {
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        if let Err(end) = session.on_downstream(text.to_string()) {
                            break end;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        session.missed_heartbeats = 0;
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = session.writer.send(Message::Pong(payload));
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        break SessionEnd::DownstreamClosed;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(error)) => {
                        tracing::debug!(client_id, %error, "downstream socket error");
                        break SessionEnd::DownstreamClosed;
                    }
                }
            }

            Some(event) = events_rx.recv() => {
                if let Err(end) = session.on_uplink_event(event) {
                    break end;
                }
            }

            Some((slot, generation)) = timer_rx.recv() => {
                session.on_reconnect_due(slot, generation);
            }

            Some(control) = control_rx.recv() => {
                match control {
                    ClientControl::Migrate => session.migrate_main(),
                }
            }

            _ = heartbeat.tick() => {
                if session.missed_heartbeats >= 2 {
                    tracing::info!(client_id, "no pong for two heartbeat intervals, terminating");
                    break SessionEnd::HeartbeatLost;
                }
                session.missed_heartbeats += 1;
                let _ = session.writer.send(Message::Ping(Vec::new().into()));
            }
        }
    };

    session.shutdown(end).await;
}

/// Writer task: the only owner of the downstream sink.
async fn write_loop(
    mut sink: SplitSink<WebSocketStream<TcpStream>, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(message) = rx.recv().await {
        let closing = matches!(message, Message::Close(_));
        if sink.send(message).await.is_err() || closing {
            break;
        }
    }
    let _ = sink.close().await;
}

impl Session {
    /// Handles one text frame from the downstream socket.
    fn on_downstream(&mut self, raw: String) -> Result<(), SessionEnd> {
        self.counters.record_tx(raw.len());

        if let Some(control) =
            ControlRequest::parse(&raw, self.ctx.config.limits.control_frame_bytes)
        {
            self.on_control_request(&control);
            return Ok(());
        }

        self.record_recent(LinkSlot::Main, &raw);
        self.relay(raw)
    }

    /// Routes a frame through the filter and dispatches the decision.
    fn relay(&mut self, raw: String) -> Result<(), SessionEnd> {
        let decision = {
            let filter_ctx = FilterContext {
                role: self.handle.role(),
                is_aux: false,
                ip: &self.handle.ip,
                headers: &self.headers,
                advisory: self.ctx.advisory.as_ref(),
                policy: &self.ctx.config.policy,
                rewrites: self.rewrites.as_ref(),
                audit: self.ctx.audit.as_ref(),
                metrics: self.ctx.metrics.as_ref(),
            };
            filter::route(&raw, &filter_ctx)
        };

        match decision {
            RouteDecision::Reject { frame } => {
                let _ = self.writer.send(Message::Text(frame.into()));
                Ok(())
            }
            RouteDecision::Relay { class, frame } => {
                let slot = match class {
                    UpstreamClass::Default => LinkSlot::Main,
                    UpstreamClass::Submit => LinkSlot::Submit,
                    UpstreamClass::Path => LinkSlot::Path,
                    UpstreamClass::NonFh => LinkSlot::NonFh,
                };
                self.dispatch(slot, frame)
            }
        }
    }

    /// Sends a frame on a link, buffering while no uplink is adopted.
    fn dispatch(&mut self, slot: LinkSlot, frame: String) -> Result<(), SessionEnd> {
        self.ensure_link(slot);
        if slot.is_aux() {
            self.record_recent(slot, &frame);
        }

        let buffer_cap = self.ctx.config.limits.message_buffer;
        let client_id = self.handle.id;
        let Some(link) = self.links.get_mut(&slot) else {
            return Ok(());
        };

        let frame = if let Some(active) = &link.active {
            match active.send(frame) {
                Ok(()) => {
                    self.ctx.metrics.record_relay();
                    return Ok(());
                }
                Err(frame) => {
                    // Uplink died under us; its Gone signal is in flight.
                    link.active = None;
                    frame
                }
            }
        } else {
            frame
        };

        link.buffer.push_back(frame);
        tracing::debug!(client_id, slot = ?slot, buffered = link.buffer.len(), "uplink not open, message buffered");
        if link.buffer.len() > buffer_cap {
            tracing::warn!(client_id, slot = ?slot, "outbound buffer cap exceeded, closing stuck client");
            return Err(SessionEnd::Stuck);
        }
        Ok(())
    }

    /// Records a frame in a link's recent-command ring (pings excluded).
    fn record_recent(&mut self, slot: LinkSlot, frame: &str) {
        if frame.contains("\"command\":\"ping\"") {
            return;
        }
        let cap = self.ctx.config.limits.command_history;
        if let Some(link) = self.links.get_mut(&slot) {
            link.recent.push_back(frame.to_string());
            while link.recent.len() > cap {
                link.recent.pop_front();
            }
        }
    }

    /// Creates an auxiliary link on first use.
    fn ensure_link(&mut self, slot: LinkSlot) {
        if self.links.contains_key(&slot) {
            return;
        }
        let role = match slot {
            LinkSlot::Main => return,
            LinkSlot::Submit => Role::Submit,
            LinkSlot::NonFh => Role::NonFh,
            LinkSlot::Path => Role::Path,
            LinkSlot::Reporting => Role::Reporting,
        };
        tracing::debug!(client_id = self.handle.id, slot = ?slot, "creating auxiliary link");
        let mut link = Link::new(slot, role, self.rewrites.clone());
        link.preferred = self.ctx.registry.select(role);
        self.links.insert(slot, link);
        self.connect_link(slot);
    }

    /// Spawns a new uplink generation for a link.
    fn connect_link(&mut self, slot: LinkSlot) {
        if self.handle.is_closed() {
            return;
        }
        let Some(link) = self.links.get_mut(&slot) else {
            return;
        };
        if link.preferred.is_empty() {
            link.preferred = self.ctx.registry.select(link.role);
        }
        link.generation += 1;
        let handle = spawn_uplink(UplinkParams {
            endpoint: link.preferred.clone(),
            slot,
            generation: link.generation,
            client_id: self.handle.id,
            ip: self.handle.ip.clone(),
            timeouts: self.ctx.config.timeouts.clone(),
            register_cap: self.ctx.config.limits.subscription_register_bytes,
            subscriptions: link.subscriptions.clone(),
            normalizer: link.normalizer.clone(),
            counters: self.counters.clone(),
            registry: self.ctx.registry.clone(),
            downstream: self.writer.clone(),
            events: self.events_tx.clone(),
            tripped: self.tripped_tx.clone(),
        });
        link.pending = Some(handle);
    }

    /// Consumes one uplink signal.
    fn on_uplink_event(&mut self, event: UplinkEvent) -> Result<(), SessionEnd> {
        let client_id = self.handle.id;
        let Some(link) = self.links.get_mut(&event.slot) else {
            return Ok(());
        };

        match event.kind {
            UplinkEventKind::Open => Ok(()),

            UplinkEventKind::FirstLive => {
                if event.generation != link.generation {
                    // A superseded candidate came alive; dropping its handle
                    // below closes it on purpose.
                    tracing::debug!(client_id, generation = event.generation, "stale uplink came alive, discarding");
                    return Ok(());
                }
                let Some(fresh) = link.pending.take() else {
                    return Ok(());
                };
                if let Some(old) = link.active.take() {
                    tracing::debug!(client_id, from = %old.endpoint, to = %fresh.endpoint, "switching uplinks");
                    old.close(true);
                }
                if event.slot == LinkSlot::Main {
                    *self.handle.endpoint.write() = Some(fresh.endpoint.clone());
                }
                if link.generation > 1 {
                    self.counters.record_reconnect();
                }
                link.active = Some(fresh);

                // A node-unsuitable reselect replays the recent commands
                // instead of waiting for client retransmission.
                if link.replay_recent {
                    link.replay_recent = false;
                    let recent: Vec<String> = link.recent.iter().cloned().collect();
                    tracing::debug!(client_id, frames = recent.len(), "replaying recent commands on new uplink");
                    if let Some(active) = &link.active {
                        for frame in recent {
                            let _ = active.send(frame);
                        }
                    }
                }

                // Flush the buffer exactly once, in order. Main-link frames
                // go back through the filter; auxiliary frames were already
                // filtered when they were first dispatched.
                let buffered: Vec<String> = link.buffer.drain(..).collect();
                if !buffered.is_empty() {
                    tracing::debug!(client_id, frames = buffered.len(), "flushing buffered messages");
                }
                if event.slot == LinkSlot::Main {
                    for frame in buffered {
                        self.relay(frame)?;
                    }
                } else {
                    for frame in buffered {
                        self.dispatch(event.slot, frame)?;
                    }
                }
                Ok(())
            }

            UplinkEventKind::Gone(reason) => {
                if let Some(active) = &link.active {
                    if active.generation == event.generation {
                        link.active = None;
                        if event.slot == LinkSlot::Main {
                            *self.handle.endpoint.write() = None;
                        }
                    }
                }
                if let Some(pending) = &link.pending {
                    if pending.generation == event.generation {
                        link.pending = None;
                    }
                }
                if event.generation != link.generation {
                    return Ok(());
                }

                if reason.replay_recent() {
                    link.replay_recent = true;
                }
                link.preferred = self.ctx.registry.select(link.role);
                let backoff = self.ctx.config.timeouts.reconnect_backoff();
                tracing::debug!(
                    client_id,
                    slot = ?event.slot,
                    reason = ?reason,
                    retry_ms = backoff.as_millis() as u64,
                    next = %link.preferred,
                    "uplink gone, reconnecting after backoff"
                );

                let timer_tx = self.timer_tx.clone();
                let generation = link.generation;
                let slot = event.slot;
                tokio::spawn(async move {
                    tokio::time::sleep(backoff).await;
                    let _ = timer_tx.send((slot, generation));
                });
                Ok(())
            }

            UplinkEventKind::Closed => Ok(()),
        }
    }

    /// Reconnect backoff expired; connect a replacement if nothing newer
    /// took over in the meantime. An older uplink may still be serving
    /// (a failed migration candidate); the replacement supersedes it on
    /// its first liveness check.
    fn on_reconnect_due(&mut self, slot: LinkSlot, generation: u64) {
        if self.handle.is_closed() {
            return;
        }
        let Some(link) = self.links.get_mut(&slot) else {
            return;
        };
        if link.generation != generation || link.pending.is_some() {
            return;
        }
        tracing::debug!(client_id = self.handle.id, slot = ?slot, "reconnecting uplink");
        self.connect_link(slot);
    }

    /// Handles the out-of-band `__api` envelope.
    fn on_control_request(&mut self, request: &ControlRequest) {
        match request.command {
            ControlCommand::State => {
                let main = self.links.get(&LinkSlot::Main);
                let snapshot = StateSnapshot {
                    id: request.id.clone(),
                    status: "CONNECTED",
                    kind: "PROXY",
                    endpoint: main
                        .and_then(|link| link.active.as_ref())
                        .map(|uplink| uplink.endpoint.clone()),
                    preferred_server: main.map(|link| link.preferred.clone()).unwrap_or_default(),
                    uplink_type: self.handle.role(),
                    counters: self.counters.snapshot(),
                    headers: self.headers.clone(),
                    uplink_count: main.map(|link| link.generation).unwrap_or_default(),
                    connect_moment: self.connect_moment,
                };
                let _ = self.writer.send(Message::Text(snapshot.to_frame().into()));
            }
            ControlCommand::Upgrade => self.set_role(Role::Priority),
            ControlCommand::Downgrade => self.set_role(Role::Basic),
        }
    }

    /// Applies a role change and forces an uplink migration.
    fn set_role(&mut self, role: Role) {
        if self.handle.role() == role {
            return;
        }
        tracing::info!(client_id = self.handle.id, role = %role, "client role change");
        *self.handle.role.write() = role;
        if let Some(link) = self.links.get_mut(&LinkSlot::Main) {
            link.role = role;
        }
        self.migrate_main();
    }

    /// Picks a fresh endpoint for the main link and opens a replacement
    /// uplink; the old one keeps serving until the replacement is sane.
    fn migrate_main(&mut self) {
        let Some(link) = self.links.get_mut(&LinkSlot::Main) else {
            return;
        };
        link.preferred = self.ctx.registry.select(link.role);
        tracing::debug!(client_id = self.handle.id, to = %link.preferred, "migrating main uplink");
        self.connect_link(LinkSlot::Main);
    }

    /// Tears the session down: roster removal, grace delay, uplink closes.
    async fn shutdown(self, end: SessionEnd) {
        let client_id = self.handle.id;
        tracing::info!(client_id, reason = ?end, "client session closing");

        self.handle.closed.store(true, Ordering::Relaxed);
        self.roster.remove(&client_id);
        self.ctx.metrics.record_disconnect();

        if end != SessionEnd::DownstreamClosed {
            let _ = self.writer.send(Message::Close(None));
        }

        // Grace delay lets in-flight sends complete before the uplinks go.
        tokio::time::sleep(self.ctx.config.timeouts.close_grace()).await;
        for link in self.links.values() {
            if let Some(active) = &link.active {
                active.close(true);
            }
            if let Some(pending) = &link.pending {
                pending.close(true);
            }
        }
    }
}
