//! Connection state machine.
//!
//! [`SessionCore`] owns every piece of mutable session state: connection
//! state, the live transport, reconnection backoff, the stored player
//! session, the admission queue, the last server status and the pose batcher.
//! It is driven by three kinds of input, all funneled through one owner:
//! application calls, transport events, and timer ticks. Nothing here sleeps;
//! timers are exposed as deadlines for the owner to wait on.
//!
//! Transitions:
//!
//! ```text
//! Disconnected --connect()--------------------> Connecting
//! Connecting   --transport connected----------> Connected
//! Connected    --queueUpdate(position > 0)----> Queued
//! Queued       --queueUpdate(position == 0)---> Connected   (QUEUE_READY)
//! linked       --link lost / server close-----> Disconnected (backoff if server close)
//! any          --init / handshake failure-----> Error(kind)
//! any          --disconnect()-----------------> Disconnected
//! ```

use std::{sync::Arc, time::Duration};

use netsync_shared::{
    config::ClientConfig,
    event::{
        ConnectionError, ConnectionStateChange, EventBus, GameEvent, JoinAccepted, PlayersUpdate,
        QueueReady, QueueUpdate, ServerStatusChange, ServerStatusUpdate,
    },
    net::{ClientMsg, QueueUpdateMsg, ServerMsg, TransportError},
    state::{ConnectionState, ErrorKind},
    status::ServerStatusSnapshot,
};
use tokio::{
    sync::{mpsc, watch},
    time::Instant,
};
use tracing::{debug, error, info, warn};

use crate::{
    action::GameAction,
    error::{Result, SessionError},
    pose::{PoseBatcher, PoseSample},
    queue::{AdmissionQueue, QueueSignal},
    reconnect::{ReconnectExhausted, ReconnectPolicy},
    session::SessionStore,
    status::StatusTracker,
    transport::{ConnectOptions, EventSink, Transport, TransportEvent, TransportFactory},
};

/// Receiving end of all transport events, tagged with transport generation.
pub type TransportEvents = mpsc::UnboundedReceiver<(u64, TransportEvent)>;

pub struct SessionCore {
    bus: EventBus,
    factory: Arc<dyn TransportFactory>,
    events_tx: mpsc::UnboundedSender<(u64, TransportEvent)>,

    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,

    transport: Option<Arc<dyn Transport>>,
    options: Option<ConnectOptions>,
    /// Bumped whenever the transport is replaced or dropped.
    generation: u64,

    reconnect: ReconnectPolicy,
    reconnect_at: Option<Instant>,

    session: SessionStore,
    queue: AdmissionQueue,
    status: StatusTracker,
    pose: PoseBatcher,
    local_player_id: Option<String>,
}

impl SessionCore {
    pub fn new(
        cfg: &ClientConfig,
        bus: EventBus,
        factory: Arc<dyn TransportFactory>,
    ) -> (Self, TransportEvents) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let core = Self {
            bus,
            factory,
            events_tx,
            state: ConnectionState::Disconnected,
            state_tx,
            transport: None,
            options: None,
            generation: 0,
            reconnect: ReconnectPolicy::new(&cfg.reconnect),
            reconnect_at: None,
            session: SessionStore::new(),
            queue: AdmissionQueue::new(),
            status: StatusTracker::new(cfg.status.stale_after()),
            pose: PoseBatcher::new(&cfg.pose),
            local_player_id: None,
        };
        (core, events_rx)
    }

    // ─── Queries ───

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn transport(&self) -> Option<&Arc<dyn Transport>> {
        self.transport.as_ref()
    }

    pub fn session(&self) -> &SessionStore {
        &self.session
    }

    pub fn queue(&self) -> &AdmissionQueue {
        &self.queue
    }

    pub fn server_status(&self) -> Option<&ServerStatusSnapshot> {
        self.status.snapshot()
    }

    pub fn local_player_id(&self) -> Option<&str> {
        self.local_player_id.as_deref()
    }

    /// When the pending reconnection attempt is due, if one is scheduled.
    pub fn reconnect_deadline(&self) -> Option<Instant> {
        self.reconnect_at
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect.attempts()
    }

    pub fn pose_flush_interval(&self) -> Option<Duration> {
        self.pose.flush_interval()
    }

    /// When the server will be presumed offline unless a fresh status arrives.
    pub fn status_deadline(&self) -> Option<Instant> {
        self.status.stale_at()
    }

    /// Re-evaluates presumed-online without polling the server.
    pub fn check_status(&mut self, now: Instant) {
        self.observe_status(now);
    }

    /// False without a fresh `serverStatus`, even if the link is up.
    pub fn is_server_online(&self, now: Instant) -> bool {
        self.status.is_online(now, self.link_up())
    }

    fn link_up(&self) -> bool {
        self.state.is_linked() && self.transport.as_ref().is_some_and(|t| t.is_connected())
    }

    // ─── Application calls ───

    /// Connects, or returns the live transport if one matching `options` is
    /// already connecting or connected. A different kind of transport
    /// replaces the current one.
    pub async fn connect(&mut self, options: ConnectOptions, now: Instant) -> Result<Arc<dyn Transport>> {
        self.cancel_reconnect();

        if let Some(existing) = self.transport.clone() {
            let active = matches!(
                self.state,
                ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Queued
            );
            if active && self.options.as_ref() == Some(&options) {
                debug!(transport = %existing.id(), "Already connected, reusing transport");
                return Ok(existing);
            }
            self.teardown().await;
        }

        self.reconnect.reset();
        match self.open(options, now) {
            Ok(transport) => Ok(transport),
            Err(e) => {
                self.enter_error(ErrorKind::TransportInit, e.to_string());
                Err(SessionError::TransportInit(e))
            }
        }
    }

    /// Intentional disconnect. Forgets the session and cancels pending work.
    pub async fn disconnect(&mut self, now: Instant) {
        info!(state = %self.state, "Disconnecting");
        self.cancel_reconnect();
        self.reconnect.reset();
        self.session.clear();
        self.pose.reset();
        self.queue.reset();
        self.teardown().await;
        self.local_player_id = None;
        self.set_state(ConnectionState::Disconnected);
        self.status.reset();
        self.observe_status(now);
    }

    /// Stores the identity and sends `join` if the link is up. Otherwise the
    /// join goes out as soon as a connection is established.
    pub fn join(&mut self, name: &str, team: &str) {
        if !self.session.set(name, team) {
            return;
        }
        info!(%name, %team, "Joining");
        if self.state.is_linked() {
            if let Some(msg) = self.session.rejoin_message() {
                self.send(msg);
            }
        }
    }

    pub fn submit_pose(&mut self, sample: PoseSample, now: Instant) {
        if self.state != ConnectionState::Connected {
            self.pose.record(sample);
            return;
        }
        if let Some(update) = self.pose.submit(sample, now) {
            self.send(ClientMsg::UpdatePosition(update));
        }
    }

    /// Interval tick of the pose batcher.
    pub fn flush_pose(&mut self, now: Instant) {
        if self.state != ConnectionState::Connected {
            return;
        }
        if let Some(update) = self.pose.flush(now) {
            self.send(ClientMsg::UpdatePosition(update));
        }
    }

    pub fn send_action(&self, action: GameAction) -> Result<()> {
        match self.state {
            ConnectionState::Connected => {}
            ConnectionState::Error(ErrorKind::ReconnectExhausted) => {
                return Err(ReconnectExhausted {
                    attempts: self.reconnect.attempts(),
                }
                .into())
            }
            _ => return Err(SessionError::NotConnected),
        }
        let transport = self.transport.as_ref().ok_or(SessionError::NotConnected)?;
        transport
            .send(action.into_message())
            .map_err(SessionError::Send)
    }

    /// Status poll tick: asks for a fresh status and re-evaluates staleness.
    pub fn poll_status(&mut self, now: Instant) {
        if self.state.is_linked() {
            self.send(ClientMsg::RequestServerStatus {});
        }
        self.observe_status(now);
    }

    /// Runs the scheduled reconnection attempt if it is due.
    pub fn fire_reconnect(&mut self, now: Instant) {
        match self.reconnect_at {
            Some(at) if at <= now => self.reconnect_at = None,
            _ => return,
        }
        let Some(options) = self.options.clone() else {
            return;
        };
        info!(attempt = self.reconnect.attempts(), "Reconnecting");
        if let Err(e) = self.open(options, now) {
            warn!(error = %e, "Reconnection attempt could not start");
            self.set_state(ConnectionState::Disconnected);
            self.schedule_reconnect(now);
        }
    }

    // ─── Transport events ───

    pub async fn handle_transport_event(&mut self, generation: u64, event: TransportEvent, now: Instant) {
        if generation != self.generation || self.transport.is_none() {
            debug!(generation, current = self.generation, ?event, "Discarding event from stale transport");
            return;
        }

        match event {
            TransportEvent::Connected => {
                if self.state.is_linked() {
                    debug!("Duplicate connected event");
                } else {
                    self.on_connected(now);
                }
            }
            TransportEvent::Disconnected(reason) => {
                info!(?reason, "Link down");
                self.queue.reset();
                self.set_state(ConnectionState::Disconnected);
                self.observe_status(now);
                if reason.is_server_initiated() {
                    self.teardown().await;
                    self.schedule_reconnect(now);
                }
            }
            TransportEvent::ConnectError(why) => {
                self.teardown().await;
                if self.reconnect.is_active() {
                    warn!(error = %why, attempt = self.reconnect.attempts(), "Reconnection attempt failed");
                    self.set_state(ConnectionState::Disconnected);
                    self.schedule_reconnect(now);
                } else {
                    self.enter_error(ErrorKind::Connect, why);
                }
            }
            TransportEvent::Message(msg) => self.on_message(msg, now),
        }
    }

    fn on_connected(&mut self, now: Instant) {
        if self.reconnect.is_active() {
            info!(attempts = self.reconnect.attempts(), "Reconnected");
            self.reconnect.reset();
        }
        self.queue.reset();
        self.pose.reset();
        self.set_state(ConnectionState::Connected);

        if let Some(join) = self.session.rejoin_message() {
            debug!("Resuming session");
            self.send(join);
        }
        self.poll_status(now);
    }

    fn on_message(&mut self, msg: ServerMsg, now: Instant) {
        let msg = match msg.into_relay() {
            Ok((kind, payload)) => {
                debug!(?kind, "Relaying game event");
                self.bus.publish(GameEvent { kind, payload });
                return;
            }
            Err(msg) => msg,
        };

        match msg {
            ServerMsg::QueueUpdate(update) => self.on_queue_update(&update),
            ServerMsg::ServerStatus(snapshot) => {
                debug!(
                    players = snapshot.current_players,
                    max = snapshot.max_players,
                    queue = snapshot.queue_length,
                    "Server status"
                );
                self.status.record(snapshot.clone(), now);
                self.bus.publish(ServerStatusUpdate { snapshot });
                self.observe_status(now);
            }
            ServerMsg::Players(players) => {
                self.bus.publish(PlayersUpdate { players });
            }
            ServerMsg::JoinSuccess(ok) => {
                info!(id = %ok.id, name = %ok.name, team = %ok.team, total = ok.total_players, "Joined");
                self.local_player_id = Some(ok.id.clone());
                self.bus.publish(JoinAccepted(ok));
            }
            other => debug!(?other, "Unhandled server message"),
        }
    }

    fn on_queue_update(&mut self, update: &QueueUpdateMsg) {
        let admitted_or_waiting = matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Queued
        );
        if !admitted_or_waiting {
            debug!(position = update.position, state = %self.state, "Ignoring queue update");
            return;
        }

        match self.queue.apply(update) {
            QueueSignal::Waiting(q) => {
                info!(position = q.position, wait = %q.estimated_wait, "Queued");
                self.set_state(ConnectionState::Queued);
                self.bus.publish(QueueUpdate {
                    position: q.position,
                    estimated_wait_time: q.estimated_wait,
                });
            }
            QueueSignal::Ready => {
                info!("Admitted from queue");
                self.set_state(ConnectionState::Connected);
                self.bus.publish(QueueReady);
            }
            QueueSignal::Ignored => debug!("Admission notice while not queued"),
        }
    }

    // ─── Internals ───

    fn open(&mut self, options: ConnectOptions, now: Instant) -> Result<Arc<dyn Transport>, TransportError> {
        self.generation += 1;
        let sink = EventSink::new(self.generation, self.events_tx.clone());
        let transport = self.factory.create(&options, sink)?;
        info!(transport = %transport.id(), kind = ?transport.kind(), "Transport created");

        self.transport = Some(transport.clone());
        self.options = Some(options);
        if transport.is_connected() {
            self.on_connected(now);
        } else {
            self.set_state(ConnectionState::Connecting);
        }
        Ok(transport)
    }

    /// Closes and forgets the current transport. Its late events become stale.
    async fn teardown(&mut self) {
        if let Some(transport) = self.transport.take() {
            self.generation += 1;
            debug!(transport = %transport.id(), "Tearing down transport");
            transport.close().await;
        }
    }

    fn cancel_reconnect(&mut self) {
        if self.reconnect_at.take().is_some() {
            debug!("Cancelled pending reconnection");
        }
    }

    fn schedule_reconnect(&mut self, now: Instant) {
        match self.reconnect.next_delay() {
            Ok(delay) => {
                info!(
                    attempt = self.reconnect.attempts(),
                    delay_ms = delay.as_millis() as u64,
                    "Scheduling reconnection"
                );
                self.reconnect_at = Some(now + delay);
            }
            Err(exhausted) => {
                self.reconnect_at = None;
                self.enter_error(ErrorKind::ReconnectExhausted, exhausted.to_string());
            }
        }
    }

    fn enter_error(&mut self, kind: ErrorKind, message: String) {
        if kind.is_fatal() {
            error!(%kind, %message, "Connection failed permanently");
        } else {
            warn!(%kind, %message, "Connection error");
        }
        self.set_state(ConnectionState::Error(kind));
        self.bus.publish(ConnectionError { kind, message });
    }

    fn set_state(&mut self, state: ConnectionState) {
        if state == self.state {
            return;
        }
        info!(from = %self.state, to = %state, "Connection state");
        self.state = state;
        self.state_tx.send_replace(state);
        self.bus.publish(ConnectionStateChange { state });
    }

    fn observe_status(&mut self, now: Instant) {
        let link_up = self.link_up();
        if let Some(online) = self.status.observe(now, link_up) {
            info!(online, "Server presumed {}", if online { "online" } else { "offline" });
            self.bus.publish(ServerStatusChange(online));
        }
    }

    fn send(&self, msg: ClientMsg) -> bool {
        let Some(transport) = &self.transport else {
            debug!(event = msg.event_name(), "No transport, dropping message");
            return false;
        };
        match transport.send(msg) {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, "Send failed");
                false
            }
        }
    }
}
