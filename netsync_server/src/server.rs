//! Server implementation.
//!
//! A small session server speaking the netsync wire contract. It supports:
//! - Admission up to `max_players`, with a FIFO waiting queue beyond that
//! - Status requests
//! - Pose tracking and `players` broadcast
//! - Flag events relayed to everyone
//! - Administrative kick (`disconnect { reason: "server-close" }`)
//!
//! One hub task owns all session state. Each connection gets a reader task
//! feeding the hub and a writer task draining a per-peer outbox, so a slow
//! peer never blocks the hub.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    net::SocketAddr,
    time::Duration,
};

use anyhow::Context;
use netsync_shared::{
    config::ServerConfig,
    math::Vec3,
    net::{
        read_frame, write_frame, ClientMsg, JoinSuccess, PlayerMap, PoseUpdate, QueueUpdateMsg,
        RemotePlayer, ServerMsg, WaitEstimate, SERVER_CLOSE_REASON,
    },
    status::ServerStatusSnapshot,
};
use tokio::{
    net::{tcp::OwnedWriteHalf, TcpListener, TcpStream},
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time,
};
use tracing::{debug, info, warn};

/// Estimated wait per queue position, in seconds.
pub const SECONDS_PER_POSITION: u64 = 30;

/// Pause after a failed `accept` before trying again.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

pub type PeerId = u64;

/// Joined player state.
#[derive(Debug, Clone)]
struct Player {
    id: String,
    name: String,
    team: String,
    position: Vec3,
    rotation: Vec3,
}

impl Player {
    fn apply(&mut self, update: &PoseUpdate) {
        if let Some(p) = update.position {
            self.position = p;
        }
        if let Some(r) = update.rotation {
            self.rotation = r;
        }
    }
}

/// Connected peer state.
struct Peer {
    outbox: mpsc::UnboundedSender<ServerMsg>,
    /// Set once the peer has sent `join`.
    player: Option<Player>,
    admitted: bool,
}

enum HubEvent {
    Connected {
        peer: PeerId,
        addr: SocketAddr,
        outbox: mpsc::UnboundedSender<ServerMsg>,
    },
    Message(PeerId, ClientMsg),
    Left(PeerId),
    KickAll {
        reply: oneshot::Sender<usize>,
    },
    Broadcast(ServerMsg),
    Status {
        reply: oneshot::Sender<ServerStatusSnapshot>,
    },
    Shutdown,
}

/// All session state, owned by the hub task.
struct Hub {
    max_players: u32,
    peers: HashMap<PeerId, Peer>,
    /// Admitted peers, in admission order.
    active: Vec<PeerId>,
    /// Joined peers waiting for a slot, head first.
    waiting: VecDeque<PeerId>,
    next_player: u64,
}

impl Hub {
    fn new(max_players: u32) -> Self {
        Self {
            max_players,
            peers: HashMap::new(),
            active: Vec::new(),
            waiting: VecDeque::new(),
            next_player: 1,
        }
    }

    fn handle(&mut self, event: HubEvent) -> bool {
        match event {
            HubEvent::Connected { peer, addr, outbox } => {
                info!(peer, %addr, "Client connected");
                self.peers.insert(
                    peer,
                    Peer {
                        outbox,
                        player: None,
                        admitted: false,
                    },
                );
            }
            HubEvent::Message(peer, msg) => self.on_message(peer, msg),
            HubEvent::Left(peer) => self.remove(peer),
            HubEvent::KickAll { reply } => {
                let kicked = self.kick_all();
                let _ = reply.send(kicked);
            }
            HubEvent::Broadcast(msg) => self.broadcast(&msg),
            HubEvent::Status { reply } => {
                let _ = reply.send(self.status());
            }
            HubEvent::Shutdown => {
                self.kick_all();
                return false;
            }
        }
        true
    }

    fn on_message(&mut self, peer: PeerId, msg: ClientMsg) {
        match msg {
            ClientMsg::Join { name, team } => self.join(peer, name, team),
            ClientMsg::RequestServerStatus {} => {
                let status = self.status();
                self.send(peer, ServerMsg::ServerStatus(status));
            }
            ClientMsg::UpdatePosition(update) => {
                let Some(player) = self.admitted_player(peer) else {
                    debug!(peer, "Pose from a peer that is not playing");
                    return;
                };
                player.apply(&update);
                self.broadcast_players();
            }
            ClientMsg::CaptureFlag(data) => self.relay_flag(peer, data, ServerMsg::FlagCaptured),
            ClientMsg::ScoreFlag(data) => self.relay_flag(peer, data, ServerMsg::FlagScored),
            ClientMsg::Shoot(_) => debug!(peer, "Shot fired"),
            ClientMsg::Message { text, timestamp } => {
                info!(peer, %text, timestamp, "Chat");
            }
        }
    }

    fn join(&mut self, peer: PeerId, name: String, team: String) {
        let Some(entry) = self.peers.get_mut(&peer) else {
            return;
        };
        if entry.player.is_some() {
            debug!(peer, "Repeated join ignored");
            return;
        }
        let id = format!("p{}", self.next_player);
        self.next_player += 1;
        info!(peer, %id, %name, %team, "Player joined");
        entry.player = Some(Player {
            id,
            name,
            team,
            position: Default::default(),
            rotation: Default::default(),
        });

        if (self.active.len() as u32) < self.max_players {
            self.admit(peer);
        } else {
            self.waiting.push_back(peer);
            info!(peer, position = self.waiting.len(), "Server full, queued");
            self.refresh_queue();
        }
    }

    fn admit(&mut self, peer: PeerId) {
        let total = self.active.len() as u32 + 1;
        let Some(entry) = self.peers.get_mut(&peer) else {
            return;
        };
        let Some(player) = entry.player.as_ref() else {
            return;
        };
        let ok = JoinSuccess {
            id: player.id.clone(),
            team: player.team.clone(),
            name: player.name.clone(),
            total_players: total,
        };
        entry.admitted = true;
        self.active.push(peer);
        self.send(peer, ServerMsg::JoinSuccess(ok));
        self.broadcast_players();
    }

    /// Sends every waiting peer its current 1-based position.
    fn refresh_queue(&self) {
        for (i, peer) in self.waiting.iter().enumerate() {
            let position = i as u32 + 1;
            self.send(
                *peer,
                ServerMsg::QueueUpdate(QueueUpdateMsg {
                    position,
                    estimated_wait_time: Some(WaitEstimate::Seconds(
                        position as u64 * SECONDS_PER_POSITION,
                    )),
                }),
            );
        }
    }

    fn remove(&mut self, peer: PeerId) {
        let Some(gone) = self.peers.remove(&peer) else {
            return;
        };
        info!(peer, admitted = gone.admitted, "Client left");
        self.waiting.retain(|p| *p != peer);
        if gone.admitted {
            self.active.retain(|p| *p != peer);
            self.broadcast_players();
            self.promote();
        }
        self.refresh_queue();
    }

    /// Fills free slots from the head of the queue.
    fn promote(&mut self) {
        while (self.active.len() as u32) < self.max_players {
            let Some(next) = self.waiting.pop_front() else {
                break;
            };
            info!(peer = next, "Admitting from queue");
            self.send(
                next,
                ServerMsg::QueueUpdate(QueueUpdateMsg {
                    position: 0,
                    estimated_wait_time: None,
                }),
            );
            self.admit(next);
        }
    }

    fn kick_all(&mut self) -> usize {
        let kicked = self.peers.len();
        for (peer, entry) in self.peers.drain() {
            debug!(peer, "Kicking");
            let _ = entry.outbox.send(ServerMsg::Disconnect {
                reason: SERVER_CLOSE_REASON.to_string(),
            });
        }
        self.active.clear();
        self.waiting.clear();
        if kicked > 0 {
            info!(kicked, "Kicked all clients");
        }
        kicked
    }

    fn relay_flag(
        &mut self,
        peer: PeerId,
        mut data: serde_json::Value,
        wrap: fn(serde_json::Value) -> ServerMsg,
    ) {
        let Some(player) = self.admitted_player(peer) else {
            return;
        };
        let player_id = player.id.clone();
        let team = player.team.clone();
        if let Some(obj) = data.as_object_mut() {
            obj.insert("playerId".into(), player_id.into());
            obj.entry("team").or_insert(team.into());
        }
        self.broadcast(&wrap(data));
    }

    fn admitted_player(&mut self, peer: PeerId) -> Option<&mut Player> {
        self.peers
            .get_mut(&peer)
            .filter(|p| p.admitted)
            .and_then(|p| p.player.as_mut())
    }

    fn status(&self) -> ServerStatusSnapshot {
        let mut per_team = BTreeMap::new();
        for player in self.active_players() {
            *per_team.entry(player.team.clone()).or_insert(0u32) += 1;
        }
        let mut status = ServerStatusSnapshot::with_occupancy(
            self.active.len() as u32,
            self.max_players,
            self.waiting.len() as u32,
        );
        status.last_update_timestamp = Some(chrono::Utc::now().timestamp_millis());
        status.per_team_counts = Some(per_team);
        status
    }

    fn active_players(&self) -> impl Iterator<Item = &Player> {
        self.active
            .iter()
            .filter_map(|id| self.peers.get(id))
            .filter_map(|p| p.player.as_ref())
    }

    fn broadcast_players(&self) {
        let players: PlayerMap = self
            .active_players()
            .map(|p| {
                (
                    p.id.clone(),
                    RemotePlayer {
                        position: p.position,
                        rotation: p.rotation,
                        name: p.name.clone(),
                        team: p.team.clone(),
                        extra: BTreeMap::new(),
                    },
                )
            })
            .collect();
        let msg = ServerMsg::Players(players);
        for peer in &self.active {
            self.send(*peer, msg.clone());
        }
    }

    fn broadcast(&self, msg: &ServerMsg) {
        for peer in &self.active {
            self.send(*peer, msg.clone());
        }
    }

    fn send(&self, peer: PeerId, msg: ServerMsg) {
        if let Some(entry) = self.peers.get(&peer) {
            let _ = entry.outbox.send(msg);
        }
    }
}

/// Bound, not yet running server.
pub struct SessionServer {
    cfg: ServerConfig,
    listener: TcpListener,
}

impl SessionServer {
    /// Binds the listen address from the config.
    pub async fn bind(cfg: ServerConfig) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(&cfg.listen_addr)
            .await
            .with_context(|| format!("bind {}", cfg.listen_addr))?;
        Ok(Self { cfg, listener })
    }

    /// Binds an ephemeral localhost port.
    pub async fn bind_ephemeral(mut cfg: ServerConfig) -> anyhow::Result<Self> {
        cfg.listen_addr = "127.0.0.1:0".to_string();
        Self::bind(cfg).await
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.listener.local_addr().context("local_addr")
    }

    /// Starts the hub and the accept loop.
    pub fn spawn(self) -> anyhow::Result<ServerHandle> {
        let addr = self.local_addr()?;
        let (hub_tx, mut hub_rx) = mpsc::unbounded_channel();
        let mut hub = Hub::new(self.cfg.max_players);

        let hub_task = tokio::spawn(async move {
            while let Some(event) = hub_rx.recv().await {
                if !hub.handle(event) {
                    break;
                }
            }
            debug!("Hub stopped");
        });

        let accept_task = tokio::spawn(accept_loop(
            self.listener,
            hub_tx.clone(),
            self.cfg.compression_threshold,
        ));

        info!(%addr, max_players = self.cfg.max_players, "Server listening");
        Ok(ServerHandle {
            addr,
            hub: hub_tx,
            hub_task,
            accept_task,
        })
    }
}

async fn accept_loop(
    listener: TcpListener,
    hub: mpsc::UnboundedSender<HubEvent>,
    compression_threshold: Option<usize>,
) {
    let mut next_peer: PeerId = 1;
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                // Persistent errors such as EMFILE would otherwise spin.
                warn!(error = %e, "Accept failed");
                time::sleep(ACCEPT_RETRY_DELAY).await;
                continue;
            }
        };
        let peer = next_peer;
        next_peer += 1;
        if hub.is_closed() {
            break;
        }
        tokio::spawn(serve_peer(peer, addr, stream, hub.clone(), compression_threshold));
    }
}

async fn serve_peer(
    peer: PeerId,
    addr: SocketAddr,
    stream: TcpStream,
    hub: mpsc::UnboundedSender<HubEvent>,
    compression_threshold: Option<usize>,
) {
    let _ = stream.set_nodelay(true);
    let (mut reader, writer) = stream.into_split();
    let (outbox, outbox_rx) = mpsc::unbounded_channel();
    if hub
        .send(HubEvent::Connected { peer, addr, outbox })
        .is_err()
    {
        return;
    }
    tokio::spawn(write_loop(peer, writer, outbox_rx, compression_threshold));

    loop {
        match read_frame::<_, ClientMsg>(&mut reader).await {
            Ok(Some(msg)) => {
                if hub.send(HubEvent::Message(peer, msg)).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!(peer, error = %e, "Read failed");
                break;
            }
        }
    }
    let _ = hub.send(HubEvent::Left(peer));
}

/// Drains the outbox. Ends after a `disconnect` or when the hub drops the peer.
async fn write_loop(
    peer: PeerId,
    mut writer: OwnedWriteHalf,
    mut outbox: mpsc::UnboundedReceiver<ServerMsg>,
    compression_threshold: Option<usize>,
) {
    while let Some(msg) = outbox.recv().await {
        let last = matches!(msg, ServerMsg::Disconnect { .. });
        if let Err(e) = write_frame(&mut writer, &msg, compression_threshold).await {
            debug!(peer, error = %e, "Write failed");
            break;
        }
        if last {
            break;
        }
    }
}

/// Handle to a running server.
pub struct ServerHandle {
    addr: SocketAddr,
    hub: mpsc::UnboundedSender<HubEvent>,
    hub_task: JoinHandle<()>,
    accept_task: JoinHandle<()>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Sends `disconnect { reason: "server-close" }` to every client and
    /// drops them. Returns how many were kicked.
    pub async fn kick_all(&self) -> anyhow::Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.hub
            .send(HubEvent::KickAll { reply })
            .map_err(|_| anyhow::anyhow!("server stopped"))?;
        rx.await.context("hub reply")
    }

    pub async fn status(&self) -> anyhow::Result<ServerStatusSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.hub
            .send(HubEvent::Status { reply })
            .map_err(|_| anyhow::anyhow!("server stopped"))?;
        rx.await.context("hub reply")
    }

    /// Sends `msg` to every admitted player.
    pub fn broadcast(&self, msg: ServerMsg) -> anyhow::Result<()> {
        self.hub
            .send(HubEvent::Broadcast(msg))
            .map_err(|_| anyhow::anyhow!("server stopped"))
    }

    /// Kicks everyone and stops accepting.
    pub async fn shutdown(self) {
        let _ = self.hub.send(HubEvent::Shutdown);
        let _ = self.hub_task.await;
        self.accept_task.abort();
        let _ = self.accept_task.await;
        info!(addr = %self.addr, "Server stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hub_with_peers(max_players: u32, n: u64) -> (Hub, Vec<mpsc::UnboundedReceiver<ServerMsg>>) {
        let mut hub = Hub::new(max_players);
        let mut rxs = Vec::new();
        for peer in 1..=n {
            let (outbox, rx) = mpsc::unbounded_channel();
            hub.handle(HubEvent::Connected {
                peer,
                addr: "127.0.0.1:1".parse().unwrap(),
                outbox,
            });
            rxs.push(rx);
        }
        (hub, rxs)
    }

    fn join(hub: &mut Hub, peer: PeerId, name: &str) {
        hub.handle(HubEvent::Message(
            peer,
            ClientMsg::Join {
                name: name.into(),
                team: "red".into(),
            },
        ));
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerMsg>) -> Vec<ServerMsg> {
        let mut out = Vec::new();
        while let Ok(m) = rx.try_recv() {
            out.push(m);
        }
        out
    }

    fn queue_positions(msgs: &[ServerMsg]) -> Vec<u32> {
        msgs.iter()
            .filter_map(|m| match m {
                ServerMsg::QueueUpdate(q) => Some(q.position),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn admits_until_full_then_queues() {
        let (mut hub, mut rxs) = hub_with_peers(1, 3);
        join(&mut hub, 1, "a");
        join(&mut hub, 2, "b");
        join(&mut hub, 3, "c");

        assert!(drain(&mut rxs[0])
            .iter()
            .any(|m| matches!(m, ServerMsg::JoinSuccess(ok) if ok.total_players == 1)));
        assert_eq!(queue_positions(&drain(&mut rxs[1])), vec![1, 1]);
        assert_eq!(queue_positions(&drain(&mut rxs[2])), vec![2]);

        let status = hub.status();
        assert_eq!(status.current_players, 1);
        assert_eq!(status.queue_length, 2);
        assert!(!status.has_space);
    }

    #[test]
    fn freed_slot_admits_queue_head() {
        let (mut hub, mut rxs) = hub_with_peers(1, 3);
        join(&mut hub, 1, "a");
        join(&mut hub, 2, "b");
        join(&mut hub, 3, "c");
        rxs.iter_mut().for_each(|rx| {
            drain(rx);
        });

        hub.handle(HubEvent::Left(1));

        let head = drain(&mut rxs[1]);
        assert_eq!(queue_positions(&head), vec![0]);
        assert!(head.iter().any(|m| matches!(m, ServerMsg::JoinSuccess(_))));
        assert_eq!(queue_positions(&drain(&mut rxs[2])), vec![1]);
    }

    #[test]
    fn pose_updates_are_broadcast() {
        let (mut hub, mut rxs) = hub_with_peers(4, 2);
        join(&mut hub, 1, "a");
        join(&mut hub, 2, "b");
        drain(&mut rxs[1]);

        hub.handle(HubEvent::Message(
            1,
            ClientMsg::UpdatePosition(PoseUpdate {
                position: Some(Vec3::new(1.0, 2.0, 3.0)),
                rotation: None,
            }),
        ));

        let Some(ServerMsg::Players(players)) = drain(&mut rxs[1]).pop() else {
            panic!("expected players");
        };
        assert_eq!(players["p1"].position, Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(players.len(), 2);
    }

    #[test]
    fn kick_all_sends_server_close() {
        let (mut hub, mut rxs) = hub_with_peers(4, 2);
        join(&mut hub, 1, "a");
        drain(&mut rxs[0]);

        let (reply, mut rx) = oneshot::channel();
        hub.handle(HubEvent::KickAll { reply });
        assert_eq!(rx.try_recv().unwrap(), 2);
        assert_eq!(
            drain(&mut rxs[0]),
            vec![ServerMsg::Disconnect {
                reason: SERVER_CLOSE_REASON.into()
            }]
        );
        assert!(hub.peers.is_empty());
    }

    #[test]
    fn flag_capture_is_relayed_with_player_id() {
        let (mut hub, mut rxs) = hub_with_peers(4, 2);
        join(&mut hub, 1, "a");
        join(&mut hub, 2, "b");
        drain(&mut rxs[1]);

        hub.handle(HubEvent::Message(
            1,
            ClientMsg::CaptureFlag(serde_json::json!({ "flag": "blue" })),
        ));
        let Some(ServerMsg::FlagCaptured(data)) = drain(&mut rxs[1]).pop() else {
            panic!("expected flagCaptured");
        };
        assert_eq!(data["playerId"], "p1");
        assert_eq!(data["team"], "red");
    }
}
