//! In-process transport for single-player.
//!
//! Answers the handful of messages a server would, without any I/O, so every
//! consumer of the multiplayer interface works unchanged offline.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Mutex, PoisonError,
};

use async_trait::async_trait;
use netsync_shared::{
    net::{ClientMsg, JoinSuccess, PlayerMap, RemotePlayer, ServerMsg, TransportError},
    status::ServerStatusSnapshot,
};
use tracing::debug;

use crate::transport::{EventSink, Transport, TransportEvent, TransportKind};

/// Fixed id of the loopback transport and of the local player it simulates.
pub const SINGLE_PLAYER_ID: &str = "single-player";

#[derive(Debug)]
pub struct LoopbackTransport {
    sink: EventSink,
    open: AtomicBool,
    local: Mutex<Option<RemotePlayer>>,
}

impl LoopbackTransport {
    /// Connected from the moment it exists.
    pub fn new(sink: EventSink) -> Self {
        Self {
            sink,
            open: AtomicBool::new(true),
            local: Mutex::new(None),
        }
    }

    fn players(&self, local: &RemotePlayer) -> PlayerMap {
        PlayerMap::from([(SINGLE_PLAYER_ID.to_string(), local.clone())])
    }

    fn reply(&self, msg: ServerMsg) {
        self.sink.emit(TransportEvent::Message(msg));
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Loopback
    }

    fn id(&self) -> &str {
        SINGLE_PLAYER_ID
    }

    fn is_connected(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn send(&self, msg: ClientMsg) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Closed);
        }
        let mut local = self.local.lock().unwrap_or_else(PoisonError::into_inner);
        match msg {
            ClientMsg::Join { name, team } => {
                let player = RemotePlayer {
                    position: Default::default(),
                    rotation: Default::default(),
                    name: name.clone(),
                    team: team.clone(),
                    extra: Default::default(),
                };
                let players = self.players(&player);
                *local = Some(player);
                self.reply(ServerMsg::JoinSuccess(JoinSuccess {
                    id: SINGLE_PLAYER_ID.to_string(),
                    team,
                    name,
                    total_players: 1,
                }));
                self.reply(ServerMsg::Players(players));
            }
            ClientMsg::UpdatePosition(update) => {
                if let Some(player) = local.as_mut() {
                    if let Some(p) = update.position {
                        player.position = p;
                    }
                    if let Some(r) = update.rotation {
                        player.rotation = r;
                    }
                    let players = self.players(player);
                    self.reply(ServerMsg::Players(players));
                }
            }
            ClientMsg::RequestServerStatus {} => {
                let occupied = u32::from(local.is_some());
                self.reply(ServerMsg::ServerStatus(ServerStatusSnapshot::with_occupancy(
                    occupied, 1, 0,
                )));
            }
            other => {
                debug!(event = other.event_name(), "Loopback ignoring message");
            }
        }
        Ok(())
    }

    async fn close(&self) {
        self.open.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use netsync_shared::{math::Vec3, net::PoseUpdate};
    use tokio::sync::mpsc;

    use super::*;

    fn loopback() -> (LoopbackTransport, mpsc::UnboundedReceiver<(u64, TransportEvent)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (LoopbackTransport::new(EventSink::new(1, tx)), rx)
    }

    fn next_msg(rx: &mut mpsc::UnboundedReceiver<(u64, TransportEvent)>) -> ServerMsg {
        match rx.try_recv() {
            Ok((_, TransportEvent::Message(msg))) => msg,
            other => panic!("expected message, got {other:?}"),
        }
    }

    #[test]
    fn join_answers_with_success_and_local_player() {
        let (t, mut rx) = loopback();
        assert_eq!(t.id(), SINGLE_PLAYER_ID);
        assert!(t.is_connected());

        t.send(ClientMsg::Join {
            name: "ann".into(),
            team: "blue".into(),
        })
        .unwrap();

        let ServerMsg::JoinSuccess(ok) = next_msg(&mut rx) else {
            panic!("expected joinSuccess");
        };
        assert_eq!(ok.id, SINGLE_PLAYER_ID);
        assert_eq!(ok.total_players, 1);

        let ServerMsg::Players(players) = next_msg(&mut rx) else {
            panic!("expected players");
        };
        assert_eq!(players.len(), 1);
        assert_eq!(players[SINGLE_PLAYER_ID].name, "ann");
    }

    #[test]
    fn position_updates_echo_players() {
        let (t, mut rx) = loopback();
        t.send(ClientMsg::Join {
            name: "ann".into(),
            team: "blue".into(),
        })
        .unwrap();
        next_msg(&mut rx);
        next_msg(&mut rx);

        t.send(ClientMsg::UpdatePosition(PoseUpdate {
            position: Some(Vec3::new(4.0, 0.0, 1.0)),
            rotation: None,
        }))
        .unwrap();
        let ServerMsg::Players(players) = next_msg(&mut rx) else {
            panic!("expected players");
        };
        assert_eq!(players[SINGLE_PLAYER_ID].position, Vec3::new(4.0, 0.0, 1.0));
    }

    #[test]
    fn status_request_reports_single_slot() {
        let (t, mut rx) = loopback();
        t.send(ClientMsg::RequestServerStatus {}).unwrap();
        let ServerMsg::ServerStatus(snap) = next_msg(&mut rx) else {
            panic!("expected serverStatus");
        };
        assert!(snap.online);
        assert_eq!(snap.max_players, 1);
        assert!(snap.has_space);
    }

    #[tokio::test]
    async fn closed_loopback_rejects_sends() {
        let (t, _rx) = loopback();
        t.close().await;
        assert!(!t.is_connected());
        assert!(matches!(
            t.send(ClientMsg::RequestServerStatus {}),
            Err(TransportError::Closed)
        ));
    }
}
