//! Connection handle.
//!
//! [`Connection`] is the application-facing side of the session layer. It
//! spawns one task that owns the [`SessionCore`] and serializes everything
//! through it: application commands, transport events, the reconnection
//! timer, the pose flush interval and the status poll. The handle itself is
//! cheap to share; state changes are observable through a watch channel and
//! the [`EventBus`].

use std::{future, sync::Arc, time::Duration};

use netsync_shared::{
    config::ClientConfig, event::EventBus, state::ConnectionState,
    status::ServerStatusSnapshot,
};
use tokio::{
    sync::{mpsc, oneshot, watch, Mutex},
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};
use tracing::{debug, info};

use crate::{
    action::GameAction,
    error::{Result, SessionError},
    machine::{SessionCore, TransportEvents},
    pose::PoseSample,
    queue::QueueState,
    session::PlayerSession,
    transport::{ConnectOptions, DefaultTransportFactory, Transport, TransportFactory, TransportKind},
};

/// Point-in-time view of the connection, for status displays.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub state: ConnectionState,
    pub transport_id: Option<String>,
    pub transport_kind: Option<TransportKind>,
    pub session: Option<PlayerSession>,
    pub local_player_id: Option<String>,
    pub queue: Option<QueueState>,
    pub server_status: Option<ServerStatusSnapshot>,
    pub server_online: bool,
    pub reconnect_attempts: u32,
}

enum Command {
    Connect {
        options: ConnectOptions,
        reply: oneshot::Sender<Result<Arc<dyn Transport>>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    Join {
        name: String,
        team: String,
    },
    Pose(PoseSample),
    Action {
        action: GameAction,
        reply: oneshot::Sender<Result<()>>,
    },
    Info {
        reply: oneshot::Sender<ConnectionInfo>,
    },
    Shutdown,
}

pub struct Connection {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    bus: EventBus,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Spawns the connection task with the default transport factory.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(cfg: ClientConfig, bus: EventBus) -> Self {
        let factory = Arc::new(DefaultTransportFactory::new(cfg.clone()));
        Self::spawn_with_factory(&cfg, bus, factory)
    }

    pub fn spawn_with_factory(
        cfg: &ClientConfig,
        bus: EventBus,
        factory: Arc<dyn TransportFactory>,
    ) -> Self {
        let (core, events) = SessionCore::new(cfg, bus.clone(), factory);
        let state = core.watch_state();
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let poll_every = cfg.status.poll_interval();
        let task = tokio::spawn(run(core, commands_rx, events, poll_every));
        Self {
            commands,
            state,
            bus,
            task: Mutex::new(Some(task)),
        }
    }

    /// Opens a transport, or returns the live one if it already matches.
    pub async fn connect(&self, options: ConnectOptions) -> Result<Arc<dyn Transport>> {
        self.request(|reply| Command::Connect { options, reply })
            .await?
    }

    /// Closes the transport and forgets the session.
    pub async fn disconnect(&self) -> Result<()> {
        self.request(|reply| Command::Disconnect { reply }).await
    }

    /// Records the player identity and joins as soon as the link allows.
    pub fn join(&self, name: impl Into<String>, team: impl Into<String>) -> Result<()> {
        self.command(Command::Join {
            name: name.into(),
            team: team.into(),
        })
    }

    pub fn submit_pose(&self, sample: PoseSample) -> Result<()> {
        self.command(Command::Pose(sample))
    }

    pub async fn send_action(&self, action: GameAction) -> Result<()> {
        self.request(|reply| Command::Action { action, reply })
            .await?
    }

    pub async fn info(&self) -> Result<ConnectionInfo> {
        self.request(|reply| Command::Info { reply }).await
    }

    /// Presumed-online flag: link up and a fresh `serverStatus` on hand.
    pub async fn is_server_online(&self) -> Result<bool> {
        Ok(self.info().await?.server_online)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Resolves once the state satisfies `pred`.
    pub async fn wait_for_state(
        &self,
        pred: impl FnMut(&ConnectionState) -> bool,
    ) -> Result<ConnectionState> {
        let mut rx = self.state.clone();
        let state = rx.wait_for(pred).await.map_err(|_| SessionError::ActorGone)?;
        Ok(*state)
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Disconnects and stops the connection task.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
    }

    fn command(&self, cmd: Command) -> Result<()> {
        self.commands.send(cmd).map_err(|_| SessionError::ActorGone)
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.command(make(tx))?;
        rx.await.map_err(|_| SessionError::ActorGone)
    }
}

async fn run(
    mut core: SessionCore,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut events: TransportEvents,
    poll_every: Duration,
) {
    let pose_every = core.pose_flush_interval();
    let mut pose_tick = time::interval(pose_every.unwrap_or(Duration::from_secs(3600)));
    pose_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut poll_tick = time::interval(poll_every);
    poll_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    debug!("Connection task started");
    loop {
        let reconnect_due = wait_until(core.reconnect_deadline());
        let status_stale = wait_until(core.status_deadline());

        tokio::select! {
            cmd = commands.recv() => {
                let Some(cmd) = cmd else {
                    debug!("All handles dropped");
                    break;
                };
                if !handle_command(&mut core, cmd).await {
                    break;
                }
            }
            Some((generation, event)) = events.recv() => {
                core.handle_transport_event(generation, event, Instant::now()).await;
            }
            _ = reconnect_due => {
                core.fire_reconnect(Instant::now());
            }
            _ = status_stale => {
                core.check_status(Instant::now());
            }
            _ = pose_tick.tick(), if pose_every.is_some() => {
                core.flush_pose(Instant::now());
            }
            _ = poll_tick.tick() => {
                core.poll_status(Instant::now());
            }
        }
    }

    core.disconnect(Instant::now()).await;
    info!("Connection task stopped");
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => time::sleep_until(at).await,
        None => future::pending().await,
    }
}

/// Returns false when the task should stop.
async fn handle_command(core: &mut SessionCore, cmd: Command) -> bool {
    let now = Instant::now();
    match cmd {
        Command::Connect { options, reply } => {
            let _ = reply.send(core.connect(options, now).await);
        }
        Command::Disconnect { reply } => {
            core.disconnect(now).await;
            let _ = reply.send(());
        }
        Command::Join { name, team } => core.join(&name, &team),
        Command::Pose(sample) => core.submit_pose(sample, now),
        Command::Action { action, reply } => {
            let _ = reply.send(core.send_action(action));
        }
        Command::Info { reply } => {
            let _ = reply.send(info_of(core, now));
        }
        Command::Shutdown => return false,
    }
    true
}

fn info_of(core: &SessionCore, now: Instant) -> ConnectionInfo {
    ConnectionInfo {
        state: core.state(),
        transport_id: core.transport().map(|t| t.id().to_string()),
        transport_kind: core.transport().map(|t| t.kind()),
        session: core.session().get().cloned(),
        local_player_id: core.local_player_id().map(str::to_string),
        queue: core.queue().state().cloned(),
        server_status: core.server_status().cloned(),
        server_online: core.is_server_online(now),
        reconnect_attempts: core.reconnect_attempts(),
    }
}
