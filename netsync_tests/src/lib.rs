//! Shared harness for the integration tests.

use std::time::Duration;

use anyhow::Context;
use netsync_client::Connection;
use netsync_server::{ServerHandle, SessionServer};
use netsync_shared::{
    config::{ClientConfig, ServerConfig},
    event::{BusEvent, EventBus, Subscription},
    state::ConnectionState,
};

/// Upper bound on any single wait in a test.
pub const WAIT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init();
}

/// Starts a reference server on an ephemeral localhost port.
pub async fn spawn_server(max_players: u32) -> anyhow::Result<ServerHandle> {
    let server = SessionServer::bind_ephemeral(ServerConfig {
        max_players,
        ..ServerConfig::default()
    })
    .await?;
    server.spawn()
}

/// Client config pointed at `server`, with fast timers for tests.
pub fn client_config(server: &ServerHandle) -> ClientConfig {
    let mut cfg = ClientConfig {
        server_addr: server.local_addr().to_string(),
        ..ClientConfig::default()
    };
    cfg.transport.connect_timeout_ms = 1000;
    cfg.transport.link_retry_delay_ms = 50;
    cfg.reconnect.base_delay_ms = 100;
    cfg.pose.interval_ms = 20;
    cfg
}

pub fn spawn_client(cfg: ClientConfig) -> Connection {
    Connection::spawn(cfg, EventBus::new())
}

pub async fn wait_for_state(conn: &Connection, want: ConnectionState) -> anyhow::Result<()> {
    tokio::time::timeout(WAIT, conn.wait_for_state(|s| *s == want))
        .await
        .with_context(|| format!("timed out waiting for {want}"))??;
    Ok(())
}

/// Next event of type `E` matching `pred`, skipping the rest.
pub async fn next_event<E: BusEvent>(
    sub: &mut Subscription<E>,
    mut pred: impl FnMut(&E) -> bool,
) -> anyhow::Result<E> {
    tokio::time::timeout(WAIT, async {
        while let Some(event) = sub.recv().await {
            if pred(&event) {
                return Some(event);
            }
        }
        None
    })
    .await
    .with_context(|| format!("timed out waiting for {}", E::NAME))?
    .with_context(|| format!("bus closed waiting for {}", E::NAME))
}
