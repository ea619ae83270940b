//! Standalone client binary.
//!
//! Usage:
//!   cargo run -p netsync_client -- [--addr 127.0.0.1:40000] [--name Player]
//!       [--team red] [--offline] [--config client.json]
//!
//! The client connects, joins, and walks the local player around at random so
//! pose updates flow. Session events are logged as they arrive.
//!
//! Console commands:
//!   status                    - Show connection status
//!   say <message>             - Send chat message
//!   shoot                     - Fire straight ahead
//!   disconnect                - Disconnect and forget the session
//!   connect [offline|<addr>]  - Connect (and rejoin with the configured name)
//!   quit                      - Exit client

use std::env;
use std::io::{BufRead, Write};
use std::time::Duration;

use anyhow::Context;
use netsync_client::{ConnectOptions, Connection, GameAction, PoseSample};
use netsync_shared::{
    config::ClientConfig,
    event::{
        BusEvent, ConnectionError, ConnectionStateChange, EventBus, GameEvent, JoinAccepted,
        PlayersUpdate, QueueReady, QueueUpdate, ServerStatusChange,
    },
    math::Vec3,
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use tokio::sync::mpsc;
use tracing::{info, warn};

struct Args {
    cfg: ClientConfig,
    offline: bool,
}

fn parse_args() -> anyhow::Result<Args> {
    let args: Vec<String> = env::args().collect();

    // Config file first so flags override it.
    let mut cfg = match args.iter().position(|a| a == "--config") {
        Some(i) if i + 1 < args.len() => {
            let path = &args[i + 1];
            let text = std::fs::read_to_string(path).with_context(|| format!("read {path}"))?;
            ClientConfig::from_json_str(&text).with_context(|| format!("parse {path}"))?
        }
        _ => ClientConfig::default(),
    };

    let mut offline = false;
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--addr" if i + 1 < args.len() => {
                cfg.server_addr = args[i + 1].clone();
                i += 2;
            }
            "--name" if i + 1 < args.len() => {
                cfg.player_name = args[i + 1].clone();
                i += 2;
            }
            "--team" if i + 1 < args.len() => {
                cfg.team = args[i + 1].clone();
                i += 2;
            }
            "--offline" => {
                offline = true;
                i += 1;
            }
            _ => i += 1,
        }
    }
    Ok(Args { cfg, offline })
}

/// Logs every event of type `E` until the bus goes away.
fn log_events<E: BusEvent + std::fmt::Debug>(bus: &EventBus) {
    let mut sub = bus.subscribe::<E>();
    tokio::spawn(async move {
        while let Some(event) = sub.recv().await {
            info!(event = E::NAME, ?event, "Session event");
        }
    });
}

async fn exec_console(
    conn: &Connection,
    cfg: &ClientConfig,
    line: &str,
) -> anyhow::Result<Vec<String>> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.is_empty() {
        return Ok(Vec::new());
    }

    match tokens[0] {
        "status" => {
            let info = conn.info().await?;
            let mut out = vec![format!("State: {}", info.state)];
            if let Some(id) = &info.transport_id {
                out.push(format!("Transport: {} ({:?})", id, info.transport_kind));
            }
            if let Some(s) = &info.session {
                out.push(format!("Player: {} [{}]", s.name, s.team));
            }
            if let Some(id) = &info.local_player_id {
                out.push(format!("Player ID: {id}"));
            }
            if let Some(q) = &info.queue {
                out.push(format!("Queue: #{} ({})", q.position, q.estimated_wait));
            }
            out.push(format!("Server online: {}", info.server_online));
            if let Some(s) = &info.server_status {
                out.push(format!(
                    "Players: {}/{} (queue {})",
                    s.current_players, s.max_players, s.queue_length
                ));
            }
            if info.reconnect_attempts > 0 {
                out.push(format!("Reconnect attempts: {}", info.reconnect_attempts));
            }
            Ok(out)
        }
        "say" => {
            let text = tokens[1..].join(" ");
            conn.send_action(GameAction::Chat(text)).await?;
            Ok(vec![])
        }
        "shoot" => {
            let payload = serde_json::json!({ "direction": [0.0, 0.0, 1.0] });
            conn.send_action(GameAction::Shoot(payload)).await?;
            Ok(vec![])
        }
        "disconnect" => {
            conn.disconnect().await?;
            Ok(vec!["Disconnected".to_string()])
        }
        "connect" => {
            let options = match tokens.get(1) {
                Some(&"offline") => ConnectOptions::offline(),
                Some(addr) => ConnectOptions::online().with_server_addr(*addr),
                None => ConnectOptions::online(),
            };
            let transport = conn.connect(options).await?;
            conn.join(cfg.player_name.as_str(), cfg.team.as_str())?;
            Ok(vec![format!("Using transport {}", transport.id())])
        }
        "quit" | "exit" => Ok(vec!["quit".to_string()]),
        other => Ok(vec![format!("Unknown command: {other}")]),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let Args { cfg, offline } = parse_args()?;
    info!(server = %cfg.server_addr, name = %cfg.player_name, team = %cfg.team, offline, "Starting client");

    let bus = EventBus::new();
    log_events::<ConnectionStateChange>(&bus);
    log_events::<ConnectionError>(&bus);
    log_events::<QueueUpdate>(&bus);
    log_events::<QueueReady>(&bus);
    log_events::<JoinAccepted>(&bus);
    log_events::<ServerStatusChange>(&bus);
    log_events::<PlayersUpdate>(&bus);
    log_events::<GameEvent>(&bus);

    let conn = Connection::spawn(cfg.clone(), bus);
    let options = if offline {
        ConnectOptions::offline()
    } else {
        ConnectOptions::online()
    };
    conn.connect(options).await.context("connect")?;
    conn.join(cfg.player_name.as_str(), cfg.team.as_str())?;

    // Set up console input channel.
    let (console_tx, mut console_rx) = mpsc::channel::<String>(32);

    // Spawn stdin reader thread.
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut stdout = std::io::stdout();
        loop {
            print!("] ");
            let _ = stdout.flush();
            let mut line = String::new();
            match stdin.lock().read_line(&mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            let line = line.trim().to_string();
            if !line.is_empty() && console_tx.blocking_send(line).is_err() {
                break;
            }
        }
    });

    println!("Client started. Type 'status' for info, 'quit' to exit.");
    println!();

    let mut rng = StdRng::from_entropy();
    let mut position = Vec3::ZERO;
    let mut rotation = Vec3::ZERO;
    let mut tick = tokio::time::interval(Duration::from_secs_f32(1.0 / cfg.tick_hz.max(1) as f32));

    loop {
        tokio::select! {
            line = console_rx.recv() => {
                let Some(line) = line else { break };
                match exec_console(&conn, &cfg, &line).await {
                    Ok(output) if output.first().is_some_and(|l| l == "quit") => break,
                    Ok(output) => {
                        for line in output {
                            println!("{}", line);
                        }
                    }
                    Err(e) => println!("Error: {}", e),
                }
            }
            _ = tick.tick() => {
                // Random walk stands in for player input.
                position = position + Vec3::new(rng.gen_range(-0.05..0.05), 0.0, rng.gen_range(-0.05..0.05));
                rotation.y += rng.gen_range(-0.02..0.02);
                if conn.submit_pose(PoseSample::new(position, rotation)).is_err() {
                    warn!("Connection task stopped");
                    break;
                }
            }
        }
    }

    conn.shutdown().await;
    Ok(())
}
