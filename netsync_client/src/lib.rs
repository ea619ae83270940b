//! `netsync_client`
//!
//! Client-side session synchronization:
//! - Transports (network and in-process loopback) behind one trait
//! - Connection state machine with server-close backoff and silent rejoin
//! - Admission queue tracking
//! - Server status freshness
//! - Pose update batching

pub mod action;
pub mod client;
pub mod error;
pub mod loopback;
pub mod machine;
pub mod net_transport;
pub mod pose;
pub mod queue;
pub mod reconnect;
pub mod session;
pub mod status;
pub mod transport;

#[cfg(test)]
mod testing;

pub use action::GameAction;
pub use client::{Connection, ConnectionInfo};
pub use error::SessionError;
pub use pose::PoseSample;
pub use transport::{ConnectOptions, Transport, TransportKind};
