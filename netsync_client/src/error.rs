//! Client-side error taxonomy.

use netsync_shared::net::TransportError;

use crate::reconnect::ReconnectExhausted;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The transport could not be built. Retry, or fall back to offline play.
    #[error("transport init failed: {0}")]
    TransportInit(#[source] TransportError),
    /// Reconnection gave up. Only a fresh `connect` recovers.
    #[error(transparent)]
    ReconnectExhausted(#[from] ReconnectExhausted),
    #[error("not connected")]
    NotConnected,
    #[error("send failed: {0}")]
    Send(#[source] TransportError),
    /// The connection task has stopped.
    #[error("connection task is gone")]
    ActorGone,
}

pub type Result<T, E = SessionError> = std::result::Result<T, E>;
