//! Connection lifecycle types shared between the client layer and its consumers.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Why the connection ended up in [`ConnectionState::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The transport could not be constructed.
    TransportInit,
    /// Handshake failed or timed out.
    Connect,
    /// Server-initiated drops exhausted the reconnection budget.
    ReconnectExhausted,
}

impl ErrorKind {
    /// Everything but an exhausted reconnect budget recovers with another `connect()`.
    pub fn is_fatal(self) -> bool {
        matches!(self, ErrorKind::ReconnectExhausted)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::TransportInit => "transport init failed",
            ErrorKind::Connect => "connect failed",
            ErrorKind::ReconnectExhausted => "connection lost, refresh required",
        };
        f.write_str(s)
    }
}

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", content = "kind", rename_all = "snake_case")]
pub enum ConnectionState {
    /// No transport, or the transport lost its link.
    #[default]
    Disconnected,
    /// Transport created, waiting for the handshake.
    Connecting,
    /// Admitted by the server.
    Connected,
    /// Waiting in the server's admission queue.
    Queued,
    /// Terminal until `connect()` is called again.
    Error(ErrorKind),
}

impl ConnectionState {
    /// Connected or queued: the link is up.
    pub fn is_linked(self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Queued)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Queued => "queued",
            ConnectionState::Error(_) => "error",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Error(kind) => write!(f, "error ({kind})"),
            other => f.write_str(other.as_str()),
        }
    }
}
