//! Transport abstraction.
//!
//! A transport carries named messages to and from a server (or a local
//! stand-in). Instead of per-event callbacks, each transport is handed an
//! [`EventSink`] at construction and pushes typed [`TransportEvent`]s into it;
//! the connection owner drains the other end. Dropping that receiver is the
//! equivalent of unsubscribing from everything.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use netsync_shared::{
    config::ClientConfig,
    net::{ClientMsg, ServerMsg, TransportError},
};
use tokio::sync::mpsc;

use crate::{loopback::LoopbackTransport, net_transport::NetworkTransport};

/// Why a transport's link went down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The server closed the session on purpose (e.g. `"server-close"`).
    Server(String),
    /// Ordinary link loss. The transport retries on its own.
    LinkLost(String),
    /// We closed it.
    Client,
}

impl DisconnectReason {
    pub fn is_server_initiated(&self) -> bool {
        matches!(self, DisconnectReason::Server(_))
    }
}

/// Everything a transport reports upward.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected,
    Disconnected(DisconnectReason),
    ConnectError(String),
    Message(ServerMsg),
}

/// Tags events with the generation of the transport that produced them, so
/// events from a transport that has since been replaced can be discarded.
#[derive(Debug, Clone)]
pub struct EventSink {
    generation: u64,
    tx: mpsc::UnboundedSender<(u64, TransportEvent)>,
}

impl EventSink {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<(u64, TransportEvent)>) -> Self {
        Self { generation, tx }
    }

    /// Returns false once nobody is listening.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx.send((self.generation, event)).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Network,
    Loopback,
}

/// Bidirectional named-message channel.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    fn kind(&self) -> TransportKind;

    fn id(&self) -> &str;

    fn is_connected(&self) -> bool;

    /// Queues a message. Never blocks.
    fn send(&self, msg: ClientMsg) -> Result<(), TransportError>;

    /// Stops the transport and waits for its background work to finish.
    /// No events are emitted after this returns.
    async fn close(&self);
}

/// What `connect()` asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    pub multiplayer: bool,
    /// Overrides the configured server address.
    pub server_addr: Option<String>,
}

impl ConnectOptions {
    pub fn online() -> Self {
        Self {
            multiplayer: true,
            server_addr: None,
        }
    }

    pub fn offline() -> Self {
        Self {
            multiplayer: false,
            server_addr: None,
        }
    }

    pub fn with_server_addr(mut self, addr: impl Into<String>) -> Self {
        self.server_addr = Some(addr.into());
        self
    }

    pub fn kind(&self) -> TransportKind {
        if self.multiplayer {
            TransportKind::Network
        } else {
            TransportKind::Loopback
        }
    }
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self::online()
    }
}

/// Builds transports. Swapped out in tests.
pub trait TransportFactory: Send + Sync {
    fn create(
        &self,
        options: &ConnectOptions,
        sink: EventSink,
    ) -> Result<Arc<dyn Transport>, TransportError>;
}

/// Loopback for offline play, TCP otherwise.
#[derive(Debug, Clone)]
pub struct DefaultTransportFactory {
    cfg: ClientConfig,
}

impl DefaultTransportFactory {
    pub fn new(cfg: ClientConfig) -> Self {
        Self { cfg }
    }
}

impl TransportFactory for DefaultTransportFactory {
    fn create(
        &self,
        options: &ConnectOptions,
        sink: EventSink,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        if !options.multiplayer {
            return Ok(Arc::new(LoopbackTransport::new(sink)));
        }
        let addr = options
            .server_addr
            .as_deref()
            .unwrap_or(&self.cfg.server_addr);
        let transport = NetworkTransport::spawn(addr, &self.cfg.transport, sink)?;
        Ok(Arc::new(transport))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sink_tags_generation() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = EventSink::new(7, tx);
        assert!(sink.emit(TransportEvent::Connected));
        assert_eq!(rx.try_recv().unwrap(), (7, TransportEvent::Connected));
        drop(rx);
        assert!(!sink.emit(TransportEvent::Connected));
        assert!(sink.is_closed());
    }

    #[test]
    fn options_pick_kind() {
        assert_eq!(ConnectOptions::offline().kind(), TransportKind::Loopback);
        assert_eq!(
            ConnectOptions::online().with_server_addr("10.0.0.1:1").kind(),
            TransportKind::Network
        );
    }

    #[test]
    fn only_server_close_is_server_initiated() {
        assert!(DisconnectReason::Server("server-close".into()).is_server_initiated());
        assert!(!DisconnectReason::LinkLost("reset".into()).is_server_initiated());
        assert!(!DisconnectReason::Client.is_server_initiated());
    }
}
