//! TCP transport.
//!
//! One background task owns the socket. It:
//! - connects with a timeout,
//! - pumps length-prefixed frames both ways (compressing large payloads),
//! - retries on its own after ordinary link loss,
//! - stops for good on a server-initiated close, leaving that to the
//!   reconnection policy.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

use async_trait::async_trait;
use netsync_shared::{
    config::TransportSettings,
    net::{decode_frame, read_frame_bytes, write_frame, ClientMsg, ServerMsg, TransportError},
};
use tokio::{
    io::AsyncWriteExt,
    net::TcpStream,
    sync::{mpsc, watch},
    task::JoinHandle,
    time,
};
use tracing::{debug, info, warn};

use crate::transport::{DisconnectReason, EventSink, Transport, TransportEvent, TransportKind};

static NEXT_TRANSPORT_ID: AtomicU32 = AtomicU32::new(1);

/// How long `close()` waits for the link task before aborting it.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub struct NetworkTransport {
    id: String,
    connected: Arc<AtomicBool>,
    outbound: mpsc::UnboundedSender<ClientMsg>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl NetworkTransport {
    /// Validates the address and starts connecting in the background.
    ///
    /// Returns immediately; the outcome arrives on `sink` as
    /// [`TransportEvent::Connected`] or [`TransportEvent::ConnectError`].
    pub fn spawn(
        addr: &str,
        settings: &TransportSettings,
        sink: EventSink,
    ) -> Result<Self, TransportError> {
        validate_addr(addr)?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| TransportError::Io(std::io::Error::other(e)))?;

        let id = format!("net-{}", NEXT_TRANSPORT_ID.fetch_add(1, Ordering::Relaxed));
        let connected = Arc::new(AtomicBool::new(false));
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);

        let link = Link {
            id: id.clone(),
            addr: addr.to_string(),
            connect_timeout: settings.connect_timeout(),
            compression_threshold: settings.compression_threshold,
            retry_attempts: settings.link_retry_attempts,
            retry_delay: settings.link_retry_delay(),
            connected: connected.clone(),
            sink,
            outbound: outbound_rx,
            shutdown: shutdown_rx,
        };
        let task = runtime.spawn(link.run());

        Ok(Self {
            id,
            connected,
            outbound,
            shutdown,
            task: Mutex::new(Some(task)),
        })
    }
}

fn validate_addr(addr: &str) -> Result<(), TransportError> {
    let valid = addr
        .rsplit_once(':')
        .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok());
    if valid {
        Ok(())
    } else {
        Err(TransportError::InvalidAddress(addr.to_string()))
    }
}

#[async_trait]
impl Transport for NetworkTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Network
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn send(&self, msg: ClientMsg) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.outbound.send(msg).map_err(|_| TransportError::Closed)
    }

    async fn close(&self) {
        let _ = self.shutdown.send(true);
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut task) = task {
            if time::timeout(CLOSE_GRACE, &mut task).await.is_err() {
                warn!(transport = %self.id, "Link task did not stop, aborting");
                task.abort();
            }
        }
        self.connected.store(false, Ordering::Release);
        debug!(transport = %self.id, "Transport closed");
    }
}

/// How one connected session ended.
enum LinkEnd {
    Shutdown,
    ServerClose(String),
    Lost(String),
}

struct Link {
    id: String,
    addr: String,
    connect_timeout: Duration,
    compression_threshold: Option<usize>,
    retry_attempts: u32,
    retry_delay: Duration,
    connected: Arc<AtomicBool>,
    sink: EventSink,
    outbound: mpsc::UnboundedReceiver<ClientMsg>,
    shutdown: watch::Receiver<bool>,
}

impl Link {
    async fn run(mut self) {
        let mut ever_connected = false;
        let mut retries = 0u32;

        loop {
            let attempt = tokio::select! {
                _ = self.shutdown.changed() => return,
                r = time::timeout(self.connect_timeout, TcpStream::connect(self.addr.as_str())) => r,
            };
            let stream = match attempt {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    if !self.retry_or_give_up(ever_connected, &mut retries, e.to_string()).await {
                        return;
                    }
                    continue;
                }
                Err(_) => {
                    let why = TransportError::Timeout.to_string();
                    if !self.retry_or_give_up(ever_connected, &mut retries, why).await {
                        return;
                    }
                    continue;
                }
            };

            let _ = stream.set_nodelay(true);
            ever_connected = true;
            retries = 0;
            self.connected.store(true, Ordering::Release);
            info!(transport = %self.id, addr = %self.addr, "Link up");
            self.sink.emit(TransportEvent::Connected);

            let end = self.pump(stream).await;
            self.connected.store(false, Ordering::Release);

            match end {
                LinkEnd::Shutdown => return,
                LinkEnd::ServerClose(reason) => {
                    info!(transport = %self.id, %reason, "Server closed the session");
                    self.sink
                        .emit(TransportEvent::Disconnected(DisconnectReason::Server(reason)));
                    return;
                }
                LinkEnd::Lost(why) => {
                    warn!(transport = %self.id, error = %why, "Link lost");
                    self.sink
                        .emit(TransportEvent::Disconnected(DisconnectReason::LinkLost(why.clone())));
                    if !self.retry_or_give_up(true, &mut retries, why).await {
                        return;
                    }
                }
            }
        }
    }

    /// Waits out the retry delay if link recovery still has budget.
    /// Otherwise reports the failure and returns false.
    async fn retry_or_give_up(&mut self, ever_connected: bool, retries: &mut u32, why: String) -> bool {
        if ever_connected && *retries < self.retry_attempts {
            *retries += 1;
            debug!(transport = %self.id, attempt = *retries, "Retrying link");
            tokio::select! {
                _ = self.shutdown.changed() => false,
                _ = time::sleep(self.retry_delay) => true,
            }
        } else {
            warn!(transport = %self.id, error = %why, "Connect failed");
            self.sink.emit(TransportEvent::ConnectError(why));
            false
        }
    }

    async fn pump(&mut self, stream: TcpStream) -> LinkEnd {
        let (mut rd, mut wr) = stream.into_split();
        let (in_tx, mut in_rx) = mpsc::unbounded_channel::<Result<ServerMsg, String>>();

        let transport_id = self.id.clone();
        let reader = tokio::spawn(async move {
            loop {
                match read_frame_bytes(&mut rd).await {
                    Ok(Some(body)) => match decode_frame::<ServerMsg>(&body) {
                        Ok(msg) => {
                            if in_tx.send(Ok(msg)).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(transport = %transport_id, error = %e, "Dropping undecodable message");
                        }
                    },
                    Ok(None) => {
                        let _ = in_tx.send(Err("connection closed by peer".to_string()));
                        break;
                    }
                    Err(e) => {
                        let _ = in_tx.send(Err(e.to_string()));
                        break;
                    }
                }
            }
        });

        let compression_threshold = self.compression_threshold;
        let end = loop {
            tokio::select! {
                _ = self.shutdown.changed() => break LinkEnd::Shutdown,
                out = self.outbound.recv() => match out {
                    Some(msg) => {
                        debug!(transport = %self.id, event = msg.event_name(), "Send");
                        // A peer that stops reading must not hold up shutdown.
                        let written = tokio::select! {
                            _ = self.shutdown.changed() => break LinkEnd::Shutdown,
                            r = write_frame(&mut wr, &msg, compression_threshold) => r,
                        };
                        if let Err(e) = written {
                            break LinkEnd::Lost(e.to_string());
                        }
                    }
                    None => break LinkEnd::Shutdown,
                },
                inbound = in_rx.recv() => match inbound {
                    Some(Ok(ServerMsg::Disconnect { reason })) => break LinkEnd::ServerClose(reason),
                    Some(Ok(msg)) => {
                        self.sink.emit(TransportEvent::Message(msg));
                    }
                    Some(Err(why)) => break LinkEnd::Lost(why),
                    None => break LinkEnd::Lost("reader stopped".to_string()),
                },
            }
        };

        reader.abort();
        let _ = wr.shutdown().await;
        end
    }
}
