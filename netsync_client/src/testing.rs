//! Scriptable transport for state machine tests.

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, Mutex,
};

use async_trait::async_trait;
use netsync_shared::net::{ClientMsg, TransportError};

use crate::transport::{
    ConnectOptions, EventSink, Transport, TransportEvent, TransportFactory, TransportKind,
};

#[derive(Debug)]
pub struct MockTransport {
    pub id: String,
    pub kind: TransportKind,
    pub sink: EventSink,
    pub connected: AtomicBool,
    pub closed: AtomicBool,
    pub sent: Mutex<Vec<ClientMsg>>,
    live: Arc<AtomicUsize>,
}

impl MockTransport {
    pub fn emit(&self, event: TransportEvent) {
        match &event {
            TransportEvent::Connected => self.connected.store(true, Ordering::SeqCst),
            TransportEvent::Disconnected(_) | TransportEvent::ConnectError(_) => {
                self.connected.store(false, Ordering::SeqCst)
            }
            TransportEvent::Message(_) => {}
        }
        self.sink.emit(event);
    }

    pub fn take_sent(&self) -> Vec<ClientMsg> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn send(&self, msg: ClientMsg) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.sent.lock().unwrap().push(msg);
        Ok(())
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
        self.connected.store(false, Ordering::SeqCst);
    }
}

/// Hands out [`MockTransport`]s and keeps them for inspection.
#[derive(Default)]
pub struct MockFactory {
    pub created: Mutex<Vec<Arc<MockTransport>>>,
    pub live: Arc<AtomicUsize>,
    pub fail_next: AtomicBool,
}

impl MockFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn last(&self) -> Arc<MockTransport> {
        self.created.lock().unwrap().last().cloned().unwrap()
    }

    pub fn count(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

impl TransportFactory for MockFactory {
    fn create(
        &self,
        options: &ConnectOptions,
        sink: EventSink,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(TransportError::InvalidAddress("mock".into()));
        }
        let mut created = self.created.lock().unwrap();
        let transport = Arc::new(MockTransport {
            id: format!("mock-{}", created.len() + 1),
            kind: options.kind(),
            sink,
            connected: AtomicBool::new(!options.multiplayer),
            closed: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
            live: self.live.clone(),
        });
        self.live.fetch_add(1, Ordering::SeqCst);
        created.push(transport.clone());
        Ok(transport)
    }
}
