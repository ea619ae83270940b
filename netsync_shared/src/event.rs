//! Event and messaging system.
//!
//! A small typed event bus. Each event kind is its own Rust type with its own
//! subscriber list; publishing a `QueueUpdate` can only ever reach
//! `QueueUpdate` subscribers. Subscribers receive events on an unbounded
//! channel and unsubscribe by dropping the receiver.

use std::{
    any::{Any, TypeId},
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::trace;

use crate::{
    net::{JoinSuccess, PlayerMap, RelayKind},
    state::{ConnectionState, ErrorKind},
    status::ServerStatusSnapshot,
};

/// A payload that can travel over the [`EventBus`].
pub trait BusEvent: Clone + Send + 'static {
    /// Stable event name, used for logging.
    const NAME: &'static str;
}

/// Receiving half of a subscription.
pub type Subscription<E> = mpsc::UnboundedReceiver<E>;

type Subscribers<E> = Vec<mpsc::UnboundedSender<E>>;

/// Typed event bus. Cheap to clone; clones share subscribers.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<HashMap<TypeId, Box<dyn Any + Send>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new subscriber for `E`.
    pub fn subscribe<E: BusEvent>(&self) -> Subscription<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut map = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let list = map
            .entry(TypeId::of::<E>())
            .or_insert_with(|| Box::new(Subscribers::<E>::new()));
        if let Some(list) = list.downcast_mut::<Subscribers<E>>() {
            list.push(tx);
        }
        rx
    }

    /// Delivers `event` once to every live subscriber of `E`.
    ///
    /// Returns the number of subscribers reached. Closed subscriptions are pruned.
    pub fn publish<E: BusEvent>(&self, event: E) -> usize {
        let mut map = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(list) = map
            .get_mut(&TypeId::of::<E>())
            .and_then(|b| b.downcast_mut::<Subscribers<E>>())
        else {
            trace!(event = E::NAME, "No subscribers");
            return 0;
        };
        list.retain(|tx| tx.send(event.clone()).is_ok());
        trace!(event = E::NAME, delivered = list.len(), "Published");
        list.len()
    }

    /// Number of live subscribers for `E`.
    pub fn subscriber_count<E: BusEvent>(&self) -> usize {
        let mut map = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        map.get_mut(&TypeId::of::<E>())
            .and_then(|b| b.downcast_mut::<Subscribers<E>>())
            .map(|list| {
                list.retain(|tx| !tx.is_closed());
                list.len()
            })
            .unwrap_or(0)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus").finish_non_exhaustive()
    }
}

// ─── Bus events ───

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStateChange {
    pub state: ConnectionState,
}

impl BusEvent for ConnectionStateChange {
    const NAME: &'static str = "CONNECTION_STATE_CHANGE";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStatusUpdate {
    pub snapshot: ServerStatusSnapshot,
}

impl BusEvent for ServerStatusUpdate {
    const NAME: &'static str = "SERVER_STATUS_UPDATE";
}

/// Presumed-online flipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStatusChange(pub bool);

impl BusEvent for ServerStatusChange {
    const NAME: &'static str = "SERVER_STATUS_CHANGE";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueUpdate {
    pub position: u32,
    pub estimated_wait_time: String,
}

impl BusEvent for QueueUpdate {
    const NAME: &'static str = "QUEUE_UPDATE";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueReady;

impl BusEvent for QueueReady {
    const NAME: &'static str = "QUEUE_READY";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayersUpdate {
    pub players: PlayerMap,
}

impl BusEvent for PlayersUpdate {
    const NAME: &'static str = "PLAYERS_UPDATE";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinAccepted(pub JoinSuccess);

impl BusEvent for JoinAccepted {
    const NAME: &'static str = "JOIN_SUCCESS";
}

/// Published whenever the connection enters an error state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionError {
    pub kind: ErrorKind,
    pub message: String,
}

impl BusEvent for ConnectionError {
    const NAME: &'static str = "CONNECTION_ERROR";
}

/// A relay-only game event, forwarded verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameEvent {
    pub kind: RelayKind,
    pub payload: serde_json::Value,
}

impl BusEvent for GameEvent {
    const NAME: &'static str = "GAME_EVENT";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivers_only_to_matching_kind() {
        let bus = EventBus::new();
        let mut ready = bus.subscribe::<QueueReady>();
        let mut updates = bus.subscribe::<QueueUpdate>();

        assert_eq!(bus.publish(QueueReady), 1);
        assert_eq!(ready.try_recv().unwrap(), QueueReady);
        assert!(updates.try_recv().is_err());
    }

    #[test]
    fn each_subscriber_gets_one_copy() {
        let bus = EventBus::new();
        let mut a = bus.subscribe::<ServerStatusChange>();
        let mut b = bus.subscribe::<ServerStatusChange>();

        bus.publish(ServerStatusChange(false));

        assert_eq!(a.try_recv().unwrap(), ServerStatusChange(false));
        assert!(a.try_recv().is_err());
        assert_eq!(b.try_recv().unwrap(), ServerStatusChange(false));
    }

    #[test]
    fn dropped_subscription_is_pruned() {
        let bus = EventBus::new();
        let keep = bus.subscribe::<QueueReady>();
        let gone = bus.subscribe::<QueueReady>();
        drop(gone);

        assert_eq!(bus.publish(QueueReady), 1);
        assert_eq!(bus.subscriber_count::<QueueReady>(), 1);
        drop(keep);
        assert_eq!(bus.subscriber_count::<QueueReady>(), 0);
    }

    #[test]
    fn publish_without_subscribers_is_harmless() {
        let bus = EventBus::new();
        assert_eq!(bus.publish(QueueReady), 0);
    }
}
