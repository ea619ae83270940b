//! Server status tracking and staleness.

use std::time::Duration;

use netsync_shared::status::ServerStatusSnapshot;
use tokio::time::Instant;

/// Latest status snapshot plus when it arrived.
///
/// Staleness only affects what the UI is told; it never forces a disconnect.
#[derive(Debug)]
pub struct StatusTracker {
    stale_after: Duration,
    snapshot: Option<ServerStatusSnapshot>,
    received_at: Option<Instant>,
    reported_online: bool,
}

impl StatusTracker {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            stale_after,
            snapshot: None,
            received_at: None,
            reported_online: false,
        }
    }

    /// Replaces the snapshot wholesale.
    pub fn record(&mut self, snapshot: ServerStatusSnapshot, now: Instant) {
        self.snapshot = Some(snapshot);
        self.received_at = Some(now);
    }

    pub fn snapshot(&self) -> Option<&ServerStatusSnapshot> {
        self.snapshot.as_ref()
    }

    /// Online if the link is up and a fresh, online snapshot exists.
    pub fn is_online(&self, now: Instant, link_up: bool) -> bool {
        let fresh = self
            .received_at
            .is_some_and(|at| now.saturating_duration_since(at) < self.stale_after);
        link_up && fresh && self.snapshot.as_ref().is_some_and(|s| s.online)
    }

    /// Re-evaluates presumed-online and returns the new value if it flipped.
    pub fn observe(&mut self, now: Instant, link_up: bool) -> Option<bool> {
        let online = self.is_online(now, link_up);
        if online == self.reported_online {
            return None;
        }
        self.reported_online = online;
        Some(online)
    }

    /// When the snapshot currently reported online goes stale.
    pub fn stale_at(&self) -> Option<Instant> {
        if !self.reported_online {
            return None;
        }
        self.received_at.map(|at| at + self.stale_after)
    }

    pub fn reset(&mut self) {
        self.snapshot = None;
        self.received_at = None;
    }
}
