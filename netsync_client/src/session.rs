//! Remembered player identity for silent rejoin.

use netsync_shared::net::ClientMsg;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerSession {
    pub name: String,
    pub team: String,
    pub joined: bool,
}

/// Holds the session from the first join until an intentional disconnect.
#[derive(Debug, Default)]
pub struct SessionStore {
    session: Option<PlayerSession>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the identity chosen at join time.
    ///
    /// Once a session is joined further calls keep the stored identity.
    /// Returns true if the store changed.
    pub fn set(&mut self, name: &str, team: &str) -> bool {
        if let Some(existing) = &self.session {
            if existing.joined {
                debug!(name = %existing.name, team = %existing.team, "Session already set");
                return false;
            }
        }
        self.session = Some(PlayerSession {
            name: name.to_string(),
            team: team.to_string(),
            joined: true,
        });
        true
    }

    /// Forgets the identity. Only an intentional disconnect calls this.
    pub fn clear(&mut self) {
        if self.session.take().is_some() {
            debug!("Session cleared");
        }
    }

    pub fn get(&self) -> Option<&PlayerSession> {
        self.session.as_ref()
    }

    pub fn is_joined(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.joined)
    }

    /// The `join` message to replay after a (re)connection, if any.
    pub fn rejoin_message(&self) -> Option<ClientMsg> {
        self.session
            .as_ref()
            .filter(|s| s.joined)
            .map(|s| ClientMsg::Join {
                name: s.name.clone(),
                team: s.team.clone(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_is_idempotent_after_join() {
        let mut store = SessionStore::new();
        assert!(store.set("ann", "red"));
        assert!(!store.set("bob", "blue"));
        let s = store.get().unwrap();
        assert_eq!(s.name, "ann");
        assert_eq!(s.team, "red");
    }

    #[test]
    fn rejoin_uses_stored_identity() {
        let mut store = SessionStore::new();
        assert!(store.rejoin_message().is_none());
        store.set("ann", "red");
        assert_eq!(
            store.rejoin_message(),
            Some(ClientMsg::Join {
                name: "ann".into(),
                team: "red".into()
            })
        );
    }

    #[test]
    fn clear_stops_rejoin() {
        let mut store = SessionStore::new();
        store.set("ann", "red");
        store.clear();
        assert!(!store.is_joined());
        assert!(store.rejoin_message().is_none());
        assert!(store.set("bob", "blue"));
    }
}
