//! Server status snapshots.
//!
//! Servers in the wild send two shapes of `serverStatus`: the legacy
//! snake_case one (`current_players`, `max_players`, ...) and the camelCase
//! one. Both are normalized here, at the deserialization boundary, into a
//! single [`ServerStatusSnapshot`]. Unknown fields are logged and ignored.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Canonical server status. Replaced wholesale on every inbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawServerStatus", rename_all = "camelCase")]
pub struct ServerStatusSnapshot {
    pub online: bool,
    /// Server-side timestamp (ms since epoch), when the server provides one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_update_timestamp: Option<i64>,
    pub current_players: u32,
    pub max_players: u32,
    pub queue_length: u32,
    pub has_space: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub per_team_counts: Option<BTreeMap<String, u32>>,
}

impl ServerStatusSnapshot {
    /// Snapshot as a server would report itself with the given occupancy.
    pub fn with_occupancy(current_players: u32, max_players: u32, queue_length: u32) -> Self {
        Self {
            online: true,
            last_update_timestamp: None,
            current_players,
            max_players,
            queue_length,
            has_space: current_players < max_players,
            per_team_counts: None,
        }
    }
}

fn default_online() -> bool {
    true
}

/// Accepts both field spellings.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawServerStatus {
    #[serde(default = "default_online")]
    online: bool,
    #[serde(default, alias = "last_update_timestamp", alias = "lastUpdate", alias = "last_update")]
    last_update_timestamp: Option<i64>,
    #[serde(default, alias = "current_players")]
    current_players: u32,
    #[serde(default, alias = "max_players")]
    max_players: u32,
    #[serde(default, alias = "queue_length")]
    queue_length: u32,
    #[serde(default, alias = "has_space")]
    has_space: Option<bool>,
    #[serde(default, alias = "per_team_counts", alias = "teamCounts", alias = "team_counts")]
    per_team_counts: Option<BTreeMap<String, u32>>,
    #[serde(flatten)]
    unknown: BTreeMap<String, serde_json::Value>,
}

impl From<RawServerStatus> for ServerStatusSnapshot {
    fn from(raw: RawServerStatus) -> Self {
        if !raw.unknown.is_empty() {
            let fields: Vec<&str> = raw.unknown.keys().map(String::as_str).collect();
            debug!(?fields, "Ignoring unknown serverStatus fields");
        }
        Self {
            online: raw.online,
            last_update_timestamp: raw.last_update_timestamp,
            current_players: raw.current_players,
            max_players: raw.max_players,
            queue_length: raw.queue_length,
            has_space: raw
                .has_space
                .unwrap_or(raw.current_players < raw.max_players),
            per_team_counts: raw.per_team_counts,
        }
    }
}
