//! Configuration system.
//!
//! Loads client/server configuration from JSON strings (file IO left to app).
//! Every field has a default so partial files are valid.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server address, e.g. `127.0.0.1:40000`.
    pub server_addr: String,
    /// Local simulation tick rate (pose samples per second).
    pub tick_hz: u32,
    pub player_name: String,
    pub team: String,
    pub transport: TransportSettings,
    pub reconnect: ReconnectSettings,
    pub pose: PoseSettings,
    pub status: StatusSettings,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:40000".to_string(),
            tick_hz: 60,
            player_name: "Player".to_string(),
            team: "red".to_string(),
            transport: TransportSettings::default(),
            reconnect: ReconnectSettings::default(),
            pose: PoseSettings::default(),
            status: StatusSettings::default(),
        }
    }
}

impl ClientConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }
}

/// Network transport tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    pub connect_timeout_ms: u64,
    /// Payloads above this many bytes are compressed. `None` disables compression.
    pub compression_threshold: Option<usize>,
    /// Low-level reconnects after ordinary link loss.
    pub link_retry_attempts: u32,
    pub link_retry_delay_ms: u64,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
            compression_threshold: Some(1024),
            link_retry_attempts: 5,
            link_retry_delay_ms: 500,
        }
    }
}

impl TransportSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn link_retry_delay(&self) -> Duration {
        Duration::from_millis(self.link_retry_delay_ms)
    }
}

/// Backoff after server-initiated disconnects.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectSettings {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            max_attempts: 15,
        }
    }
}

/// Which pose delivery strategy is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoseMode {
    /// Flush the latest sample on a fixed interval.
    #[default]
    Interval,
    /// Test each sample as it arrives, rate-limited.
    Throttled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoseSettings {
    pub mode: PoseMode,
    pub interval_ms: u64,
    pub min_interval_ms: u64,
    /// Minimum Euclidean displacement worth sending.
    pub position_threshold: f32,
    /// Minimum per-axis rotation change worth sending.
    pub rotation_threshold: f32,
}

impl Default for PoseSettings {
    fn default() -> Self {
        Self {
            mode: PoseMode::Interval,
            interval_ms: 200,
            min_interval_ms: 100,
            position_threshold: 0.1,
            rotation_threshold: 0.05,
        }
    }
}

impl PoseSettings {
    /// Never zero: `tokio::time::interval` panics on a zero period.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusSettings {
    /// Without a `serverStatus` for this long the server is presumed offline.
    pub stale_after_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for StatusSettings {
    fn default() -> Self {
        Self {
            stale_after_ms: 30_000,
            poll_interval_ms: 10_000,
        }
    }
}

impl StatusSettings {
    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }

    /// Never zero, like [`PoseSettings::interval`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// Reference server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address, e.g. `127.0.0.1:40000`.
    pub listen_addr: String,
    pub max_players: u32,
    pub compression_threshold: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:40000".to_string(),
            max_players: 16,
            compression_threshold: Some(1024),
        }
    }
}

impl ServerConfig {
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }
}
