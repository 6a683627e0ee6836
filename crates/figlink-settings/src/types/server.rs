//! Headless-service settings.

use serde::{Deserialize, Serialize};

/// Server network and runtime settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Listen port for both `/ws` and `/health`.
    pub port: u16,
    /// WebSocket-level ping interval, in ms.
    pub heartbeat_interval_ms: u64,
    /// Connection is dropped after this long without a pong, in ms.
    pub heartbeat_timeout_ms: u64,
    /// Per-connection outbound queue capacity.
    pub max_send_queue: usize,
    /// Maximum simultaneous connections.
    pub max_connections: usize,
    /// Simulated work time of the default node-update handler, in ms.
    pub update_delay_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8765,
            heartbeat_interval_ms: 30_000,
            heartbeat_timeout_ms: 90_000,
            max_send_queue: 256,
            max_connections: 64,
            update_delay_ms: 500,
        }
    }
}
