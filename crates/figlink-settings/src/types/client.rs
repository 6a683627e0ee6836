//! Client connection and keepalive settings.

use serde::{Deserialize, Serialize};

/// Client-side connection settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientSettings {
    /// WebSocket URL of the headless service.
    pub url: String,
    /// Name announced in the `CONNECT` notification.
    pub client_name: String,
    /// Default timeout for correlated requests, in ms.
    pub request_timeout_ms: u64,
    /// Bound on a single transport open, in ms.
    pub connect_timeout_ms: u64,
    /// Inbound frames larger than this are discarded.
    pub max_frame_bytes: usize,
    /// Capacity of the command channel into the connection actor.
    pub command_buffer: usize,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8765/ws".to_string(),
            client_name: "figlink".to_string(),
            request_timeout_ms: 30_000,
            connect_timeout_ms: 10_000,
            max_frame_bytes: 1024 * 1024,
            command_buffer: 256,
        }
    }
}

/// Application-level PING/PONG liveness settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KeepaliveSettings {
    /// Interval between PINGs while open, in ms.
    pub interval_ms: u64,
    /// Consecutive unanswered PINGs that count as a dead connection.
    /// `0` only logs.
    pub max_missed: u32,
}

impl Default for KeepaliveSettings {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            max_missed: 3,
        }
    }
}
