//! Client runtime configuration.

use std::time::Duration;

use figlink_core::{EventSource, ReconnectPolicy};
use figlink_settings::FiglinkSettings;

/// Configuration of one [`crate::FiglinkClient`].
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Name announced in the `CONNECT` notification.
    pub client_name: String,
    /// Source stamped on outbound envelopes.
    pub source: EventSource,
    /// Default request timeout when a call does not pass one.
    pub request_timeout: Duration,
    /// Bound on a single transport open.
    pub connect_timeout: Duration,
    /// Inbound frames above this many bytes are discarded.
    pub max_frame_bytes: usize,
    /// Automatic reconnection.
    pub reconnect: ReconnectPolicy,
    /// Interval between keepalive PINGs; zero disables the monitor.
    pub keepalive_interval: Duration,
    /// Consecutive unanswered PINGs that count as connection death; `0` only logs.
    pub keepalive_max_missed: u32,
    /// Answer PINGs from the peer with a PONG.
    pub answer_pings: bool,
    /// Capacity of the command channel into the actor.
    pub command_buffer: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_name: "figlink".to_string(),
            source: EventSource::Client,
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            max_frame_bytes: 1024 * 1024,
            reconnect: ReconnectPolicy::default(),
            keepalive_interval: Duration::from_secs(30),
            keepalive_max_missed: 3,
            answer_pings: true,
            command_buffer: 256,
        }
    }
}

impl From<&FiglinkSettings> for ClientConfig {
    fn from(settings: &FiglinkSettings) -> Self {
        Self {
            client_name: settings.client.client_name.clone(),
            source: EventSource::Client,
            request_timeout: Duration::from_millis(settings.client.request_timeout_ms),
            connect_timeout: Duration::from_millis(settings.client.connect_timeout_ms),
            max_frame_bytes: settings.client.max_frame_bytes,
            reconnect: settings.reconnect.clone(),
            keepalive_interval: Duration::from_millis(settings.keepalive.interval_ms),
            keepalive_max_missed: settings.keepalive.max_missed,
            answer_pings: true,
            command_buffer: settings.client.command_buffer.max(1),
        }
    }
}
