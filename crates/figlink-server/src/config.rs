//! Server configuration.

use std::time::Duration;

use figlink_settings::FiglinkSettings;

/// Configuration for the figlink server.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (`0` auto-assigns).
    pub port: u16,
    /// Maximum concurrent WebSocket connections.
    pub max_connections: usize,
    /// Interval between WebSocket pings.
    pub heartbeat_interval: Duration,
    /// A connection silent for this long is closed.
    pub heartbeat_timeout: Duration,
    /// Per-connection outbound queue capacity.
    pub max_send_queue: usize,
    /// Inbound frames above this size are answered with an error.
    pub max_frame_bytes: usize,
    /// Simulated work time of the default node-update handler.
    pub update_delay: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from(&FiglinkSettings::default())
    }
}

impl From<&FiglinkSettings> for ServerConfig {
    fn from(settings: &FiglinkSettings) -> Self {
        let server = &settings.server;
        Self {
            host: server.host.clone(),
            port: server.port,
            max_connections: server.max_connections,
            heartbeat_interval: Duration::from_millis(server.heartbeat_interval_ms),
            heartbeat_timeout: Duration::from_millis(server.heartbeat_timeout_ms),
            max_send_queue: server.max_send_queue,
            max_frame_bytes: settings.client.max_frame_bytes,
            update_delay: Duration::from_millis(server.update_delay_ms),
        }
    }
}

impl ServerConfig {
    /// `host:port` string to bind.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Default config listening on an OS-assigned loopback port.
    pub fn ephemeral() -> Self {
        Self {
            port: 0,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_settings() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.host, "127.0.0.1");
        assert_eq!(cfg.port, 8765);
        assert_eq!(cfg.max_connections, 64);
        assert_eq!(cfg.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(cfg.heartbeat_timeout, Duration::from_secs(90));
        assert_eq!(cfg.update_delay, Duration::from_millis(500));
    }

    #[test]
    fn from_custom_settings() {
        let mut settings = FiglinkSettings::default();
        settings.server.host = "0.0.0.0".into();
        settings.server.port = 9090;
        settings.server.update_delay_ms = 0;
        settings.client.max_frame_bytes = 1024;

        let cfg = ServerConfig::from(&settings);
        assert_eq!(cfg.bind_address(), "0.0.0.0:9090");
        assert_eq!(cfg.update_delay, Duration::ZERO);
        assert_eq!(cfg.max_frame_bytes, 1024);
    }

    #[test]
    fn ephemeral_uses_port_zero() {
        let cfg = ServerConfig::ephemeral();
        assert_eq!(cfg.port, 0);
        assert_eq!(cfg.bind_address(), "127.0.0.1:0");
    }
}
