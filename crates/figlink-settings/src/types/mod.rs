//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase")]` for the settings file
//! format. Each type implements [`Default`] with production values, and every
//! section is `#[serde(default)]` so partial JSON is accepted.

mod client;
mod server;

pub use client::*;
pub use server::*;

use figlink_core::ReconnectPolicy;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
///
/// Loaded from `~/.figlink/settings.json` with defaults applied for missing
/// fields. Environment variables can override specific values.
///
/// ```json
/// {
///   "client": { "url": "ws://127.0.0.1:8765/ws" },
///   "reconnect": { "maxAttempts": 10 },
///   "server": { "port": 9000 }
/// }
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FiglinkSettings {
    /// Settings schema version.
    pub version: String,
    /// Client-side connection settings.
    pub client: ClientSettings,
    /// Automatic reconnection policy.
    pub reconnect: ReconnectPolicy,
    /// Application-level PING/PONG liveness.
    pub keepalive: KeepaliveSettings,
    /// Headless-service settings.
    pub server: ServerSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

impl Default for FiglinkSettings {
    fn default() -> Self {
        Self {
            version: "0.1.0".to_string(),
            client: ClientSettings::default(),
            reconnect: ReconnectPolicy::default(),
            keepalive: KeepaliveSettings::default(),
            server: ServerSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl FiglinkSettings {
    /// Reject combinations the runtime cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.client.request_timeout_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "client.requestTimeoutMs must be positive".into(),
            ));
        }
        if self.keepalive.interval_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "keepalive.intervalMs must be positive".into(),
            ));
        }
        if self.reconnect.multiplier < 1.0 || !self.reconnect.multiplier.is_finite() {
            return Err(SettingsError::InvalidValue(format!(
                "reconnect.multiplier must be >= 1.0, got {}",
                self.reconnect.multiplier
            )));
        }
        if !(0.0..=1.0).contains(&self.reconnect.jitter_factor) {
            return Err(SettingsError::InvalidValue(format!(
                "reconnect.jitterFactor must be within 0.0..=1.0, got {}",
                self.reconnect.jitter_factor
            )));
        }
        if self.server.heartbeat_timeout_ms <= self.server.heartbeat_interval_ms {
            return Err(SettingsError::InvalidValue(
                "server.heartbeatTimeoutMs must exceed server.heartbeatIntervalMs".into(),
            ));
        }
        Ok(())
    }
}

/// Log output format.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Compact human-readable lines.
    #[default]
    Compact,
    /// One JSON object per line.
    Json,
}

/// Logging settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// Output format.
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let s = FiglinkSettings::default();
        assert_eq!(s.client.request_timeout_ms, 30_000);
        assert_eq!(s.keepalive.interval_ms, 30_000);
        assert_eq!(s.keepalive.max_missed, 3);
        assert_eq!(s.reconnect.max_attempts, 5);
        assert_eq!(s.server.port, 8765);
        assert_eq!(s.logging.format, LogFormat::Compact);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn serializes_camel_case() {
        let v = serde_json::to_value(FiglinkSettings::default()).unwrap();
        assert!(v["client"]["requestTimeoutMs"].is_u64());
        assert!(v["reconnect"]["baseDelayMs"].is_u64());
        assert!(v["keepalive"]["maxMissed"].is_u64());
        assert!(v["server"]["heartbeatIntervalMs"].is_u64());
        assert_eq!(v["logging"]["format"], "compact");
    }

    #[test]
    fn partial_section_keeps_defaults() {
        let s: FiglinkSettings =
            serde_json::from_str(r#"{"keepalive": {"maxMissed": 0}}"#).unwrap();
        assert_eq!(s.keepalive.max_missed, 0);
        assert_eq!(s.keepalive.interval_ms, 30_000);
    }

    #[test]
    fn validate_rejects_shrinking_backoff() {
        let mut s = FiglinkSettings::default();
        s.reconnect.multiplier = 0.5;
        assert!(matches!(s.validate(), Err(SettingsError::InvalidValue(_))));
    }

    #[test]
    fn validate_rejects_heartbeat_timeout_below_interval() {
        let mut s = FiglinkSettings::default();
        s.server.heartbeat_timeout_ms = s.server.heartbeat_interval_ms;
        assert!(s.validate().is_err());
    }
}
