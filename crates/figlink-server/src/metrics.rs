//! Prometheus metrics recorder and `/metrics` rendering.
//!
//! Counters are recorded through the `metrics` facade; without an installed
//! recorder they are no-ops, so library users and tests pay nothing.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus recorder globally.
///
/// Fails when another global recorder is already installed.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format from a recorder handle.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

/// Envelopes decoded from clients (counter, labels: type).
pub const EVENTS_RECEIVED_TOTAL: &str = "figlink_events_received_total";
/// Envelopes written to clients (counter, labels: type).
pub const EVENTS_SENT_TOTAL: &str = "figlink_events_sent_total";
/// Error envelopes written to clients (counter, labels: code).
pub const EVENTS_ERRORS_TOTAL: &str = "figlink_events_errors_total";
/// Outbound envelopes dropped on a full or closed queue (counter).
pub const EVENTS_DROPPED_TOTAL: &str = "figlink_events_dropped_total";
/// WebSocket connections accepted (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "figlink_ws_connections_total";
/// WebSocket connections rejected at the connection limit (counter).
pub const WS_CONNECTIONS_REJECTED_TOTAL: &str = "figlink_ws_connections_rejected_total";
/// Active WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "figlink_ws_connections_active";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_without_global_install() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        metrics::with_local_recorder(&recorder, || {
            metrics::counter!(EVENTS_RECEIVED_TOTAL, "type" => "PING").increment(2);
        });
        let output = render(&handle);
        assert!(output.contains(EVENTS_RECEIVED_TOTAL));
        assert!(output.contains("type=\"PING\""));
    }

    #[test]
    fn metric_names_are_snake_case() {
        let names = [
            EVENTS_RECEIVED_TOTAL,
            EVENTS_SENT_TOTAL,
            EVENTS_ERRORS_TOTAL,
            EVENTS_DROPPED_TOTAL,
            WS_CONNECTIONS_TOTAL,
            WS_CONNECTIONS_REJECTED_TOTAL,
            WS_CONNECTIONS_ACTIVE,
        ];
        for name in names {
            assert!(
                name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "metric name '{name}' must be snake_case"
            );
        }
    }
}
