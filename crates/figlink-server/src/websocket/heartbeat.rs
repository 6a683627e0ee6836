//! WebSocket ping/pong liveness monitoring.

use std::sync::Arc;
use std::time::Duration;

use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::connection::ClientConnection;

/// Outcome of the heartbeat loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatResult {
    /// The client stopped responding within the timeout window.
    TimedOut,
    /// The heartbeat was cancelled externally.
    Cancelled,
}

/// Consecutive silent intervals tolerated before the connection is dead:
/// `timeout / interval`, at least 1.
pub fn max_missed(interval: Duration, timeout: Duration) -> u32 {
    let interval_ms = interval.as_millis().max(1);
    u32::try_from(timeout.as_millis() / interval_ms)
        .unwrap_or(u32::MAX)
        .max(1)
}

/// Ping the client every `interval` until it goes silent or `cancel` fires.
///
/// Each tick checks whether anything arrived since the previous tick
/// (pong or frame). After `max_missed(interval, timeout)` silent ticks in a
/// row the loop returns [`HeartbeatResult::TimedOut`]. A zero or
/// unrepresentably long interval disables pinging; the loop then only waits
/// for `cancel`.
pub async fn run_heartbeat(
    connection: Arc<ClientConnection>,
    interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
) -> HeartbeatResult {
    let Some(first) = time::Instant::now().checked_add(interval).filter(|_| !interval.is_zero()) else {
        debug!(session_id = %connection.id, ?interval, "heartbeat disabled");
        cancel.cancelled().await;
        return HeartbeatResult::Cancelled;
    };
    let mut ticker = time::interval_at(first, interval);
    let limit = max_missed(interval, timeout);
    let mut missed: u32 = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if connection.check_alive() {
                    missed = 0;
                } else {
                    missed += 1;
                    debug!(session_id = %connection.id, missed, limit, "heartbeat missed");
                    if missed >= limit {
                        warn!(session_id = %connection.id, missed, "heartbeat timed out");
                        return HeartbeatResult::TimedOut;
                    }
                }
                let _ = connection.send_ping();
            }
            () = cancel.cancelled() => {
                return HeartbeatResult::Cancelled;
            }
        }
    }
}
