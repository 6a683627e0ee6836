//! `/health` body: server liveness plus one entry per connected peer.

use std::sync::Arc;
use std::time::Instant;

use figlink_core::SessionId;
use serde::Serialize;

use crate::websocket::connection::ClientConnection;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// `"ok"` while serving, `"stopping"` once shutdown began.
    pub status: &'static str,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Open WebSocket connections.
    pub connections: usize,
    /// Connections whose client announced itself with CONNECT.
    pub active_sessions: usize,
    /// Outbound envelopes dropped across all live connections.
    pub dropped_messages: u64,
    /// Per-connection detail, oldest first.
    pub peers: Vec<PeerHealth>,
}

/// One connected client as seen by the server.
#[derive(Debug, Clone, Serialize)]
pub struct PeerHealth {
    /// Session the server stamps on envelopes it originates.
    pub server_session_id: SessionId,
    /// Client name from CONNECT, absent until announced.
    pub client: Option<String>,
    /// Client version from CONNECT.
    pub version: Option<String>,
    /// Session the client announced.
    pub client_session_id: Option<SessionId>,
    /// Seconds since the socket was accepted.
    pub connected_secs: u64,
    /// Milliseconds since anything arrived from the client.
    pub last_seen_ms: u64,
    /// Outbound envelopes dropped on this connection.
    pub dropped_messages: u64,
}

impl PeerHealth {
    fn of(connection: &ClientConnection) -> Self {
        let peer = connection.peer();
        Self {
            server_session_id: connection.id.clone(),
            client: peer.as_ref().map(|p| p.client.clone()),
            version: peer.as_ref().map(|p| p.version.clone()),
            client_session_id: peer.map(|p| p.session_id),
            connected_secs: connection.age().as_secs(),
            last_seen_ms: u64::try_from(connection.last_pong_elapsed().as_millis()).unwrap_or(u64::MAX),
            dropped_messages: connection.drop_count(),
        }
    }
}

/// Build the health body from the live connection set.
pub fn health_check(
    start_time: Instant,
    stopping: bool,
    connections: &[Arc<ClientConnection>],
) -> HealthResponse {
    let mut peers: Vec<PeerHealth> = connections.iter().map(|c| PeerHealth::of(c)).collect();
    peers.sort_by(|a, b| {
        b.connected_secs
            .cmp(&a.connected_secs)
            .then_with(|| a.server_session_id.as_str().cmp(b.server_session_id.as_str()))
    });
    HealthResponse {
        status: if stopping { "stopping" } else { "ok" },
        uptime_secs: start_time.elapsed().as_secs(),
        connections: peers.len(),
        active_sessions: peers.iter().filter(|p| p.client.is_some()).count(),
        dropped_messages: peers.iter().map(|p| p.dropped_messages).sum(),
        peers,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figlink_core::envelope::ConnectPayload;
    use tokio::sync::mpsc;

    fn connection() -> Arc<ClientConnection> {
        let (tx, _rx) = mpsc::channel(1);
        Arc::new(ClientConnection::new(tx))
    }

    #[test]
    fn empty_server_is_ok() {
        let resp = health_check(Instant::now(), false, &[]);
        assert_eq!(resp.status, "ok");
        assert_eq!(resp.connections, 0);
        assert!(resp.peers.is_empty());
        assert!(resp.uptime_secs < 2);
    }

    #[test]
    fn stopping_is_reported() {
        assert_eq!(health_check(Instant::now(), true, &[]).status, "stopping");
    }

    #[test]
    fn announced_peers_count_as_sessions() {
        let announced = connection();
        announced.bind_peer(
            ConnectPayload {
                client: "figma-plugin".into(),
                version: "1.4.0".into(),
            },
            SessionId::from("plugin-session"),
        );
        let anonymous = connection();

        let resp = health_check(Instant::now(), false, &[announced, anonymous]);
        assert_eq!(resp.connections, 2);
        assert_eq!(resp.active_sessions, 1);
        let named = resp.peers.iter().find(|p| p.client.is_some()).unwrap();
        assert_eq!(named.client.as_deref(), Some("figma-plugin"));
        assert_eq!(named.client_session_id.as_ref().unwrap().as_str(), "plugin-session");
    }

    #[test]
    fn dropped_messages_are_summed() {
        // Capacity 1 and the receiver is gone, so every send drops.
        let conn = connection();
        assert!(!conn.send_ping());
        assert!(!conn.send_ping());
        let resp = health_check(Instant::now(), false, &[conn]);
        assert_eq!(resp.dropped_messages, 2);
        assert_eq!(resp.peers[0].dropped_messages, 2);
    }

    #[test]
    fn serialization() {
        let resp = health_check(Instant::now(), false, &[connection()]);
        let parsed = serde_json::to_value(&resp).unwrap();
        assert_eq!(parsed["status"], "ok");
        assert_eq!(parsed["connections"], 1);
        assert_eq!(parsed["active_sessions"], 0);
        assert!(parsed["peers"][0]["server_session_id"].is_string());
        assert!(parsed["peers"][0]["client"].is_null());
    }
}
