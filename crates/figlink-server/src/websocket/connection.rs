//! WebSocket client connection state.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use figlink_core::envelope::ConnectPayload;
use figlink_core::{Envelope, SessionId, codec};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::metrics::{EVENTS_DROPPED_TOTAL, EVENTS_SENT_TOTAL};

/// What the writer task puts on the socket.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outbound {
    /// Encoded envelope.
    Text(String),
    /// WebSocket-level ping.
    Ping,
    /// Close frame; the writer stops after sending it.
    Close {
        /// Close code.
        code: u16,
        /// Close reason.
        reason: String,
    },
}

/// What the client announced about itself in CONNECT.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerInfo {
    /// Client name from the CONNECT payload.
    pub client: String,
    /// Client version from the CONNECT payload.
    pub version: String,
    /// Session ID the client is using.
    pub session_id: SessionId,
}

/// A connected WebSocket client.
pub struct ClientConnection {
    /// Server-side session ID, stamped on envelopes the server originates.
    pub id: SessionId,
    peer: Mutex<Option<PeerInfo>>,
    tx: mpsc::Sender<Outbound>,
    /// When the connection was accepted.
    pub connected_at: Instant,
    /// Whether the client responded since the last heartbeat check.
    pub is_alive: AtomicBool,
    last_pong: Mutex<Instant>,
    /// Outbound messages dropped on a full or closed queue.
    pub dropped_messages: AtomicU64,
}

impl ClientConnection {
    /// Create a new connection with a fresh server session.
    pub fn new(tx: mpsc::Sender<Outbound>) -> Self {
        let now = Instant::now();
        Self {
            id: SessionId::new(),
            peer: Mutex::new(None),
            tx,
            connected_at: now,
            is_alive: AtomicBool::new(true),
            last_pong: Mutex::new(now),
            dropped_messages: AtomicU64::new(0),
        }
    }

    /// Record the client's CONNECT announcement.
    pub fn bind_peer(&self, payload: ConnectPayload, session_id: SessionId) {
        *self.peer.lock() = Some(PeerInfo {
            client: payload.client,
            version: payload.version,
            session_id,
        });
    }

    /// Forget the client's announcement (DISCONNECT received).
    pub fn unbind_peer(&self) -> Option<PeerInfo> {
        self.peer.lock().take()
    }

    /// The client's announcement, if any.
    pub fn peer(&self) -> Option<PeerInfo> {
        self.peer.lock().clone()
    }

    fn enqueue(&self, message: Outbound) -> bool {
        if self.tx.try_send(message).is_ok() {
            true
        } else {
            let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
            metrics::counter!(EVENTS_DROPPED_TOTAL).increment(1);
            false
        }
    }

    /// Encode and queue an envelope.
    ///
    /// Returns `false` if the queue is full or the writer is gone.
    pub fn send_envelope(&self, envelope: &Envelope) -> bool {
        let sent = self.enqueue(Outbound::Text(codec::encode(envelope)));
        if sent {
            metrics::counter!(EVENTS_SENT_TOTAL, "type" => envelope.event_type.to_string()).increment(1);
        }
        sent
    }

    /// Queue a WebSocket ping.
    pub fn send_ping(&self) -> bool {
        self.enqueue(Outbound::Ping)
    }

    /// Queue a close frame.
    pub fn close(&self, code: u16, reason: &str) -> bool {
        self.enqueue(Outbound::Close {
            code,
            reason: reason.to_string(),
        })
    }

    /// Total messages dropped for this connection.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Mark the connection as alive (pong or any inbound frame).
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
        *self.last_pong.lock() = Instant::now();
    }

    /// Time since the last sign of life.
    pub fn last_pong_elapsed(&self) -> Duration {
        self.last_pong.lock().elapsed()
    }

    /// Read and reset the alive flag.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figlink_core::{EventSource, EventType};
    use serde_json::json;

    fn make_connection() -> (ClientConnection, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(32);
        (ClientConnection::new(tx), rx)
    }

    #[tokio::test]
    async fn send_envelope_encodes_text() {
        let (conn, mut rx) = make_connection();
        let env = Envelope::new(EventType::Pong, json!({"message": "hi"}), EventSource::Server, conn.id.clone());
        assert!(conn.send_envelope(&env));

        let Some(Outbound::Text(text)) = rx.recv().await else {
            panic!("expected text frame");
        };
        assert_eq!(codec::decode(&text).unwrap(), env);
    }

    #[tokio::test]
    async fn full_queue_counts_drops() {
        let (tx, _rx) = mpsc::channel(1);
        let conn = ClientConnection::new(tx);
        assert!(conn.send_ping());
        assert!(!conn.send_ping());
        assert!(!conn.close(1000, "bye"));
        assert_eq!(conn.drop_count(), 2);
    }

    #[test]
    fn closed_queue_returns_false() {
        let (tx, rx) = mpsc::channel(4);
        let conn = ClientConnection::new(tx);
        drop(rx);
        assert!(!conn.send_ping());
    }

    #[test]
    fn peer_binding_roundtrip() {
        let (conn, _rx) = make_connection();
        assert!(conn.peer().is_none());

        let session = SessionId::new();
        conn.bind_peer(
            ConnectPayload {
                client: "plugin".into(),
                version: "1.0".into(),
            },
            session.clone(),
        );
        assert_eq!(conn.peer().unwrap().session_id, session);
        assert_eq!(conn.unbind_peer().unwrap().client, "plugin");
        assert!(conn.peer().is_none());
    }

    #[test]
    fn alive_flag_resets_on_check() {
        let (conn, _rx) = make_connection();
        assert!(conn.check_alive());
        assert!(!conn.check_alive());
        conn.mark_alive();
        assert!(conn.check_alive());
        assert!(conn.last_pong_elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn each_connection_gets_own_session() {
        let (a, _ra) = make_connection();
        let (b, _rb) = make_connection();
        assert_ne!(a.id, b.id);
        assert!(a.age() < Duration::from_secs(1));
    }
}
