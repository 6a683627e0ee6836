//! In-process transport with a scriptable peer.
//!
//! Every successful [`MemoryTransport::open`] hands a [`MemoryPeer`] to the
//! paired [`MemoryListener`]. The peer sees exactly the frames the client
//! wrote and can inject frames, closes and errors. Opens can be made to fail
//! or to take time, which drives the reconnect paths in tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use figlink_core::{Envelope, ProtocolError, codec};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::transport::{OutboundFrame, Transport, TransportError, TransportEvent, TransportLink};

const LINK_BUFFER: usize = 64;

#[derive(Default)]
struct Script {
    failures: VecDeque<String>,
    refuse_all: bool,
    open_delay: Duration,
}

/// Transport whose links end in [`MemoryPeer`]s.
#[derive(Clone)]
pub struct MemoryTransport {
    accepted: mpsc::UnboundedSender<MemoryPeer>,
    script: Arc<Mutex<Script>>,
    attempts: Arc<AtomicUsize>,
}

/// Receives the peer side of every link opened through a [`MemoryTransport`].
pub struct MemoryListener {
    accepted: mpsc::UnboundedReceiver<MemoryPeer>,
}

impl MemoryTransport {
    /// New transport and the listener receiving its peers.
    #[must_use]
    pub fn new() -> (Self, MemoryListener) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Self {
            accepted: tx,
            script: Arc::new(Mutex::new(Script::default())),
            attempts: Arc::new(AtomicUsize::new(0)),
        };
        (transport, MemoryListener { accepted: rx })
    }

    /// Make the next `count` opens fail.
    pub fn fail_next(&self, count: usize, reason: &str) {
        let mut script = self.script.lock();
        script
            .failures
            .extend(std::iter::repeat_n(reason.to_string(), count));
    }

    /// Make every open fail until called again with `false`.
    pub fn refuse_all(&self, refuse: bool) {
        self.script.lock().refuse_all = refuse;
    }

    /// Delay every open by `delay`.
    pub fn set_open_delay(&self, delay: Duration) {
        self.script.lock().open_delay = delay;
    }

    /// Number of opens attempted so far, successful or not.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self, address: &str) -> Result<TransportLink, TransportError> {
        let _ = self.attempts.fetch_add(1, Ordering::SeqCst);
        let delay = self.script.lock().open_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let failure = {
            let mut script = self.script.lock();
            if script.refuse_all {
                Some("connection refused".to_string())
            } else {
                script.failures.pop_front()
            }
        };
        if let Some(reason) = failure {
            return Err(TransportError::Connect {
                address: address.to_string(),
                reason,
            });
        }

        let (out_tx, out_rx) = mpsc::channel(LINK_BUFFER);
        let (in_tx, in_rx) = mpsc::channel(LINK_BUFFER);
        let peer = MemoryPeer {
            address: address.to_string(),
            from_client: out_rx,
            to_client: in_tx,
        };
        self.accepted
            .send(peer)
            .map_err(|_| TransportError::Connect {
                address: address.to_string(),
                reason: "listener dropped".into(),
            })?;
        Ok(TransportLink {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

impl MemoryListener {
    /// Next opened link, or `None` once the transport is dropped.
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.accepted.recv().await
    }
}

/// The far end of one in-memory link.
///
/// Dropping the peer ends the client's inbound stream, which the client sees
/// as an unexpected loss.
pub struct MemoryPeer {
    /// Address the client dialed.
    pub address: String,
    from_client: mpsc::Receiver<OutboundFrame>,
    to_client: mpsc::Sender<TransportEvent>,
}

impl MemoryPeer {
    /// Next raw frame written by the client, `None` once the client dropped the link.
    pub async fn recv_frame(&mut self) -> Option<OutboundFrame> {
        self.from_client.recv().await
    }

    /// Next envelope written by the client.
    ///
    /// Returns `None` when the client closed or dropped the link.
    pub async fn recv_envelope(&mut self) -> Option<Result<Envelope, ProtocolError>> {
        match self.from_client.recv().await? {
            OutboundFrame::Text(text) => Some(codec::decode(&text)),
            OutboundFrame::Close { .. } => None,
        }
    }

    /// Next envelope of the client that is not a keepalive PING or the
    /// CONNECT announcement.
    pub async fn recv_business(&mut self) -> Option<Envelope> {
        loop {
            let envelope = self.recv_envelope().await?.ok()?;
            if !envelope.event_type.is_system() {
                return Some(envelope);
            }
        }
    }

    /// Send an envelope to the client.
    pub async fn send_envelope(&self, envelope: &Envelope) -> bool {
        self.send_raw(codec::encode(envelope)).await
    }

    /// Send an arbitrary text frame to the client.
    pub async fn send_raw(&self, text: impl Into<String>) -> bool {
        self.to_client
            .send(TransportEvent::Frame(text.into()))
            .await
            .is_ok()
    }

    /// Close the link from the peer side.
    pub async fn close(self, code: Option<u16>, reason: &str) {
        let _ = self
            .to_client
            .send(TransportEvent::Closed {
                code,
                reason: reason.to_string(),
            })
            .await;
    }

    /// Fail the link from the peer side.
    pub async fn fail(self, error: &str) {
        let _ = self.to_client.send(TransportEvent::Error(error.to_string())).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use figlink_core::{EventSource, EventType, SessionId};
    use serde_json::json;

    #[tokio::test]
    async fn open_delivers_peer_and_frames_flow_both_ways() {
        let (transport, mut listener) = MemoryTransport::new();
        let mut link = transport.open("mem://a").await.unwrap();
        let mut peer = listener.accept().await.unwrap();
        assert_eq!(peer.address, "mem://a");

        link.outbound
            .send(OutboundFrame::Text("hello".into()))
            .await
            .unwrap();
        assert_eq!(peer.recv_frame().await, Some(OutboundFrame::Text("hello".into())));

        let env = Envelope::new(EventType::Ping, json!({}), EventSource::Server, SessionId::new());
        assert!(peer.send_envelope(&env).await);
        assert_matches!(link.inbound.recv().await, Some(TransportEvent::Frame(_)));
    }

    #[tokio::test]
    async fn scripted_failures_are_consumed_in_order() {
        let (transport, _listener) = MemoryTransport::new();
        transport.fail_next(2, "down");
        assert!(transport.open("mem://a").await.is_err());
        assert!(transport.open("mem://a").await.is_err());
        assert!(transport.open("mem://a").await.is_ok());
        assert_eq!(transport.attempts(), 3);
    }

    #[tokio::test]
    async fn dropping_peer_ends_inbound_stream() {
        let (transport, mut listener) = MemoryTransport::new();
        let mut link = transport.open("mem://a").await.unwrap();
        drop(listener.accept().await.unwrap());
        assert!(link.inbound.recv().await.is_none());
    }
}
