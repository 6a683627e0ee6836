//! WebSocket transport over `tokio-tungstenite`.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, warn};

use crate::transport::{OutboundFrame, Transport, TransportError, TransportEvent, TransportLink};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Default capacity of each link channel.
const DEFAULT_LINK_BUFFER: usize = 256;

/// Client-side WebSocket transport.
#[derive(Clone, Debug)]
pub struct WsTransport {
    buffer: usize,
}

impl Default for WsTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl WsTransport {
    /// Transport with default channel capacities.
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: DEFAULT_LINK_BUFFER,
        }
    }

    /// Transport with a custom channel capacity per link direction.
    #[must_use]
    pub fn with_buffer(buffer: usize) -> Self {
        Self {
            buffer: buffer.max(1),
        }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn open(&self, address: &str) -> Result<TransportLink, TransportError> {
        if !(address.starts_with("ws://") || address.starts_with("wss://")) {
            return Err(TransportError::InvalidAddress(address.to_string()));
        }
        let (ws, _) = connect_async(address)
            .await
            .map_err(|e| TransportError::Connect {
                address: address.to_string(),
                reason: e.to_string(),
            })?;

        let (out_tx, out_rx) = mpsc::channel(self.buffer);
        let (in_tx, in_rx) = mpsc::channel(self.buffer);
        let _ = tokio::spawn(pump(ws, out_rx, in_tx));

        debug!(address, "websocket link open");
        Ok(TransportLink {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

/// Move frames between the socket and the link channels until either side ends.
async fn pump(
    ws: WsStream,
    mut outbound: mpsc::Receiver<OutboundFrame>,
    inbound: mpsc::Sender<TransportEvent>,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                match frame {
                    Some(OutboundFrame::Text(text)) => {
                        if let Err(e) = ws_tx.send(Message::Text(text.into())).await {
                            let _ = inbound.send(TransportEvent::Error(e.to_string())).await;
                            break;
                        }
                    }
                    Some(OutboundFrame::Close { code, reason }) => {
                        let frame = CloseFrame {
                            code: CloseCode::from(code),
                            reason: reason.into(),
                        };
                        let _ = ws_tx.send(Message::Close(Some(frame))).await;
                        let _ = ws_tx.close().await;
                        break;
                    }
                    // Link owner went away
                    None => {
                        let _ = ws_tx.close().await;
                        break;
                    }
                }
            }
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if inbound.send(TransportEvent::Frame(text.as_str().to_owned())).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = frame.map_or((None, String::new()), |f| {
                            (Some(u16::from(f.code)), f.reason.as_str().to_owned())
                        });
                        let _ = inbound.send(TransportEvent::Closed { code, reason }).await;
                        break;
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        warn!(len = bytes.len(), "discarding binary frame");
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        let _ = inbound.send(TransportEvent::Error(e.to_string())).await;
                        break;
                    }
                    None => {
                        let _ = inbound
                            .send(TransportEvent::Closed {
                                code: None,
                                reason: "stream ended".into(),
                            })
                            .await;
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn rejects_non_websocket_address() {
        let transport = WsTransport::new();
        let err = transport.open("http://127.0.0.1:1/ws").await.unwrap_err();
        assert_matches!(err, TransportError::InvalidAddress(_));
    }

    #[tokio::test]
    async fn unreachable_peer_is_connect_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = WsTransport::new()
            .open(&format!("ws://127.0.0.1:{port}/ws"))
            .await
            .unwrap_err();
        assert_matches!(err, TransportError::Connect { .. });
    }

    #[test]
    fn buffer_is_at_least_one() {
        assert_eq!(WsTransport::with_buffer(0).buffer, 1);
    }
}
