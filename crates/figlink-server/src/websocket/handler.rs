//! Per-socket lifecycle: writer task, heartbeat, reader loop.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::connection::{ClientConnection, Outbound};
use super::heartbeat::{HeartbeatResult, run_heartbeat};
use crate::metrics::{WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_REJECTED_TOTAL, WS_CONNECTIONS_TOTAL};
use crate::processor::{EventContext, codes};
use crate::server::AppState;

/// Close code sent when the server shuts down.
pub const GOING_AWAY: u16 = 1001;
/// Close code sent when the connection limit is reached.
pub const TRY_AGAIN_LATER: u16 = 1013;
/// Close code sent when the client stopped answering pings.
pub const HEARTBEAT_TIMEOUT: u16 = 4000;

/// How long the writer gets to flush a final close frame.
const WRITER_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum End {
    ClientGone,
    HeartbeatTimeout,
    Shutdown,
}

/// Serve one upgraded socket until either side ends it.
#[instrument(skip_all, fields(session_id))]
pub async fn handle_socket(socket: WebSocket, state: AppState) {
    let (tx, rx) = mpsc::channel(state.config.max_send_queue.max(1));
    let connection = Arc::new(ClientConnection::new(tx));
    let _ = tracing::Span::current().record("session_id", connection.id.as_str());
    let (mut ws_tx, ws_rx) = socket.split();

    if !state.connections.try_add(Arc::clone(&connection)).await {
        warn!(limit = state.config.max_connections, "connection limit reached, rejecting client");
        metrics::counter!(WS_CONNECTIONS_REJECTED_TOTAL).increment(1);
        let frame = CloseFrame {
            code: TRY_AGAIN_LATER,
            reason: "connection limit reached".into(),
        };
        let _ = ws_tx.send(Message::Close(Some(frame))).await;
        return;
    }

    info!("client connected");
    metrics::counter!(WS_CONNECTIONS_TOTAL).increment(1);
    metrics::gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);

    let mut writer = tokio::spawn(write_loop(ws_tx, rx));
    let end = read_loop(ws_rx, &connection, &state).await;

    match end {
        End::ClientGone => writer.abort(),
        End::HeartbeatTimeout | End::Shutdown => {
            let (code, reason) = if end == End::Shutdown {
                (GOING_AWAY, "server shutting down")
            } else {
                (HEARTBEAT_TIMEOUT, "heartbeat timeout")
            };
            let _ = connection.close(code, reason);
            if tokio::time::timeout(WRITER_GRACE, &mut writer).await.is_err() {
                writer.abort();
            }
        }
    }

    let _ = state.connections.remove(&connection.id).await;
    metrics::gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    info!(
        ?end,
        age = ?connection.age(),
        dropped = connection.drop_count(),
        "client disconnected"
    );
}

async fn write_loop(mut ws_tx: SplitSink<WebSocket, Message>, mut rx: mpsc::Receiver<Outbound>) {
    while let Some(outbound) = rx.recv().await {
        let (message, last) = match outbound {
            Outbound::Text(text) => (Message::Text(text.into()), false),
            Outbound::Ping => (Message::Ping(Vec::new().into()), false),
            Outbound::Close { code, reason } => (
                Message::Close(Some(CloseFrame {
                    code,
                    reason: reason.into(),
                })),
                true,
            ),
        };
        if ws_tx.send(message).await.is_err() || last {
            break;
        }
    }
}

async fn read_loop(
    mut ws_rx: futures::stream::SplitStream<WebSocket>,
    connection: &Arc<ClientConnection>,
    state: &AppState,
) -> End {
    let shutdown = state.shutdown.clone();
    let heartbeat_cancel = shutdown.child_token();
    let mut heartbeat: JoinHandle<HeartbeatResult> = tokio::spawn(run_heartbeat(
        Arc::clone(connection),
        state.config.heartbeat_interval,
        state.config.heartbeat_timeout,
        heartbeat_cancel.clone(),
    ));
    let ctx = EventContext::new(Arc::clone(connection));

    let end = loop {
        tokio::select! {
            () = shutdown.cancelled() => break End::Shutdown,
            result = &mut heartbeat => {
                break match result {
                    Ok(HeartbeatResult::TimedOut) => End::HeartbeatTimeout,
                    _ => End::Shutdown,
                };
            }
            message = ws_rx.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    connection.mark_alive();
                    let processor = Arc::clone(&state.processor);
                    let ctx = ctx.clone();
                    let text = text.to_string();
                    let _ = tokio::spawn(async move {
                        processor.process_frame(&text, &ctx).await;
                    });
                }
                Some(Ok(Message::Pong(_))) => connection.mark_alive(),
                Some(Ok(Message::Ping(_))) => connection.mark_alive(),
                Some(Ok(Message::Binary(_))) => {
                    connection.mark_alive();
                    let _ = ctx.send_error(codes::INVALID_MESSAGE, "binary frames are not supported", None);
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!(
                        code = frame.as_ref().map(|f| f.code),
                        reason = frame.as_ref().map(|f| f.reason.as_str()),
                        "client closed"
                    );
                    break End::ClientGone;
                }
                Some(Err(e)) => {
                    debug!(error = %e, "socket error");
                    break End::ClientGone;
                }
                None => break End::ClientGone,
            }
        }
    };

    heartbeat_cancel.cancel();
    heartbeat.abort();
    end
}
