//! End-to-end tests: real server, real WebSocket client.

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use figlink_core::envelope::{PingPayload, UpdateNodeRequestPayload};
use figlink_core::{Envelope, EventSource, EventType, FiglinkError, SessionId, codec};
use figlink_protocol::{
    ClientConfig, ConnectionState, FiglinkClient, HandlerError, WsTransport, handler_fn,
};
use figlink_server::{FiglinkServer, ServerConfig};
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

const TIMEOUT: Duration = Duration::from_secs(5);

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

struct TestServer {
    server: FiglinkServer,
    addr: std::net::SocketAddr,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn boot(config: ServerConfig) -> Self {
        let server = FiglinkServer::with_default_handlers(config);
        let (addr, handle) = server.listen().await.unwrap();
        Self { server, addr, handle }
    }

    async fn default() -> Self {
        Self::boot(ServerConfig {
            update_delay: Duration::from_millis(50),
            ..ServerConfig::ephemeral()
        })
        .await
    }

    fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    async fn health(&self) -> Value {
        reqwest::get(format!("http://{}/health", self.addr))
            .await
            .unwrap()
            .json()
            .await
            .unwrap()
    }

    async fn stop(self) {
        self.server.stop(vec![self.handle]).await;
    }
}

async fn client(server: &TestServer) -> FiglinkClient {
    let client = FiglinkClient::spawn(ClientConfig::default(), Arc::new(WsTransport::new()));
    let _ = timeout(TIMEOUT, client.connect(server.ws_url()))
        .await
        .unwrap()
        .unwrap();
    client
}

async fn raw_socket(server: &TestServer) -> WsStream {
    let (ws, _) = connect_async(server.ws_url()).await.unwrap();
    ws
}

async fn next_envelope(ws: &mut WsStream) -> Envelope {
    loop {
        match timeout(TIMEOUT, ws.next()).await.unwrap() {
            Some(Ok(Message::Text(text))) => return codec::decode(text.as_str()).unwrap(),
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
            other => panic!("expected text frame, got {other:?}"),
        }
    }
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while !check().await {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn ping_request_gets_pong() {
    let server = TestServer::default().await;
    let client = client(&server).await;

    let ping = PingPayload {
        time: Some("2026-10-19T12:00:00Z".into()),
    };
    let pong = client.send_request_typed(&ping, None).await.unwrap();
    assert_eq!(pong.event_type, EventType::Pong);
    assert_eq!(pong.metadata.source, EventSource::Server);
    assert_eq!(pong.payload["message"], "Server is alive");
    assert_eq!(pong.payload["received_at"], "2026-10-19T12:00:00Z");

    client.disconnect().await.unwrap();
    server.stop().await;
}

#[tokio::test]
async fn update_node_reports_progress_then_completes() {
    let server = TestServer::default().await;
    let client = client(&server).await;

    let (tx, mut progress_rx) = mpsc::unbounded_channel();
    let _ = client
        .subscribe(
            EventType::UpdateNodeProgress,
            handler_fn(move |env: Envelope| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(env);
                    Ok::<(), HandlerError>(())
                }
            }),
        )
        .await
        .unwrap();

    let request = UpdateNodeRequestPayload {
        node_id: "12:34".into(),
        properties: serde_json::Map::from_iter([("name".to_string(), json!("Header"))]),
    };
    let done = client.send_request_typed(&request, None).await.unwrap();
    assert_eq!(done.event_type, EventType::UpdateNodeComplete);
    assert_eq!(done.payload["success"], true);
    assert_eq!(done.payload["updatedProperties"]["name"], "Header");

    let progress = timeout(TIMEOUT, progress_rx.recv()).await.unwrap().unwrap();
    assert_eq!(progress.correlation_id(), done.correlation_id());
    assert_eq!(progress.payload["nodeId"], "12:34");

    server.stop().await;
}

#[tokio::test]
async fn invalid_update_payload_is_remote_error() {
    let server = TestServer::default().await;
    let client = client(&server).await;

    let err = client
        .send_request(EventType::UpdateNodeRequest, json!({"nodeId": 5}), None)
        .await
        .unwrap_err();
    assert_matches!(err, FiglinkError::Remote { ref code, .. } if code == "update_error");

    server.stop().await;
}

#[tokio::test]
async fn unknown_type_is_remote_error() {
    let server = TestServer::default().await;
    let client = client(&server).await;

    let err = client
        .send_request(EventType::GenerateVariants, json!({}), Some(TIMEOUT))
        .await
        .unwrap_err();
    assert_matches!(err, FiglinkError::Remote { ref code, .. } if code == "unknown_event_type");
    assert_eq!(client.state(), ConnectionState::Open);

    server.stop().await;
}

#[tokio::test]
async fn malformed_frames_get_errors_and_connection_survives() {
    let server = TestServer::default().await;
    let mut ws = raw_socket(&server).await;

    ws.send(Message::Text("{broken".into())).await.unwrap();
    let error = next_envelope(&mut ws).await;
    assert_eq!(error.event_type, EventType::Error);
    assert_eq!(error.payload["code"], "invalid_json");

    ws.send(Message::Text(r#"{"type": "PING"}"#.into())).await.unwrap();
    let error = next_envelope(&mut ws).await;
    assert_eq!(error.payload["code"], "invalid_message");

    let ping = Envelope::new(EventType::Ping, json!({}), EventSource::Client, SessionId::new());
    ws.send(Message::Text(codec::encode(&ping).into())).await.unwrap();
    let pong = next_envelope(&mut ws).await;
    assert_eq!(pong.event_type, EventType::Pong);
    assert_eq!(pong.correlation_id(), ping.correlation_id());

    server.stop().await;
}

#[tokio::test]
async fn health_tracks_connections_and_sessions() {
    let server = TestServer::default().await;
    let body = server.health().await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["connections"], 0);

    let client = client(&server).await;
    eventually(|| async { server.health().await["active_sessions"] == 1 }).await;
    let body = server.health().await;
    assert_eq!(body["connections"], 1);
    assert_eq!(body["peers"][0]["client"], "figlink");
    assert!(body["peers"][0]["client_session_id"].is_string());

    client.disconnect().await.unwrap();
    eventually(|| async { server.health().await["connections"] == 0 }).await;

    server.stop().await;
}

#[tokio::test]
async fn connection_limit_rejects_extra_clients() {
    let server = TestServer::boot(ServerConfig {
        max_connections: 1,
        ..ServerConfig::ephemeral()
    })
    .await;
    let _first = raw_socket(&server).await;
    eventually(|| async { server.health().await["connections"] == 1 }).await;

    let mut second = raw_socket(&server).await;
    match timeout(TIMEOUT, second.next()).await.unwrap() {
        Some(Ok(Message::Close(Some(frame)))) => assert_eq!(u16::from(frame.code), 1013),
        other => panic!("expected close frame, got {other:?}"),
    }

    server.stop().await;
}

#[tokio::test]
async fn shutdown_closes_clients_without_reconnect() {
    let server = TestServer::default().await;
    let client = client(&server).await;

    server.stop().await;
    timeout(TIMEOUT, client.wait_for_state(ConnectionState::Disconnected))
        .await
        .unwrap()
        .unwrap();
    let snapshot = client.snapshot().await.unwrap();
    assert!(!snapshot.reconnect_scheduled);
}

#[tokio::test]
async fn silent_client_is_dropped_by_heartbeat() {
    let server = TestServer::boot(ServerConfig {
        heartbeat_interval: Duration::from_millis(50),
        heartbeat_timeout: Duration::from_millis(150),
        ..ServerConfig::ephemeral()
    })
    .await;

    // Never polled, so pings are never answered.
    let _silent = raw_socket(&server).await;
    eventually(|| async { server.health().await["connections"] == 1 }).await;
    eventually(|| async { server.health().await["connections"] == 0 }).await;

    server.stop().await;
}
