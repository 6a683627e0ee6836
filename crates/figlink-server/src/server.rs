//! `FiglinkServer`: axum router with `/ws`, `/health` and `/metrics`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::health::{self, HealthResponse};
use crate::processor::EventProcessor;
use crate::websocket::handler::{self, GOING_AWAY};
use crate::websocket::registry::ConnectionRegistry;

/// How long [`FiglinkServer::stop`] waits for the serve and socket tasks.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared state accessible from axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// Envelope handlers.
    pub processor: Arc<EventProcessor>,
    /// Live connections.
    pub connections: Arc<ConnectionRegistry>,
    /// Cancelled once [`FiglinkServer::stop`] begins; parent of every socket token.
    pub shutdown: CancellationToken,
    /// When the server started.
    pub start_time: Instant,
    /// Prometheus handle backing `/metrics`, when a recorder is installed.
    pub metrics: Option<PrometheusHandle>,
}

/// The figlink WebSocket server.
pub struct FiglinkServer {
    state: AppState,
}

impl FiglinkServer {
    /// Create a server around `processor`.
    pub fn new(config: ServerConfig, processor: EventProcessor) -> Self {
        let connections = Arc::new(ConnectionRegistry::new(config.max_connections));
        Self {
            state: AppState {
                config: Arc::new(config),
                processor: Arc::new(processor),
                connections,
                shutdown: CancellationToken::new(),
                start_time: Instant::now(),
                metrics: None,
            },
        }
    }

    /// Server with the built-in handlers.
    pub fn with_default_handlers(config: ServerConfig) -> Self {
        let processor = EventProcessor::with_defaults(&config);
        Self::new(config, processor)
    }

    /// Serve `/metrics` from `handle`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.state.metrics = Some(handle);
        self
    }

    /// Build the axum router with all routes.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Bind and serve in a background task.
    ///
    /// Returns the bound address (useful with port `0`) and the serve task,
    /// which finishes after [`FiglinkServer::stop`].
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind(self.state.config.bind_address()).await?;
        let addr = listener.local_addr()?;
        let router = self.router();
        let token = self.state.shutdown.clone();

        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(token.cancelled_owned())
                .await
            {
                error!(error = %e, "server error");
            }
        });
        info!(%addr, "figlink server listening");
        Ok((addr, handle))
    }

    /// Close every connection with 1001, stop accepting new ones, then wait
    /// for `handles`.
    pub async fn stop(&self, handles: Vec<JoinHandle<()>>) {
        self.stop_within(handles, SHUTDOWN_TIMEOUT).await;
    }

    async fn stop_within(&self, handles: Vec<JoinHandle<()>>, timeout: Duration) {
        let closed = self.state.connections.close_all(GOING_AWAY, "server shutting down").await;
        self.state.shutdown.cancel();
        info!(closed, task_count = handles.len(), ?timeout, "shutting down");

        if tokio::time::timeout(timeout, futures::future::join_all(handles)).await.is_err() {
            warn!(?timeout, "shutdown timed out, some tasks may still be running");
        }
    }

    /// Whether [`FiglinkServer::stop`] has begun.
    pub fn is_stopping(&self) -> bool {
        self.state.shutdown.is_cancelled()
    }

    /// Live connections.
    pub fn connections(&self) -> &Arc<ConnectionRegistry> {
        &self.state.connections
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.state.config
    }
}

/// GET /ws
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handler::handle_socket(socket, state))
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let connections = state.connections.snapshot().await;
    Json(health::health_check(
        state.start_time,
        state.shutdown.is_cancelled(),
        &connections,
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => crate::metrics::render(handle).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
