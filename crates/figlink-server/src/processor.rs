//! Inbound envelope processing.
//!
//! Every decoded envelope goes to the handlers registered for its type, in
//! registration order. A failing handler is answered with a correlated
//! `ERROR` (`handler_error`) and the remaining handlers still run. Types with
//! no handler get `unknown_event_type`; frames that do not decode get
//! `invalid_json` or `invalid_message` under a fresh correlation ID.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use figlink_core::envelope::ErrorPayload;
use figlink_core::{Envelope, EventPayload, EventSource, EventType, ProtocolError, codec};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::config::ServerConfig;
use crate::handlers;
use crate::metrics::{EVENTS_ERRORS_TOTAL, EVENTS_RECEIVED_TOTAL};
use crate::websocket::connection::ClientConnection;

/// Error returned by a [`ServerHandler`].
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Error codes the server puts in `ERROR` payloads.
pub mod codes {
    /// The frame is not JSON.
    pub const INVALID_JSON: &str = "invalid_json";
    /// The frame is JSON but not an envelope, or too large.
    pub const INVALID_MESSAGE: &str = "invalid_message";
    /// No handler is registered for the envelope's type.
    pub const UNKNOWN_EVENT_TYPE: &str = "unknown_event_type";
    /// A handler returned an error.
    pub const HANDLER_ERROR: &str = "handler_error";
    /// The node-update handler rejected the request.
    pub const UPDATE_ERROR: &str = "update_error";
}

/// The connection an envelope arrived on, as seen by handlers.
#[derive(Clone)]
pub struct EventContext {
    connection: Arc<ClientConnection>,
}

impl EventContext {
    /// Context for envelopes arriving on `connection`.
    pub fn new(connection: Arc<ClientConnection>) -> Self {
        Self { connection }
    }

    /// The originating connection.
    pub fn connection(&self) -> &ClientConnection {
        &self.connection
    }

    /// Send an envelope answering `request` (same correlation and session).
    pub fn respond(&self, request: &Envelope, event_type: EventType, payload: Value) -> bool {
        let response = Envelope::response_to(request, event_type, payload, EventSource::Server);
        self.emit(&response)
    }

    /// Send an envelope to the originating connection.
    pub fn emit(&self, envelope: &Envelope) -> bool {
        debug!(
            event_type = %envelope.event_type,
            correlation_id = %envelope.metadata.correlation_id,
            "sending event"
        );
        self.connection.send_envelope(envelope)
    }

    /// Send an `ERROR` envelope, correlated to `request` when given.
    pub fn send_error(&self, code: &str, message: impl Into<String>, request: Option<&Envelope>) -> bool {
        let payload = ErrorPayload {
            code: code.to_string(),
            message: message.into(),
            details: None,
        };
        let envelope = match request {
            Some(request) => Envelope::response_to(request, EventType::Error, payload.to_value(), EventSource::Server),
            None => Envelope::new(
                EventType::Error,
                payload.to_value(),
                EventSource::Server,
                self.connection.id.clone(),
            ),
        };
        metrics::counter!(EVENTS_ERRORS_TOTAL, "code" => code.to_string()).increment(1);
        warn!(code, message = %payload.message, "sending error event");
        self.emit(&envelope)
    }
}

/// Async handler for one or more event types.
#[async_trait]
pub trait ServerHandler: Send + Sync + 'static {
    /// Handle one inbound envelope.
    async fn handle(&self, event: &Envelope, ctx: &EventContext) -> Result<(), HandlerError>;
}

/// Routes decoded envelopes to per-type handler lists.
pub struct EventProcessor {
    handlers: HashMap<EventType, Vec<Arc<dyn ServerHandler>>>,
    max_frame_bytes: usize,
}

impl EventProcessor {
    /// Processor with no handlers.
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            handlers: HashMap::new(),
            max_frame_bytes,
        }
    }

    /// Processor with the built-in handlers registered.
    pub fn with_defaults(config: &ServerConfig) -> Self {
        let mut processor = Self::new(config.max_frame_bytes);
        let session: Arc<dyn ServerHandler> = Arc::new(handlers::SessionHandler);
        processor.register(EventType::Ping, Arc::new(handlers::PingHandler));
        processor.register(
            EventType::UpdateNodeRequest,
            Arc::new(handlers::UpdateNodeHandler::new(config.update_delay)),
        );
        processor.register(EventType::Connect, Arc::clone(&session));
        processor.register(EventType::Disconnect, Arc::clone(&session));
        processor.register(EventType::Pong, session);
        processor
    }

    /// Append a handler for `event_type`.
    pub fn register(&mut self, event_type: EventType, handler: Arc<dyn ServerHandler>) {
        info!(%event_type, "registered handler");
        self.handlers.entry(event_type).or_default().push(handler);
    }

    /// Whether any handler is registered for `event_type`.
    pub fn has_handlers(&self, event_type: &EventType) -> bool {
        self.handlers.get(event_type).is_some_and(|h| !h.is_empty())
    }

    /// Decode a text frame and process it.
    #[instrument(skip_all, fields(session_id = %ctx.connection().id))]
    pub async fn process_frame(&self, frame: &str, ctx: &EventContext) {
        match codec::decode_with_limit(frame, self.max_frame_bytes) {
            Ok(event) => self.process_event(&event, ctx).await,
            Err(e) => {
                let code = match e {
                    ProtocolError::InvalidJson { .. } => codes::INVALID_JSON,
                    _ => codes::INVALID_MESSAGE,
                };
                let _ = ctx.send_error(code, e.to_string(), None);
            }
        }
    }

    /// Run every handler registered for the envelope's type.
    pub async fn process_event(&self, event: &Envelope, ctx: &EventContext) {
        info!(
            event_type = %event.event_type,
            source = ?event.metadata.source,
            correlation_id = %event.metadata.correlation_id,
            peer_session = %event.metadata.session_id,
            "received event"
        );
        metrics::counter!(EVENTS_RECEIVED_TOTAL, "type" => event.event_type.to_string()).increment(1);

        let Some(handlers) = self.handlers.get(&event.event_type).filter(|h| !h.is_empty()) else {
            let _ = ctx.send_error(
                codes::UNKNOWN_EVENT_TYPE,
                format!("no handlers registered for event type: {}", event.event_type),
                Some(event),
            );
            return;
        };

        for handler in handlers {
            if let Err(e) = handler.handle(event, ctx).await {
                let _ = ctx.send_error(
                    codes::HANDLER_ERROR,
                    format!("error processing event {}: {e}", event.event_type),
                    Some(event),
                );
            }
        }
    }
}
