//! Built-in server handlers.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use figlink_core::envelope::{
    ConnectPayload, ErrorPayload, PongPayload, UpdateNodeCompletePayload, UpdateNodeProgressPayload,
    UpdateNodeRequestPayload,
};
use figlink_core::{Envelope, EventPayload, EventType};
use serde_json::json;
use tracing::info;

use crate::processor::{EventContext, HandlerError, ServerHandler, codes};

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Answers `PING` with a correlated `PONG`.
pub struct PingHandler;

#[async_trait]
impl ServerHandler for PingHandler {
    async fn handle(&self, event: &Envelope, ctx: &EventContext) -> Result<(), HandlerError> {
        let pong = PongPayload {
            message: "Server is alive".to_string(),
            received_at: event.payload.get("time").cloned(),
            server_time: now_rfc3339(),
        };
        let _ = ctx.respond(event, EventType::Pong, pong.to_value());
        Ok(())
    }
}

/// Answers `UPDATE_NODE_REQUEST` with `UPDATE_NODE_PROGRESS`, then after
/// `delay` with `UPDATE_NODE_COMPLETE` echoing the requested properties.
pub struct UpdateNodeHandler {
    delay: Duration,
}

impl UpdateNodeHandler {
    /// Handler that simulates `delay` of work per update.
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl ServerHandler for UpdateNodeHandler {
    async fn handle(&self, event: &Envelope, ctx: &EventContext) -> Result<(), HandlerError> {
        let request = match event.payload_as::<UpdateNodeRequestPayload>() {
            Ok(request) => request,
            Err(e) => {
                let error = ErrorPayload {
                    code: codes::UPDATE_ERROR.to_string(),
                    message: format!("error updating node: {e}"),
                    details: Some(json!({ "nodeId": event.payload.get("nodeId") })),
                };
                let _ = ctx.respond(event, EventType::UpdateNodeError, error.to_value());
                return Ok(());
            }
        };

        let progress = UpdateNodeProgressPayload {
            node_id: request.node_id.clone(),
            status: "processing".to_string(),
            message: "Processing update request".to_string(),
        };
        let _ = ctx.respond(event, EventType::UpdateNodeProgress, progress.to_value());

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let complete = UpdateNodeCompletePayload {
            node_id: request.node_id,
            success: true,
            updated_properties: request.properties,
        };
        info!(node_id = %complete.node_id, "node update completed");
        let _ = ctx.respond(event, EventType::UpdateNodeComplete, complete.to_value());
        Ok(())
    }
}

/// Bookkeeping for `CONNECT`, `DISCONNECT` and unsolicited `PONG`.
pub struct SessionHandler;

#[async_trait]
impl ServerHandler for SessionHandler {
    async fn handle(&self, event: &Envelope, ctx: &EventContext) -> Result<(), HandlerError> {
        match event.event_type {
            EventType::Connect => {
                let payload: ConnectPayload = event.payload_as()?;
                info!(
                    client = %payload.client,
                    version = %payload.version,
                    peer_session = %event.metadata.session_id,
                    "client announced"
                );
                ctx.connection()
                    .bind_peer(payload, event.metadata.session_id.clone());
            }
            EventType::Disconnect => {
                let reason = event
                    .payload
                    .get("reason")
                    .and_then(|r| r.as_str())
                    .unwrap_or("unspecified");
                if let Some(peer) = ctx.connection().unbind_peer() {
                    info!(client = %peer.client, reason, "client said goodbye");
                }
            }
            _ => ctx.connection().mark_alive(),
        }
        Ok(())
    }
}
