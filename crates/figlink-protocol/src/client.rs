//! Public client handle.

use std::sync::Arc;
use std::time::Duration;

use figlink_core::{CorrelationId, Envelope, EventPayload, EventType, FiglinkError, SessionId};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};

use crate::config::ClientConfig;
use crate::connection::{Command, ConnectionActor, ConnectionSnapshot, ConnectionState};
use crate::dispatcher::{EventHandler, Subscription};
use crate::transport::Transport;

/// Handle to one protocol connection.
///
/// Cheap to clone; every clone talks to the same connection actor. The actor
/// stops once the last handle is dropped, rejecting whatever is still pending.
///
/// Subscribed handlers live inside the actor, so a handler holding a
/// `FiglinkClient` keeps the actor alive for good. Handlers that answer the
/// peer should hold a [`WeakFiglinkClient`] from [`FiglinkClient::downgrade`].
#[derive(Clone)]
pub struct FiglinkClient {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<ConnectionState>,
}

impl FiglinkClient {
    /// Spawn the connection actor on the current runtime.
    ///
    /// The client starts `Disconnected`; call [`FiglinkClient::connect`].
    #[must_use]
    pub fn spawn(config: ClientConfig, transport: Arc<dyn Transport>) -> Self {
        let (commands, rx) = mpsc::channel(config.command_buffer.max(1));
        let (status_tx, status) = watch::channel(ConnectionState::Disconnected);
        let actor = ConnectionActor::new(config, transport, rx, status_tx);
        let _ = tokio::spawn(actor.run());
        Self { commands, status }
    }

    /// Handle that does not keep the actor alive.
    #[must_use]
    pub fn downgrade(&self) -> WeakFiglinkClient {
        WeakFiglinkClient {
            commands: self.commands.downgrade(),
            status: self.status.clone(),
        }
    }

    /// Open the connection.
    ///
    /// Returns the current session immediately when already open, and joins
    /// the in-flight attempt when one is running.
    pub async fn connect(&self, address: impl Into<String>) -> Result<SessionId, FiglinkError> {
        let address = address.into();
        self.call(|reply| Command::Connect { address, reply }).await?
    }

    /// Close the connection and fail every pending request with
    /// [`FiglinkError::ConnectionClosed`]. Cancels automatic reconnection.
    pub async fn disconnect(&self) -> Result<(), FiglinkError> {
        self.call(|reply| Command::Disconnect { reply }).await
    }

    /// Send a fire-and-forget envelope. Returns its correlation ID.
    pub async fn send_notification(
        &self,
        event_type: EventType,
        payload: Value,
    ) -> Result<CorrelationId, FiglinkError> {
        self.call(|reply| Command::Notify {
            event_type,
            payload,
            correlation_id: None,
            reply,
        })
        .await?
    }

    /// Send a request and wait for the envelope correlated to it.
    ///
    /// Completes with exactly one of: the response, [`FiglinkError::Timeout`],
    /// [`FiglinkError::Remote`] or [`FiglinkError::ConnectionClosed`]. Fails
    /// with [`FiglinkError::Connection`] without sending anything when the
    /// connection is not open. `timeout` defaults to the configured request
    /// timeout.
    pub async fn send_request(
        &self,
        event_type: EventType,
        payload: Value,
        timeout: Option<Duration>,
    ) -> Result<Envelope, FiglinkError> {
        let pending = self
            .call(|reply| Command::Request {
                event_type,
                payload,
                timeout,
                reply,
            })
            .await??;
        pending.await
    }

    /// [`FiglinkClient::send_request`] with a typed payload.
    pub async fn send_request_typed<P: EventPayload>(
        &self,
        payload: &P,
        timeout: Option<Duration>,
    ) -> Result<Envelope, FiglinkError> {
        self.send_request(P::EVENT_TYPE, payload.to_value(), timeout)
            .await
    }

    /// [`FiglinkClient::send_notification`] with a typed payload.
    pub async fn send_notification_typed<P: EventPayload>(
        &self,
        payload: &P,
    ) -> Result<CorrelationId, FiglinkError> {
        self.send_notification(P::EVENT_TYPE, payload.to_value())
            .await
    }

    /// Answer a request received from the peer, echoing its correlation ID.
    pub async fn reply(
        &self,
        request: &Envelope,
        event_type: EventType,
        payload: Value,
    ) -> Result<(), FiglinkError> {
        let correlation_id = Some(request.metadata.correlation_id.clone());
        self.call(|reply| Command::Notify {
            event_type,
            payload,
            correlation_id,
            reply,
        })
        .await?
        .map(|_| ())
    }

    /// Send a caller-built envelope as is.
    pub async fn send(&self, envelope: Envelope) -> Result<(), FiglinkError> {
        self.call(|reply| Command::Send { envelope, reply }).await?
    }

    /// Deliver inbound envelopes of `event_type` to `handler`.
    pub async fn subscribe(
        &self,
        event_type: EventType,
        handler: Arc<dyn EventHandler>,
    ) -> Result<Subscription, FiglinkError> {
        self.call(|reply| Command::Subscribe {
            event_type: Some(event_type),
            handler,
            reply,
        })
        .await
    }

    /// Deliver every inbound envelope to `handler`, including responses that
    /// completed a request.
    pub async fn observe(&self, handler: Arc<dyn EventHandler>) -> Result<Subscription, FiglinkError> {
        self.call(|reply| Command::Subscribe {
            event_type: None,
            handler,
            reply,
        })
        .await
    }

    /// Remove a subscription. Returns whether it was still registered.
    pub async fn unsubscribe(&self, subscription: &Subscription) -> Result<bool, FiglinkError> {
        let subscription = subscription.clone();
        self.call(|reply| Command::Unsubscribe {
            subscription,
            reply,
        })
        .await
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.status.borrow()
    }

    /// Receiver of connection state changes.
    #[must_use]
    pub fn status(&self) -> watch::Receiver<ConnectionState> {
        self.status.clone()
    }

    /// Wait until the connection reaches `state`.
    pub async fn wait_for_state(&self, state: ConnectionState) -> Result<(), FiglinkError> {
        let mut status = self.status.clone();
        status
            .wait_for(|s| *s == state)
            .await
            .map(|_| ())
            .map_err(|_| actor_stopped())
    }

    /// Bookkeeping of the connection actor.
    pub async fn snapshot(&self) -> Result<ConnectionSnapshot, FiglinkError> {
        self.call(|reply| Command::Snapshot { reply }).await
    }

    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, FiglinkError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .await
            .map_err(|_| actor_stopped())?;
        rx.await.map_err(|_| actor_stopped())
    }
}

/// Non-owning [`FiglinkClient`]; see [`FiglinkClient::downgrade`].
#[derive(Clone)]
pub struct WeakFiglinkClient {
    commands: mpsc::WeakSender<Command>,
    status: watch::Receiver<ConnectionState>,
}

impl WeakFiglinkClient {
    /// The full handle, or `None` once every `FiglinkClient` is gone.
    #[must_use]
    pub fn upgrade(&self) -> Option<FiglinkClient> {
        let commands = self.commands.upgrade()?;
        Some(FiglinkClient {
            commands,
            status: self.status.clone(),
        })
    }
}

fn actor_stopped() -> FiglinkError {
    FiglinkError::closed("connection actor stopped")
}
