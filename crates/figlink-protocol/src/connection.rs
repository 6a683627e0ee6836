//! Connection manager.
//!
//! One actor task per client owns everything mutable: connection state, the
//! transport link, the correlation registry, the subscriber map, the keepalive
//! monitor, the reconnect attempt counter and the session ID. Client handles
//! talk to it over an mpsc channel and watch its state through a `watch`
//! channel; nothing is shared.
//!
//! ```text
//! Disconnected --connect--> Connecting --open ok--> Open --disconnect--> Closing --> Disconnected
//!      ^                        |                     |
//!      |                   open failed           unexpected loss
//!      +------------------------+---------------------+--> (reconnect after backoff)
//! ```
//!
//! Opens run in their own task and report back tagged with a generation
//! number; a result whose generation is no longer current is closed and
//! discarded, so attempts never overlap.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use figlink_core::envelope::{ConnectPayload, DisconnectPayload, PingPayload, PongPayload};
use figlink_core::{
    CorrelationId, Envelope, EventPayload, EventType, FiglinkError, SessionId, codec,
};
use serde_json::Value;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, instrument, trace, warn};

use crate::config::ClientConfig;
use crate::dispatcher::{Dispatcher, EventHandler, Subscription};
use crate::keepalive::{KeepaliveMonitor, KeepaliveTick};
use crate::registry::{PendingRequests, PendingResponse, Routed, deadline_after};
use crate::transport::{
    KEEPALIVE_TIMEOUT_CLOSE, NORMAL_CLOSE, OutboundFrame, Transport, TransportEvent,
    TransportLink,
};

/// Lifecycle state of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No link and no open in flight.
    Disconnected,
    /// A transport open is in flight.
    Connecting,
    /// The link is up; envelopes can be sent.
    Open,
    /// A requested disconnect is being carried out.
    Closing,
}

impl ConnectionState {
    /// Lowercase name for logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of the actor's bookkeeping.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionSnapshot {
    /// Current state.
    pub state: ConnectionState,
    /// Session of the open connection, if any.
    pub session_id: Option<SessionId>,
    /// Address of the last manual connect.
    pub address: Option<String>,
    /// Requests waiting for a response.
    pub pending_requests: usize,
    /// Live subscriptions (typed and observers).
    pub subscriptions: usize,
    /// Automatic attempts made since the last successful open.
    pub reconnect_attempt: u32,
    /// Whether an automatic attempt is scheduled.
    pub reconnect_scheduled: bool,
}

pub(crate) type Reply<T> = oneshot::Sender<Result<T, FiglinkError>>;

pub(crate) enum Command {
    Connect {
        address: String,
        reply: Reply<SessionId>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    Notify {
        event_type: EventType,
        payload: Value,
        correlation_id: Option<CorrelationId>,
        reply: Reply<CorrelationId>,
    },
    Request {
        event_type: EventType,
        payload: Value,
        timeout: Option<Duration>,
        reply: Reply<PendingResponse>,
    },
    Send {
        envelope: Envelope,
        reply: Reply<()>,
    },
    Subscribe {
        event_type: Option<EventType>,
        handler: Arc<dyn EventHandler>,
        reply: oneshot::Sender<Subscription>,
    },
    Unsubscribe {
        subscription: Subscription,
        reply: oneshot::Sender<bool>,
    },
    Snapshot {
        reply: oneshot::Sender<ConnectionSnapshot>,
    },
}

struct OpenOutcome {
    generation: u64,
    result: Result<TransportLink, FiglinkError>,
}

struct Opening {
    generation: u64,
    automatic: bool,
    waiters: Vec<Reply<SessionId>>,
}

enum Wake {
    Command(Option<Command>),
    Transport(Option<TransportEvent>),
    Opened(OpenOutcome),
    RequestDeadline,
    Keepalive(KeepaliveTick),
    Reconnect,
}

pub(crate) struct ConnectionActor {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    commands: mpsc::Receiver<Command>,
    status: watch::Sender<ConnectionState>,
    state: ConnectionState,
    address: Option<String>,
    link: Option<TransportLink>,
    session_id: Option<SessionId>,
    generation: u64,
    opening: Option<Opening>,
    open_tx: mpsc::Sender<OpenOutcome>,
    open_rx: mpsc::Receiver<OpenOutcome>,
    registry: PendingRequests,
    dispatcher: Dispatcher,
    keepalive: KeepaliveMonitor,
    reconnect_attempt: u32,
    reconnect_at: Option<Instant>,
}

impl ConnectionActor {
    pub(crate) fn new(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
        commands: mpsc::Receiver<Command>,
        status: watch::Sender<ConnectionState>,
    ) -> Self {
        let (open_tx, open_rx) = mpsc::channel(4);
        let keepalive = KeepaliveMonitor::new(config.keepalive_interval, config.keepalive_max_missed);
        Self {
            config,
            transport,
            commands,
            status,
            state: ConnectionState::Disconnected,
            address: None,
            link: None,
            session_id: None,
            generation: 0,
            opening: None,
            open_tx,
            open_rx,
            registry: PendingRequests::new(),
            dispatcher: Dispatcher::spawn(),
            keepalive,
            reconnect_attempt: 0,
            reconnect_at: None,
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            let deadline = self.registry.next_deadline();
            let reconnect_at = self.reconnect_at;

            let wake = tokio::select! {
                cmd = self.commands.recv() => Wake::Command(cmd),
                event = next_event(self.link.as_mut()) => Wake::Transport(event),
                Some(outcome) = self.open_rx.recv() => Wake::Opened(outcome),
                () = sleep_until(deadline) => Wake::RequestDeadline,
                tick = self.keepalive.tick() => Wake::Keepalive(tick),
                () = sleep_until(reconnect_at) => Wake::Reconnect,
            };

            match wake {
                Wake::Command(None) => {
                    self.shutdown();
                    break;
                }
                Wake::Command(Some(cmd)) => self.handle_command(cmd),
                Wake::Transport(event) => self.handle_transport(event),
                Wake::Opened(outcome) => self.handle_opened(outcome),
                Wake::RequestDeadline => {
                    let expired = self.registry.expire(Instant::now());
                    trace!(expired, "request deadlines processed");
                }
                Wake::Keepalive(tick) => self.handle_keepalive(tick),
                Wake::Reconnect => self.handle_reconnect_timer(),
            }
        }
    }

    // ── Commands ─────────────────────────────────────────────────────────

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect { address, reply } => self.connect(address, reply),
            Command::Disconnect { reply } => {
                self.disconnect("disconnected by client");
                let _ = reply.send(());
            }
            Command::Notify {
                event_type,
                payload,
                correlation_id,
                reply,
            } => {
                let result = self.notify(event_type, payload, correlation_id);
                let _ = reply.send(result);
            }
            Command::Request {
                event_type,
                payload,
                timeout,
                reply,
            } => {
                let result = self.request(event_type, payload, timeout);
                let _ = reply.send(result);
            }
            Command::Send { envelope, reply } => {
                let result = self.ensure_open().and_then(|()| self.write(&envelope));
                let _ = reply.send(result);
            }
            Command::Subscribe {
                event_type,
                handler,
                reply,
            } => {
                let subscription = match event_type {
                    Some(event_type) => self.dispatcher.register(event_type, handler),
                    None => self.dispatcher.register_observer(handler),
                };
                let _ = reply.send(subscription);
            }
            Command::Unsubscribe {
                subscription,
                reply,
            } => {
                let _ = reply.send(self.dispatcher.unregister(&subscription));
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    #[instrument(skip(self, reply), fields(state = %self.state))]
    fn connect(&mut self, address: String, reply: Reply<SessionId>) {
        match self.state {
            ConnectionState::Open => {
                let result = self
                    .session_id
                    .clone()
                    .ok_or_else(|| FiglinkError::connection("open without session"));
                let _ = reply.send(result);
            }
            ConnectionState::Connecting => {
                if let Some(opening) = self.opening.as_mut() {
                    debug!(generation = opening.generation, "joining in-flight connect");
                    opening.waiters.push(reply);
                } else {
                    let _ = reply.send(Err(FiglinkError::connection("no connect in flight")));
                }
            }
            ConnectionState::Disconnected | ConnectionState::Closing => {
                self.reconnect_at = None;
                self.reconnect_attempt = 0;
                self.address = Some(address);
                self.begin_open(false, Some(reply));
            }
        }
    }

    #[instrument(skip(self), fields(state = %self.state))]
    fn disconnect(&mut self, reason: &str) {
        self.reconnect_at = None;
        self.reconnect_attempt = 0;
        if let Some(opening) = self.opening.take() {
            debug!(generation = opening.generation, "abandoning in-flight connect");
            for waiter in opening.waiters {
                let _ = waiter.send(Err(FiglinkError::connection("connect abandoned by disconnect")));
            }
        }

        if self.state == ConnectionState::Open {
            self.set_state(ConnectionState::Closing);
            let goodbye = self.envelope(
                EventType::Disconnect,
                DisconnectPayload {
                    reason: reason.to_string(),
                }
                .to_value(),
                None,
            );
            if let Err(e) = self.write(&goodbye) {
                debug!(error = %e, "DISCONNECT notification not sent");
            }
            self.close_link(NORMAL_CLOSE, reason);
        }

        self.teardown();
        let rejected = self.registry.reject_all(&FiglinkError::closed(reason));
        self.set_state(ConnectionState::Disconnected);
        info!(rejected, "disconnected");
    }

    fn notify(
        &mut self,
        event_type: EventType,
        payload: Value,
        correlation_id: Option<CorrelationId>,
    ) -> Result<CorrelationId, FiglinkError> {
        self.ensure_open()?;
        let envelope = self.envelope(event_type, payload, correlation_id);
        self.write(&envelope)?;
        Ok(envelope.metadata.correlation_id)
    }

    fn request(
        &mut self,
        event_type: EventType,
        payload: Value,
        timeout: Option<Duration>,
    ) -> Result<PendingResponse, FiglinkError> {
        self.ensure_open()?;
        let correlation_id = CorrelationId::new();
        let envelope = self.envelope(event_type.clone(), payload, Some(correlation_id.clone()));
        self.write(&envelope)?;
        let timeout = timeout.unwrap_or(self.config.request_timeout);
        debug!(%correlation_id, %event_type, timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX), "request sent");
        Ok(self
            .registry
            .register(correlation_id, event_type, timeout, Instant::now()))
    }

    // ── Opening ──────────────────────────────────────────────────────────

    fn begin_open(&mut self, automatic: bool, waiter: Option<Reply<SessionId>>) {
        let Some(address) = self.address.clone() else {
            if let Some(waiter) = waiter {
                let _ = waiter.send(Err(FiglinkError::connection("no address to connect to")));
            }
            return;
        };

        self.generation += 1;
        let generation = self.generation;
        self.opening = Some(Opening {
            generation,
            automatic,
            waiters: waiter.into_iter().collect(),
        });
        self.set_state(ConnectionState::Connecting);
        debug!(generation, address = %address, automatic, "opening transport");

        let transport = Arc::clone(&self.transport);
        let timeout = self.config.connect_timeout;
        let results = self.open_tx.clone();
        let _ = tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, transport.open(&address)).await {
                Ok(Ok(link)) => Ok(link),
                Ok(Err(e)) => Err(FiglinkError::connection(e.to_string())),
                Err(_) => Err(FiglinkError::connection(format!(
                    "connect to {address} timed out after {}ms",
                    timeout.as_millis()
                ))),
            };
            let _ = results.send(OpenOutcome { generation, result }).await;
        });
    }

    fn handle_opened(&mut self, outcome: OpenOutcome) {
        let current = self
            .opening
            .as_ref()
            .is_some_and(|o| o.generation == outcome.generation);
        if !current {
            debug!(generation = outcome.generation, "discarding stale open result");
            if let Ok(link) = outcome.result {
                let _ = link.outbound.try_send(OutboundFrame::Close {
                    code: NORMAL_CLOSE,
                    reason: "superseded".into(),
                });
            }
            return;
        }
        let Some(opening) = self.opening.take() else {
            return;
        };

        match outcome.result {
            Ok(link) => {
                let session_id = SessionId::new();
                self.link = Some(link);
                self.session_id = Some(session_id.clone());
                self.reconnect_attempt = 0;
                self.set_state(ConnectionState::Open);
                self.keepalive.start();
                info!(
                    %session_id,
                    address = self.address.as_deref().unwrap_or_default(),
                    automatic = opening.automatic,
                    "connection open"
                );
                self.announce();
                for waiter in opening.waiters {
                    let _ = waiter.send(Ok(session_id.clone()));
                }
            }
            Err(error) => {
                warn!(error = %error, automatic = opening.automatic, "connection attempt failed");
                self.set_state(ConnectionState::Disconnected);
                for waiter in opening.waiters {
                    let _ = waiter.send(Err(error.clone()));
                }
                if opening.automatic {
                    self.schedule_reconnect();
                }
            }
        }
    }

    fn announce(&mut self) {
        let payload = ConnectPayload {
            client: self.config.client_name.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        };
        let hello = self.envelope(EventType::Connect, payload.to_value(), None);
        if let Err(e) = self.write(&hello) {
            warn!(error = %e, "CONNECT announcement not sent");
        }
    }

    // ── Reconnection ─────────────────────────────────────────────────────

    fn schedule_reconnect(&mut self) {
        if self.address.is_none() {
            return;
        }
        let policy = &self.config.reconnect;
        let attempt = self.reconnect_attempt + 1;
        let delay = if policy.jitter_factor > 0.0 {
            policy.delay_with_random(attempt, rand::random::<f64>())
        } else {
            policy.delay(attempt)
        };
        match delay {
            Some(delay) => {
                self.reconnect_attempt = attempt;
                self.reconnect_at = Some(deadline_after(Instant::now(), delay));
                info!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "reconnect scheduled"
                );
            }
            None if !policy.enabled => debug!("automatic reconnect disabled"),
            None => warn!(
                attempts = self.reconnect_attempt,
                "reconnect attempts exhausted, waiting for manual connect"
            ),
        }
    }

    fn handle_reconnect_timer(&mut self) {
        self.reconnect_at = None;
        if self.state != ConnectionState::Disconnected {
            return;
        }
        info!(attempt = self.reconnect_attempt, "reconnecting");
        self.begin_open(true, None);
    }

    // ── Inbound ──────────────────────────────────────────────────────────

    fn handle_transport(&mut self, event: Option<TransportEvent>) {
        match event {
            Some(TransportEvent::Frame(text)) => self.handle_frame(&text),
            Some(event @ TransportEvent::Closed { .. }) if event.is_intentional_close() => {
                info!(?event, "connection closed by peer");
                self.lose_connection("closed by peer", false);
            }
            Some(TransportEvent::Closed { code, reason }) => {
                let reason = match code {
                    Some(code) => format!("closed by peer with code {code}: {reason}"),
                    None => format!("closed without close frame: {reason}"),
                };
                self.lose_connection(&reason, true);
            }
            Some(TransportEvent::Error(e)) => {
                self.lose_connection(&format!("transport error: {e}"), true);
            }
            None => self.lose_connection("transport stream ended", true),
        }
    }

    fn handle_frame(&mut self, text: &str) {
        let envelope = match codec::decode_with_limit(text, self.config.max_frame_bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "discarding undecodable frame");
                return;
            }
        };
        trace!(
            event_type = %envelope.event_type,
            correlation_id = %envelope.metadata.correlation_id,
            "frame received"
        );

        if envelope.event_type == EventType::Pong && self.keepalive.on_pong(envelope.correlation_id()) {
            trace!("keepalive PONG");
            return;
        }
        if envelope.event_type == EventType::Ping && self.config.answer_pings {
            self.answer_ping(&envelope);
        }

        let observers_only = match self.registry.route(&envelope) {
            Routed::Resolved | Routed::Rejected => true,
            Routed::Progress | Routed::NotPending => false,
        };
        let _ = self.dispatcher.dispatch(envelope, observers_only);
    }

    fn answer_ping(&mut self, ping: &Envelope) {
        let payload = PongPayload {
            message: "alive".to_string(),
            received_at: ping.payload.get("time").cloned(),
            server_time: now_rfc3339(),
        };
        let pong = self.envelope(
            EventType::Pong,
            payload.to_value(),
            Some(ping.metadata.correlation_id.clone()),
        );
        if let Err(e) = self.write(&pong) {
            debug!(error = %e, "PONG not sent");
        }
    }

    // ── Keepalive ────────────────────────────────────────────────────────

    fn handle_keepalive(&mut self, tick: KeepaliveTick) {
        match tick {
            KeepaliveTick::Ping(correlation_id) => {
                let payload = PingPayload {
                    time: Some(now_rfc3339()),
                };
                let ping = self.envelope(EventType::Ping, payload.to_value(), Some(correlation_id));
                if let Err(e) = self.write(&ping) {
                    debug!(error = %e, "keepalive PING not sent");
                }
            }
            KeepaliveTick::Dead { missed } => {
                warn!(missed, "keepalive declared connection dead");
                self.close_link(KEEPALIVE_TIMEOUT_CLOSE, "keepalive timeout");
                self.lose_connection(&format!("keepalive timeout after {missed} missed PONGs"), true);
            }
        }
    }

    // ── Teardown ─────────────────────────────────────────────────────────

    fn lose_connection(&mut self, reason: &str, reconnect: bool) {
        if self.link.is_none() {
            return;
        }
        warn!(reason, reconnect, "connection lost");
        self.teardown();
        let rejected = self.registry.reject_all(&FiglinkError::closed(reason));
        if rejected > 0 {
            info!(rejected, "pending requests rejected");
        }
        self.set_state(ConnectionState::Disconnected);
        if reconnect {
            self.schedule_reconnect();
        }
    }

    fn teardown(&mut self) {
        self.link = None;
        self.session_id = None;
        self.keepalive.stop();
    }

    fn shutdown(&mut self) {
        info!("all client handles dropped, shutting down connection actor");
        self.disconnect("client dropped");
    }

    // ── Helpers ──────────────────────────────────────────────────────────

    fn ensure_open(&self) -> Result<(), FiglinkError> {
        if self.state == ConnectionState::Open && self.link.is_some() {
            Ok(())
        } else {
            Err(FiglinkError::connection(format!("not connected (state: {})", self.state)))
        }
    }

    fn envelope(
        &self,
        event_type: EventType,
        payload: Value,
        correlation_id: Option<CorrelationId>,
    ) -> Envelope {
        Envelope::with_correlation(
            event_type,
            payload,
            self.config.source,
            self.session_id.clone().unwrap_or_default(),
            correlation_id.unwrap_or_default(),
        )
    }

    fn write(&self, envelope: &Envelope) -> Result<(), FiglinkError> {
        let Some(link) = self.link.as_ref() else {
            return Err(FiglinkError::connection("no transport link"));
        };
        match link.outbound.try_send(OutboundFrame::Text(codec::encode(envelope))) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(FiglinkError::connection("outbound queue full")),
            Err(TrySendError::Closed(_)) => Err(FiglinkError::connection("transport link closed")),
        }
    }

    fn close_link(&self, code: u16, reason: &str) {
        if let Some(link) = self.link.as_ref() {
            let _ = link.outbound.try_send(OutboundFrame::Close {
                code,
                reason: reason.to_string(),
            });
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!(from = %self.state, to = %state, "connection state");
            self.state = state;
            let _ = self.status.send_replace(state);
        }
    }

    fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            state: self.state,
            session_id: self.session_id.clone(),
            address: self.address.clone(),
            pending_requests: self.registry.len(),
            subscriptions: self.dispatcher.len(),
            reconnect_attempt: self.reconnect_attempt,
            reconnect_scheduled: self.reconnect_at.is_some(),
        }
    }
}

async fn next_event(link: Option<&mut TransportLink>) -> Option<TransportEvent> {
    match link {
        Some(link) => link.inbound.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_display() {
        assert_eq!(ConnectionState::Disconnected.to_string(), "disconnected");
        assert_eq!(ConnectionState::Connecting.to_string(), "connecting");
        assert_eq!(ConnectionState::Open.to_string(), "open");
        assert_eq!(ConnectionState::Closing.to_string(), "closing");
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_until_none_never_fires() {
        let fired = tokio::time::timeout(Duration::from_secs(3600), sleep_until(None)).await;
        assert!(fired.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_until_some_fires_at_deadline() {
        let start = Instant::now();
        sleep_until(Some(start + Duration::from_millis(1500))).await;
        assert_eq!(start.elapsed(), Duration::from_millis(1500));
    }
}
