//! Correlation registry: requests waiting for their response.
//!
//! Owned by the connection actor, so no locking. Every entry completes exactly
//! once, through whichever of [`PendingRequests::resolve`],
//! [`PendingRequests::reject`], [`PendingRequests::expire`] or
//! [`PendingRequests::reject_all`] reaches it first; the entry is removed in
//! the same step, which makes every later completion a no-op.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use figlink_core::envelope::ErrorPayload;
use figlink_core::{CorrelationId, Envelope, EventType, FiglinkError};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

type Completion = oneshot::Sender<Result<Envelope, FiglinkError>>;

/// Longest wait the actor schedules; longer timeouts mean "effectively never".
pub const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `now + after`, clamped to [`FAR_FUTURE`] so huge durations never overflow.
#[must_use]
pub fn deadline_after(now: Instant, after: Duration) -> Instant {
    now.checked_add(after.min(FAR_FUTURE)).unwrap_or(now)
}

struct Pending {
    tx: Completion,
    deadline: Instant,
    timeout: Duration,
    event_type: EventType,
}

/// What [`PendingRequests::route`] did with a correlated inbound envelope.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Routed {
    /// No request is waiting on the correlation ID.
    NotPending,
    /// Progress update for a waiting request; the request stays pending.
    Progress,
    /// The request completed with the envelope.
    Resolved,
    /// The request failed with a remote error.
    Rejected,
}

/// The caller's side of a pending request.
///
/// Resolves to the matching response or to the error that ended the request.
/// Dropping it is allowed; the completion is then discarded.
#[derive(Debug)]
pub struct PendingResponse {
    correlation_id: CorrelationId,
    rx: oneshot::Receiver<Result<Envelope, FiglinkError>>,
}

impl PendingResponse {
    /// Correlation ID of the request.
    #[must_use]
    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }
}

impl Future for PendingResponse {
    type Output = Result<Envelope, FiglinkError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|result| {
            result.unwrap_or_else(|_| Err(FiglinkError::closed("connection actor stopped")))
        })
    }
}

/// Map of correlation ID to waiting request, with a deadline index.
#[derive(Default)]
pub struct PendingRequests {
    entries: HashMap<CorrelationId, Pending>,
    deadlines: BTreeSet<(Instant, CorrelationId)>,
}

impl PendingRequests {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of waiting requests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no request is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether a request with this correlation ID is waiting.
    #[must_use]
    pub fn contains(&self, correlation_id: &CorrelationId) -> bool {
        self.entries.contains_key(correlation_id)
    }

    /// Register a request that expires `timeout` after `now`.
    ///
    /// Correlation IDs are fresh per request; registering one that is still
    /// pending fails the older request.
    pub fn register(
        &mut self,
        correlation_id: CorrelationId,
        event_type: EventType,
        timeout: Duration,
        now: Instant,
    ) -> PendingResponse {
        let (tx, rx) = oneshot::channel();
        let deadline = deadline_after(now, timeout);
        if let Some(old) = self.take(&correlation_id) {
            warn!(%correlation_id, "correlation id reused while pending");
            let _ = old
                .tx
                .send(Err(FiglinkError::connection("correlation id reused")));
        }
        let _ = self.deadlines.insert((deadline, correlation_id.clone()));
        let _ = self.entries.insert(
            correlation_id.clone(),
            Pending {
                tx,
                deadline,
                timeout,
                event_type,
            },
        );
        PendingResponse { correlation_id, rx }
    }

    /// Complete a request with its response. No-op when absent.
    pub fn resolve(&mut self, correlation_id: &CorrelationId, envelope: Envelope) -> bool {
        let Some(pending) = self.take(correlation_id) else {
            return false;
        };
        debug!(%correlation_id, request = %pending.event_type, response = %envelope.event_type, "request resolved");
        let _ = pending.tx.send(Ok(envelope));
        true
    }

    /// Fail a request. No-op when absent.
    pub fn reject(&mut self, correlation_id: &CorrelationId, error: FiglinkError) -> bool {
        let Some(pending) = self.take(correlation_id) else {
            return false;
        };
        debug!(%correlation_id, request = %pending.event_type, error = %error, "request rejected");
        let _ = pending.tx.send(Err(error));
        true
    }

    /// Apply the routing rule to an inbound envelope.
    ///
    /// Error kinds reject the waiting request with [`FiglinkError::Remote`],
    /// progress kinds leave it pending, anything else resolves it.
    pub fn route(&mut self, envelope: &Envelope) -> Routed {
        let correlation_id = envelope.correlation_id();
        if !self.contains(correlation_id) {
            return Routed::NotPending;
        }
        if envelope.event_type.is_progress() {
            return Routed::Progress;
        }
        if envelope.event_type.is_error() {
            let _ = self.reject(correlation_id, remote_error(envelope));
            return Routed::Rejected;
        }
        let _ = self.resolve(correlation_id, envelope.clone());
        Routed::Resolved
    }

    /// Fail every request whose deadline is at or before `now` with
    /// [`FiglinkError::Timeout`]. Returns how many expired.
    pub fn expire(&mut self, now: Instant) -> usize {
        let mut expired = 0;
        while self.deadlines.first().is_some_and(|(deadline, _)| *deadline <= now) {
            let Some((_, correlation_id)) = self.deadlines.pop_first() else {
                break;
            };
            let Some(pending) = self.entries.remove(&correlation_id) else {
                continue;
            };
            let timeout_ms = u64::try_from(pending.timeout.as_millis()).unwrap_or(u64::MAX);
            warn!(%correlation_id, request = %pending.event_type, timeout_ms, "request timed out");
            let _ = pending.tx.send(Err(FiglinkError::Timeout {
                correlation_id,
                timeout_ms,
            }));
            expired += 1;
        }
        expired
    }

    /// Earliest deadline among waiting requests.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.first().map(|(deadline, _)| *deadline)
    }

    /// Fail every waiting request with `error`. Returns how many there were.
    pub fn reject_all(&mut self, error: &FiglinkError) -> usize {
        let count = self.entries.len();
        self.deadlines.clear();
        for (correlation_id, pending) in self.entries.drain() {
            debug!(%correlation_id, request = %pending.event_type, "request rejected with connection");
            let _ = pending.tx.send(Err(error.clone()));
        }
        count
    }

    fn take(&mut self, correlation_id: &CorrelationId) -> Option<Pending> {
        let pending = self.entries.remove(correlation_id)?;
        let _ = self
            .deadlines
            .remove(&(pending.deadline, correlation_id.clone()));
        Some(pending)
    }
}

/// Build the error a correlated error envelope carries.
fn remote_error(envelope: &Envelope) -> FiglinkError {
    match envelope.payload_as::<ErrorPayload>() {
        Ok(payload) => FiglinkError::Remote {
            code: payload.code,
            message: payload.message,
            details: payload.details,
        },
        Err(_) => FiglinkError::Remote {
            code: envelope.event_type.as_str().to_lowercase(),
            message: envelope
                .payload
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("remote error")
                .to_string(),
            details: Some(envelope.payload.clone()),
        },
    }
}
