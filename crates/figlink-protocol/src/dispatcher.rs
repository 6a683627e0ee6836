//! Event dispatcher: fan-out of inbound envelopes to subscribers.
//!
//! The subscriber map lives in the connection actor. For each inbound
//! envelope the actor takes a snapshot of the matching handlers and queues it,
//! together with the envelope, to a dedicated delivery task. That task runs
//! the handlers one after another in arrival order, so a slow handler delays
//! later deliveries but never the connection itself.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use figlink_core::{Envelope, EventType};
use futures::FutureExt;
use tokio::sync::mpsc;
use tracing::warn;

/// Error returned by a handler.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Receives inbound envelopes.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    /// Handle one envelope. Errors are logged and otherwise ignored.
    async fn handle(&self, envelope: Envelope) -> Result<(), HandlerError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, envelope: Envelope) -> Result<(), HandlerError> {
        (self.0)(envelope).await
    }
}

/// Adapt an async closure into an [`EventHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Token identifying one registration.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Subscription {
    id: u64,
    event_type: Option<EventType>,
}

impl Subscription {
    /// Numeric ID, unique per client.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Subscribed type; `None` for passive observers.
    #[must_use]
    pub fn event_type(&self) -> Option<&EventType> {
        self.event_type.as_ref()
    }
}

type Registered = (u64, Arc<dyn EventHandler>);

struct Delivery {
    envelope: Envelope,
    handlers: Vec<Arc<dyn EventHandler>>,
}

/// Subscriber map plus the queue into the delivery task.
pub struct Dispatcher {
    next_id: u64,
    by_type: HashMap<EventType, Vec<Registered>>,
    observers: Vec<Registered>,
    deliveries: mpsc::UnboundedSender<Delivery>,
}

impl Dispatcher {
    /// New dispatcher; spawns its delivery task on the current runtime.
    #[must_use]
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tokio::spawn(deliver(rx));
        Self {
            next_id: 1,
            by_type: HashMap::new(),
            observers: Vec::new(),
            deliveries: tx,
        }
    }

    /// Subscribe `handler` to envelopes of `event_type`.
    pub fn register(&mut self, event_type: EventType, handler: Arc<dyn EventHandler>) -> Subscription {
        let id = self.allocate_id();
        self.by_type
            .entry(event_type.clone())
            .or_default()
            .push((id, handler));
        Subscription {
            id,
            event_type: Some(event_type),
        }
    }

    /// Subscribe `handler` to every inbound envelope.
    pub fn register_observer(&mut self, handler: Arc<dyn EventHandler>) -> Subscription {
        let id = self.allocate_id();
        self.observers.push((id, handler));
        Subscription {
            id,
            event_type: None,
        }
    }

    /// Remove a registration. Returns whether it was present.
    pub fn unregister(&mut self, subscription: &Subscription) -> bool {
        let list = match &subscription.event_type {
            Some(event_type) => match self.by_type.get_mut(event_type) {
                Some(list) => list,
                None => return false,
            },
            None => &mut self.observers,
        };
        let before = list.len();
        list.retain(|(id, _)| *id != subscription.id);
        let removed = list.len() != before;
        if let Some(event_type) = &subscription.event_type {
            if self.by_type.get(event_type).is_some_and(Vec::is_empty) {
                let _ = self.by_type.remove(event_type);
            }
        }
        removed
    }

    /// Number of live registrations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.observers.len() + self.by_type.values().map(Vec::len).sum::<usize>()
    }

    /// Whether nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the handlers that should see `envelope`.
    ///
    /// Type subscribers first, then observers. With `observers_only`, type
    /// subscribers are skipped (used for responses that completed a request).
    #[must_use]
    pub fn handlers_for(&self, envelope: &Envelope, observers_only: bool) -> Vec<Arc<dyn EventHandler>> {
        let typed = if observers_only {
            None
        } else {
            self.by_type.get(&envelope.event_type)
        };
        typed
            .into_iter()
            .flatten()
            .chain(self.observers.iter())
            .map(|(_, handler)| Arc::clone(handler))
            .collect()
    }

    /// Queue `envelope` for its handlers. Returns how many handlers it went to.
    pub fn dispatch(&self, envelope: Envelope, observers_only: bool) -> usize {
        let handlers = self.handlers_for(&envelope, observers_only);
        let count = handlers.len();
        if count == 0 {
            tracing::trace!(event_type = %envelope.event_type, "no subscribers");
            return 0;
        }
        if self.deliveries.send(Delivery { envelope, handlers }).is_err() {
            warn!("delivery task stopped, dropping envelope");
            return 0;
        }
        count
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

async fn deliver(mut deliveries: mpsc::UnboundedReceiver<Delivery>) {
    while let Some(Delivery { envelope, handlers }) = deliveries.recv().await {
        for handler in handlers {
            let outcome = AssertUnwindSafe(handler.handle(envelope.clone()))
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(
                        event_type = %envelope.event_type,
                        correlation_id = %envelope.metadata.correlation_id,
                        error = %e,
                        "event handler failed"
                    );
                }
                Err(panic) => {
                    warn!(
                        event_type = %envelope.event_type,
                        correlation_id = %envelope.metadata.correlation_id,
                        panic = panic_message(panic.as_ref()),
                        "event handler panicked"
                    );
                }
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figlink_core::{EventSource, SessionId};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::time::Duration;

    fn envelope(event_type: EventType) -> Envelope {
        Envelope::new(event_type, json!({}), EventSource::Server, SessionId::new())
    }

    fn recorder(log: &Arc<Mutex<Vec<String>>>, tag: &'static str) -> Arc<dyn EventHandler> {
        let log = Arc::clone(log);
        handler_fn(move |env: Envelope| {
            let log = Arc::clone(&log);
            async move {
                log.lock().push(format!("{tag}:{}", env.event_type));
                Ok::<(), HandlerError>(())
            }
        })
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test]
    async fn delivers_to_type_subscribers_and_observers() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut d = Dispatcher::spawn();
        let _ = d.register(EventType::SelectionChange, recorder(&log, "a"));
        let _ = d.register(EventType::AnalysisResult, recorder(&log, "b"));
        let _ = d.register_observer(recorder(&log, "obs"));

        assert_eq!(d.dispatch(envelope(EventType::SelectionChange), false), 2);
        settle().await;
        assert_eq!(*log.lock(), vec!["a:SELECTION_CHANGE", "obs:SELECTION_CHANGE"]);
    }

    #[tokio::test]
    async fn observers_only_skips_type_subscribers() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut d = Dispatcher::spawn();
        let _ = d.register(EventType::Pong, recorder(&log, "a"));
        let _ = d.register_observer(recorder(&log, "obs"));

        assert_eq!(d.dispatch(envelope(EventType::Pong), true), 1);
        settle().await;
        assert_eq!(*log.lock(), vec!["obs:PONG"]);
    }

    #[tokio::test]
    async fn failing_and_panicking_handlers_do_not_stop_delivery() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut d = Dispatcher::spawn();
        let _ = d.register(
            EventType::SelectionChange,
            handler_fn(|_| async { Err::<(), HandlerError>("nope".into()) }),
        );
        let _ = d.register(
            EventType::SelectionChange,
            handler_fn(|env: Envelope| async move {
                assert!(env.payload.is_null(), "handler blew up");
                Ok::<(), HandlerError>(())
            }),
        );
        let _ = d.register(EventType::SelectionChange, recorder(&log, "ok"));

        let _ = d.dispatch(envelope(EventType::SelectionChange), false);
        let _ = d.dispatch(envelope(EventType::SelectionChange), false);
        settle().await;
        assert_eq!(log.lock().len(), 2);
    }

    #[tokio::test]
    async fn unregister_stops_delivery() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut d = Dispatcher::spawn();
        let sub = d.register(EventType::SelectionChange, recorder(&log, "a"));
        assert_eq!(d.len(), 1);
        assert!(d.unregister(&sub));
        assert!(!d.unregister(&sub));
        assert!(d.is_empty());

        assert_eq!(d.dispatch(envelope(EventType::SelectionChange), false), 0);
        settle().await;
        assert!(log.lock().is_empty());
    }

    #[tokio::test]
    async fn snapshot_is_taken_at_dispatch_time() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut d = Dispatcher::spawn();
        let sub = d.register(EventType::SelectionChange, recorder(&log, "a"));
        let _ = d.dispatch(envelope(EventType::SelectionChange), false);
        let _ = d.unregister(&sub);
        settle().await;
        assert_eq!(*log.lock(), vec!["a:SELECTION_CHANGE"]);
    }

    #[tokio::test]
    async fn delivery_preserves_arrival_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut d = Dispatcher::spawn();
        let _ = d.register_observer(recorder(&log, "o"));
        for t in [EventType::Connect, EventType::SelectionChange, EventType::Disconnect] {
            let _ = d.dispatch(envelope(t), false);
        }
        settle().await;
        assert_eq!(*log.lock(), vec!["o:CONNECT", "o:SELECTION_CHANGE", "o:DISCONNECT"]);
    }

    #[tokio::test]
    async fn subscription_ids_are_unique() {
        let mut d = Dispatcher::spawn();
        let a = d.register(EventType::Ping, handler_fn(|_| async { Ok::<(), HandlerError>(()) }));
        let b = d.register_observer(handler_fn(|_| async { Ok::<(), HandlerError>(()) }));
        assert_ne!(a.id(), b.id());
        assert_eq!(a.event_type(), Some(&EventType::Ping));
        assert_eq!(b.event_type(), None);
    }
}
