//! Event dispatch: fan inbound push events out to registered handlers.
//!
//! Handlers are keyed by the wire event name and run synchronously on
//! the pump task, in registration order. A handler that returns an
//! error or panics is logged and skipped; it never takes down the pump
//! or starves the other handlers for the same event.
//!
//! The platform may redeliver events after a reconnect, so handlers
//! must be idempotent.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use roomcast_api::PushEvent;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Error returned by a handler. Logged, never propagated.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self(message.to_owned())
    }
}

/// Opaque registration handle, used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type Handler = Arc<dyn Fn(&PushEvent) -> Result<(), HandlerError> + Send + Sync>;

/// Registry of event handlers plus the pump that feeds them.
///
/// Cheaply cloneable; clones share the same registry.
#[derive(Clone, Default)]
pub struct EventDispatcher {
    inner: Arc<DispatcherInner>,
}

#[derive(Default)]
struct DispatcherInner {
    handlers: DashMap<String, Vec<(HandlerId, Handler)>>,
    next_id: AtomicU64,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for events named `event`. Multiple handlers
    /// per name are allowed and run in registration order.
    pub fn register<F>(&self, event: impl Into<String>, handler: F) -> HandlerId
    where
        F: Fn(&PushEvent) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let id = HandlerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner
            .handlers
            .entry(event.into())
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove a previously registered handler. Returns `false` if the
    /// id was already gone.
    pub fn unregister(&self, id: HandlerId) -> bool {
        let mut removed = false;
        for mut entry in self.inner.handlers.iter_mut() {
            let before = entry.value().len();
            entry.value_mut().retain(|(hid, _)| *hid != id);
            if entry.value().len() != before {
                removed = true;
            }
        }
        removed
    }

    /// Number of handlers registered for `event`.
    pub fn handler_count(&self, event: &str) -> usize {
        self.inner
            .handlers
            .get(event)
            .map_or(0, |entry| entry.value().len())
    }

    /// Run every handler registered for `event.name`.
    pub fn deliver(&self, event: &PushEvent) {
        // Clone the handler list out so handlers can register/unregister
        // without deadlocking against the shard lock.
        let handlers: Vec<(HandlerId, Handler)> = match self.inner.handlers.get(&event.name) {
            Some(entry) => entry.value().clone(),
            None => {
                debug!(event = %event.name, "no handlers registered");
                return;
            }
        };

        for (id, handler) in handlers {
            let outcome = catch_unwind(AssertUnwindSafe(|| handler(event)));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(event = %event.name, handler = id.0, error = %e, "handler failed");
                }
                Err(_) => {
                    error!(event = %event.name, handler = id.0, "handler panicked");
                }
            }
        }
    }

    /// Spawn the pump task: read events from `events` and deliver each
    /// one, until `cancel` fires or the sender side goes away.
    ///
    /// A lagged receiver (consumer slower than the broadcast buffer)
    /// drops the missed events with a warning and keeps pumping.
    pub fn attach(
        &self,
        mut events: broadcast::Receiver<Arc<PushEvent>>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    recv = events.recv() => match recv {
                        Ok(event) => dispatcher.deliver(&event),
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "event pump lagged; events dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
            debug!("event pump exiting");
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    use chrono::Utc;
    use serde_json::json;

    use super::*;

    fn event(name: &str, payload: serde_json::Value) -> PushEvent {
        PushEvent {
            name: name.to_owned(),
            payload,
            received_at: Utc::now(),
        }
    }

    #[test]
    fn delivers_to_registered_handlers_in_order() {
        let dispatcher = EventDispatcher::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second"] {
            let seen = Arc::clone(&seen);
            dispatcher.register("device:offline", move |_| {
                seen.lock().unwrap().push(tag);
                Ok(())
            });
        }

        dispatcher.deliver(&event("device:offline", json!({})));
        assert_eq!(*seen.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn unrelated_events_do_not_fire() {
        let dispatcher = EventDispatcher::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&count);
        dispatcher.register("device:offline", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        dispatcher.deliver(&event("pms:sync-started", json!({})));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn failing_handler_does_not_block_the_rest() {
        let dispatcher = EventDispatcher::new();
        let count = Arc::new(AtomicUsize::new(0));

        dispatcher.register("system:alert", |_| Err("disk full".into()));
        let c = Arc::clone(&count);
        dispatcher.register("system:alert", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        dispatcher.deliver(&event("system:alert", json!({})));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_handler_is_contained() {
        let dispatcher = EventDispatcher::new();
        let count = Arc::new(AtomicUsize::new(0));

        dispatcher.register("system:alert", |_| panic!("handler bug"));
        let c = Arc::clone(&count);
        dispatcher.register("system:alert", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        dispatcher.deliver(&event("system:alert", json!({})));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unregister_stops_delivery() {
        let dispatcher = EventDispatcher::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&count);
        let id = dispatcher.register("device:heartbeat", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        dispatcher.deliver(&event("device:heartbeat", json!({})));
        assert!(dispatcher.unregister(id));
        dispatcher.deliver(&event("device:heartbeat", json!({})));

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!dispatcher.unregister(id));
        assert_eq!(dispatcher.handler_count("device:heartbeat"), 0);
    }

    #[test]
    fn redelivered_events_reach_handlers_twice() {
        // Dedup is the handler's job; the dispatcher delivers every
        // event it sees. An idempotent handler keyed on a payload id
        // converges anyway.
        let dispatcher = EventDispatcher::new();
        let deliveries = Arc::new(AtomicUsize::new(0));
        let seen_ids = Arc::new(Mutex::new(HashSet::new()));

        let d = Arc::clone(&deliveries);
        let ids = Arc::clone(&seen_ids);
        dispatcher.register("device:offline", move |event| {
            d.fetch_add(1, Ordering::SeqCst);
            if let Some(uuid) = event.payload["uuid"].as_str() {
                ids.lock().unwrap().insert(uuid.to_owned());
            }
            Ok(())
        });

        let payload = json!({ "uuid": "c0ffee", "room": "412" });
        dispatcher.deliver(&event("device:offline", payload.clone()));
        dispatcher.deliver(&event("device:offline", payload));

        assert_eq!(deliveries.load(Ordering::SeqCst), 2);
        assert_eq!(seen_ids.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn pump_delivers_broadcast_events_until_cancelled() {
        let dispatcher = EventDispatcher::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&count);
        dispatcher.register("device:offline", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let (tx, rx) = broadcast::channel(16);
        let cancel = CancellationToken::new();
        let pump = dispatcher.attach(rx, cancel.clone());

        tx.send(Arc::new(event("device:offline", json!({})))).unwrap();
        tx.send(Arc::new(event("device:offline", json!({})))).unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);

        cancel.cancel();
        pump.await.unwrap();
    }
}
