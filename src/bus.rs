//! Typed publish/subscribe bus
//!
//! One registry per connector plus one on the orchestrator. Emission walks a
//! snapshot of the registered callbacks, so a callback may subscribe or
//! unsubscribe others without corrupting the in-progress pass; a handle
//! disposed mid-pass is skipped for the rest of that pass. A callback that
//! panics is caught and logged and never aborts delivery to the remaining
//! callbacks.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::warn;

use crate::types::{EventKind, FeedEvent};

/// Callback signature every subscriber implements.
pub type EventCallback = dyn Fn(&FeedEvent) + Send + Sync;

struct Handler {
    id: u64,
    callback: Arc<EventCallback>,
}

#[derive(Default)]
struct Registry {
    handlers: HashMap<EventKind, Vec<Handler>>,
    next_id: u64,
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Subscription registry keyed by event kind, with callbacks invoked in
/// subscription order.
#[derive(Clone, Default)]
pub struct EventBus {
    registry: Arc<Mutex<Registry>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback for one event kind. The returned handle removes
    /// exactly this registration when disposed.
    pub fn subscribe(
        &self,
        kind: EventKind,
        callback: impl Fn(&FeedEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let mut registry = lock(&self.registry);
        let id = registry.next_id;
        registry.next_id += 1;
        registry.handlers.entry(kind).or_default().push(Handler {
            id,
            callback: Arc::new(callback),
        });
        Subscription {
            registry: Arc::downgrade(&self.registry),
            kind,
            id,
        }
    }

    /// Deliver an event to every callback registered under its kind.
    pub fn emit(&self, event: &FeedEvent) {
        let kind = event.kind();
        let snapshot: Vec<(u64, Arc<EventCallback>)> = {
            let registry = lock(&self.registry);
            registry
                .handlers
                .get(&kind)
                .map(|handlers| {
                    handlers
                        .iter()
                        .map(|h| (h.id, Arc::clone(&h.callback)))
                        .collect()
                })
                .unwrap_or_default()
        };

        for (id, callback) in snapshot {
            // A handle disposed earlier in this pass must not be called.
            let still_registered = {
                let registry = lock(&self.registry);
                registry
                    .handlers
                    .get(&kind)
                    .is_some_and(|handlers| handlers.iter().any(|h| h.id == id))
            };
            if !still_registered {
                continue;
            }
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                warn!(kind = %kind, "subscriber callback panicked during emission");
            }
        }
    }

    /// Drop every registration.
    pub fn clear(&self) {
        lock(&self.registry).handlers.clear();
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        lock(&self.registry)
            .handlers
            .get(&kind)
            .map_or(0, Vec::len)
    }
}

/// Disposer returned by [`EventBus::subscribe`]. Disposal is idempotent and
/// removes only the handle it was created for.
pub struct Subscription {
    registry: Weak<Mutex<Registry>>,
    kind: EventKind,
    id: u64,
}

impl Subscription {
    pub fn dispose(&self) {
        if let Some(registry) = self.registry.upgrade() {
            let mut registry = lock(&registry);
            if let Some(handlers) = registry.handlers.get_mut(&self.kind) {
                handlers.retain(|h| h.id != self.id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MarketStatusChange;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn status_event() -> FeedEvent {
        FeedEvent::MarketStatusChange(MarketStatusChange { open: true, ts: 0 })
    }

    #[test]
    fn callbacks_run_in_subscription_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for label in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            let _sub = bus.subscribe(EventKind::MarketStatusChange, move |_| {
                order.lock().unwrap().push(label);
            });
        }

        bus.emit(&status_event());
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn dispose_is_idempotent_and_targets_one_handle() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let keep = {
            let hits = Arc::clone(&hits);
            bus.subscribe(EventKind::MarketStatusChange, move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            })
        };
        let drop_me = {
            let hits = Arc::clone(&hits);
            bus.subscribe(EventKind::MarketStatusChange, move |_| {
                hits.fetch_add(100, Ordering::SeqCst);
            })
        };

        drop_me.dispose();
        drop_me.dispose();
        bus.emit(&status_event());

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        keep.dispose();
        bus.emit(&status_event());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_during_emission_skips_disposed_handle() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let victim_slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        // First callback disposes the second before the pass reaches it.
        let _disposer = {
            let victim_slot = Arc::clone(&victim_slot);
            bus.subscribe(EventKind::MarketStatusChange, move |_| {
                if let Some(victim) = victim_slot.lock().unwrap().take() {
                    victim.dispose();
                }
            })
        };

        let victim = {
            let hits = Arc::clone(&hits);
            bus.subscribe(EventKind::MarketStatusChange, move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            })
        };
        *victim_slot.lock().unwrap() = Some(victim);

        bus.emit(&status_event());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn subscribing_during_emission_does_not_receive_current_event() {
        let bus = EventBus::new();
        let late_hits = Arc::new(AtomicUsize::new(0));

        let _adder = {
            let bus_inner = bus.clone();
            let late_hits = Arc::clone(&late_hits);
            bus.subscribe(EventKind::MarketStatusChange, move |_| {
                let late_hits = Arc::clone(&late_hits);
                let _late = bus_inner.subscribe(EventKind::MarketStatusChange, move |_| {
                    late_hits.fetch_add(1, Ordering::SeqCst);
                });
            })
        };

        bus.emit(&status_event());
        assert_eq!(late_hits.load(Ordering::SeqCst), 0);

        bus.emit(&status_event());
        assert_eq!(late_hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_callback_does_not_abort_delivery() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let _panicker = bus.subscribe(EventKind::MarketStatusChange, |_| panic!("subscriber bug"));
        let _counter = {
            let hits = Arc::clone(&hits);
            bus.subscribe(EventKind::MarketStatusChange, move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            })
        };

        bus.emit(&status_event());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn clear_removes_every_registration() {
        let bus = EventBus::new();
        let _a = bus.subscribe(EventKind::Error, |_| {});
        let _b = bus.subscribe(EventKind::Error, |_| {});
        assert_eq!(bus.handler_count(EventKind::Error), 2);
        bus.clear();
        assert_eq!(bus.handler_count(EventKind::Error), 0);
    }
}
