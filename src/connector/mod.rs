//! Feed connectors
//!
//! Shared lifecycle/cache/bus skeleton plus the two connector kinds: push
//! (streaming with reconnect backoff) and poll (periodic snapshot fetches).
//! Shared behavior lives in a composed [`ConnectorCore`] embedded by each
//! connector, not a base class.

pub mod poll;
pub mod push;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::bus::{EventBus, EventCallback, Subscription};
use crate::config::ServiceConfig;
use crate::error::FeedError;
use crate::types::{ConnectionChange, ConnectionStatus, DataMode, EventKind, FeedErrorEvent, FeedEvent, FeedType};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Capability surface every feed connector exposes to the orchestrator.
pub trait Connector: Send + Sync {
    fn feed(&self) -> FeedType;
    fn mode(&self) -> DataMode;
    fn status(&self) -> ConnectionStatus;
    fn cache_fresh(&self) -> bool;
    fn consecutive_errors(&self) -> u32;
    fn initialize(&self);
    fn reconnect(&self);
    fn shutdown(&self);
    fn subscribe(&self, kind: EventKind, callback: Box<EventCallback>) -> Subscription;
}

/// Most recently accepted data batch plus the instant it was accepted. Age
/// is recomputed lazily on query.
#[derive(Debug)]
pub struct CachedSnapshot<T> {
    records: Vec<T>,
    accepted_at: Instant,
}

impl<T> CachedSnapshot<T> {
    fn new(records: Vec<T>) -> Self {
        Self {
            records,
            accepted_at: Instant::now(),
        }
    }

    pub fn age(&self) -> Duration {
        self.accepted_at.elapsed()
    }

    pub fn is_fresh(&self, max_age: Duration) -> bool {
        self.age() < max_age
    }
}

struct CoreState<T> {
    status: ConnectionStatus,
    cache: Option<CachedSnapshot<T>>,
    consecutive_errors: u32,
    initialized: bool,
    shut_down: bool,
}

/// Shared skeleton embedded by every feed connector: status cell, snapshot
/// cache, consecutive-error counter and the connector's own event bus.
pub(crate) struct ConnectorCore<T> {
    feed: FeedType,
    mode: DataMode,
    config: Arc<ServiceConfig>,
    bus: EventBus,
    state: Mutex<CoreState<T>>,
}

impl<T: Clone> ConnectorCore<T> {
    pub fn new(feed: FeedType, mode: DataMode, config: Arc<ServiceConfig>) -> Self {
        Self {
            feed,
            mode,
            config,
            bus: EventBus::new(),
            state: Mutex::new(CoreState {
                status: ConnectionStatus::Disconnected,
                cache: None,
                consecutive_errors: 0,
                initialized: false,
                shut_down: false,
            }),
        }
    }

    pub fn feed(&self) -> FeedType {
        self.feed
    }

    pub fn mode(&self) -> DataMode {
        self.mode
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn emit(&self, event: FeedEvent) {
        self.bus.emit(&event);
    }

    pub fn status(&self) -> ConnectionStatus {
        lock(&self.state).status
    }

    /// Update status and announce the transition. Redundant sets are
    /// suppressed so subscribers never see no-op changes.
    pub fn set_status(&self, next: ConnectionStatus) {
        {
            let mut state = lock(&self.state);
            if state.status == next {
                return;
            }
            state.status = next;
        }
        self.bus.emit(&FeedEvent::ConnectionChange(ConnectionChange {
            feed: self.feed,
            status: next,
            mode: self.mode,
        }));
    }

    /// Replace the cached snapshot, stamp it with the current instant and
    /// reset the consecutive-error counter. The caller emits the matching
    /// update event in the same synchronous step.
    pub fn update_cache(&self, records: Vec<T>) {
        let mut state = lock(&self.state);
        state.cache = Some(CachedSnapshot::new(records));
        state.consecutive_errors = 0;
    }

    pub fn cache_valid(&self) -> bool {
        let max_age = self.config.cache.max_age();
        lock(&self.state)
            .cache
            .as_ref()
            .is_some_and(|snapshot| snapshot.is_fresh(max_age))
    }

    pub fn cached_records(&self) -> Option<Vec<T>> {
        lock(&self.state)
            .cache
            .as_ref()
            .map(|snapshot| snapshot.records.clone())
    }

    /// Count a failed attempt and surface it as an error event. Returns the
    /// new consecutive-failure count.
    pub fn record_error(&self, error: FeedError) -> u32 {
        let count = {
            let mut state = lock(&self.state);
            state.consecutive_errors += 1;
            state.consecutive_errors
        };
        self.bus.emit(&FeedEvent::Error(FeedErrorEvent {
            feed: self.feed,
            error,
        }));
        count
    }

    pub fn consecutive_errors(&self) -> u32 {
        lock(&self.state).consecutive_errors
    }

    pub fn reset_errors(&self) {
        lock(&self.state).consecutive_errors = 0;
    }

    /// Mark the connector initialized. Returns false when the call must be
    /// a no-op (already initialized, or shut down).
    pub fn mark_initialized(&self) -> bool {
        let mut state = lock(&self.state);
        if state.initialized || state.shut_down {
            debug!(feed = %self.feed, "initialize ignored");
            return false;
        }
        state.initialized = true;
        true
    }

    pub fn is_initialized(&self) -> bool {
        lock(&self.state).initialized
    }

    /// Flip the one-way shut-down latch. Returns false when already down.
    pub fn begin_shutdown(&self) -> bool {
        let mut state = lock(&self.state);
        if state.shut_down {
            return false;
        }
        state.shut_down = true;
        true
    }

    pub fn is_shut_down(&self) -> bool {
        lock(&self.state).shut_down
    }

    /// Final shutdown step: drop the cache, silence the bus and settle the
    /// status without emitting (the registry is already cleared).
    pub fn finish_shutdown(&self) {
        {
            let mut state = lock(&self.state);
            state.cache = None;
            state.status = ConnectionStatus::Disconnected;
        }
        self.bus.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn core() -> ConnectorCore<u32> {
        ConnectorCore::new(
            FeedType::Crypto,
            DataMode::Push,
            Arc::new(ServiceConfig::default()),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn cache_goes_stale_past_max_age() {
        let core = core();
        assert!(!core.cache_valid());

        core.update_cache(vec![1, 2, 3]);
        assert!(core.cache_valid());

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(!core.cache_valid());
        // Records remain readable even when stale.
        assert_eq!(core.cached_records(), Some(vec![1, 2, 3]));
    }

    #[test]
    fn update_cache_resets_error_counter() {
        let core = core();
        core.record_error(FeedError::Fetch("boom".into()));
        core.record_error(FeedError::Fetch("boom".into()));
        assert_eq!(core.consecutive_errors(), 2);

        core.update_cache(vec![7]);
        assert_eq!(core.consecutive_errors(), 0);
    }

    #[test]
    fn redundant_status_sets_are_suppressed() {
        let core = core();
        let changes = Arc::new(AtomicUsize::new(0));
        let _sub = {
            let changes = Arc::clone(&changes);
            core.bus().subscribe(EventKind::ConnectionChange, move |_| {
                changes.fetch_add(1, Ordering::SeqCst);
            })
        };

        core.set_status(ConnectionStatus::Connecting);
        core.set_status(ConnectionStatus::Connecting);
        core.set_status(ConnectionStatus::Connected);
        assert_eq!(changes.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn initialize_and_shutdown_latches() {
        let core = core();
        assert!(core.mark_initialized());
        assert!(!core.mark_initialized());

        assert!(core.begin_shutdown());
        assert!(!core.begin_shutdown());
        core.finish_shutdown();

        // Shutdown is one-way: initialize does nothing afterwards.
        assert!(!core.mark_initialized());
        assert!(core.cached_records().is_none());
    }
}
