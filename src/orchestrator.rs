//! Feed orchestrator
//!
//! Owns one instance of each connector, staggers their startup, forwards
//! their events on a unified bus and exposes the coarse operations the rest
//! of the application uses. Explicitly constructed and explicitly owned by
//! the process entry point; there is no hidden global instance. Nothing here
//! throws: failure only ever surfaces as forwarded error events.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::info;

use crate::bus::{EventBus, Subscription};
use crate::config::ServiceConfig;
use crate::connector::poll::{HttpFetcher, PollConnector, SnapshotFetcher};
use crate::connector::push::{PushConnector, StreamTransport, WsTransport};
use crate::connector::{lock, Connector};
use crate::feeds::{CryptoFeed, FundFeed, IndexFeed, MoversFeed};
use crate::market_hours::{MarketClock, SessionCalendar};
use crate::types::{
    ConnectionStatus, DataMode, EventKind, FeedEvent, FeedType, MarketStatusChange,
};

const FEED_TOTAL: usize = 4;

/// External collaborators the orchestrator wires into its connectors.
/// `live()` builds the production set; tests substitute scripted ones.
pub struct FeedRuntime {
    pub transport: Arc<dyn StreamTransport>,
    pub fetcher: Arc<dyn SnapshotFetcher>,
    pub clock: Arc<dyn MarketClock>,
}

impl FeedRuntime {
    pub fn live(config: &ServiceConfig) -> Self {
        Self {
            transport: Arc::new(WsTransport),
            fetcher: Arc::new(HttpFetcher::new(&config.endpoints.rest_base)),
            clock: Arc::new(SessionCalendar::us_equities()),
        }
    }
}

/// Point-in-time view of one connector for health/debug panels.
#[derive(Debug, Clone)]
pub struct FeedHealth {
    pub feed: FeedType,
    pub mode: DataMode,
    pub status: ConnectionStatus,
    pub cache_fresh: bool,
    pub consecutive_errors: u32,
}

/// The single component the rest of the application talks to.
pub struct FeedOrchestrator {
    config: Arc<ServiceConfig>,
    bus: EventBus,
    crypto: PushConnector<CryptoFeed>,
    index: PushConnector<IndexFeed>,
    fund: PollConnector<FundFeed>,
    movers: PollConnector<MoversFeed>,
    clock: Arc<dyn MarketClock>,
    completed: Arc<AtomicUsize>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    // Held so the per-connector forwarding registrations stay alive.
    _forwards: Vec<Subscription>,
    started: AtomicBool,
    shut_down: AtomicBool,
}

impl FeedOrchestrator {
    /// Build the orchestrator and wire event forwarding. Each connector's
    /// bus is subscribed exactly once per event kind here at construction;
    /// events re-emit on the unified bus in arrival order, already tagged
    /// with their originating feed.
    pub fn new(config: Arc<ServiceConfig>, runtime: FeedRuntime) -> Self {
        let bus = EventBus::new();

        let crypto: PushConnector<CryptoFeed> =
            PushConnector::new(Arc::clone(&config), Arc::clone(&runtime.transport));
        let index: PushConnector<IndexFeed> =
            PushConnector::new(Arc::clone(&config), Arc::clone(&runtime.transport));
        let fund: PollConnector<FundFeed> = PollConnector::new(
            Arc::clone(&config),
            Arc::clone(&runtime.fetcher),
            Arc::clone(&runtime.clock),
        );
        let movers: PollConnector<MoversFeed> = PollConnector::new(
            Arc::clone(&config),
            Arc::clone(&runtime.fetcher),
            Arc::clone(&runtime.clock),
        );

        let mut forwards = Vec::new();
        forwards.extend(Self::forward(&bus, &crypto, EventKind::CryptoUpdate));
        forwards.extend(Self::forward(&bus, &index, EventKind::IndexUpdate));
        forwards.extend(Self::forward(&bus, &fund, EventKind::FundUpdate));
        forwards.extend(Self::forward(&bus, &movers, EventKind::MoversUpdate));

        info!(config = %config.digest(), "feed orchestrator constructed");

        Self {
            config,
            bus,
            crypto,
            index,
            fund,
            movers,
            clock: runtime.clock,
            completed: Arc::new(AtomicUsize::new(0)),
            tasks: Mutex::new(Vec::new()),
            _forwards: forwards,
            started: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
        }
    }

    fn forward(
        bus: &EventBus,
        connector: &dyn Connector,
        update_kind: EventKind,
    ) -> Vec<Subscription> {
        [update_kind, EventKind::ConnectionChange, EventKind::Error]
            .into_iter()
            .map(|kind| {
                let outer = bus.clone();
                connector.subscribe(kind, Box::new(move |event| outer.emit(event)))
            })
            .collect()
    }

    /// Start every connector with staggered delays and begin the market
    /// watch. Idempotent; a no-op after shutdown.
    pub fn start(&self) {
        if self.shut_down.load(Ordering::SeqCst) || self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        self.bus
            .emit(&FeedEvent::BackgroundLoadingStart { total: FEED_TOTAL });
        info!(total = FEED_TOTAL, "starting feed connectors");

        let mut tasks = lock(&self.tasks);
        tasks.push(self.spawn_staged(0, self.crypto.clone()));
        tasks.push(self.spawn_staged(1, self.index.clone()));
        tasks.push(self.spawn_staged(2, self.fund.clone()));
        tasks.push(self.spawn_staged(3, self.movers.clone()));
        tasks.push(self.spawn_market_watch());
    }

    fn spawn_staged<C>(&self, position: u32, connector: C) -> JoinHandle<()>
    where
        C: Connector + 'static,
    {
        let delay = self.config.startup.stagger() * position;
        let bus = self.bus.clone();
        let completed = Arc::clone(&self.completed);
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let feed = connector.feed();
            info!(feed = %feed, "starting connector");
            connector.initialize();

            let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
            bus.emit(&FeedEvent::BackgroundLoadingComplete { feed });
            bus.emit(&FeedEvent::BackgroundLoadingProgress {
                completed: done,
                total: FEED_TOTAL,
            });
        })
    }

    /// Coarse market watch: emits `market_status_change` only when the
    /// open/closed state actually flips, never on every tick.
    fn spawn_market_watch(&self) -> JoinHandle<()> {
        let clock = Arc::clone(&self.clock);
        let bus = self.bus.clone();
        let every = self.config.startup.market_check();
        tokio::spawn(async move {
            let mut open = clock.is_open();
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let now_open = clock.is_open();
                if now_open != open {
                    open = now_open;
                    info!(open = now_open, "market status changed");
                    bus.emit(&FeedEvent::MarketStatusChange(MarketStatusChange {
                        open: now_open,
                        ts: chrono::Utc::now().timestamp_millis(),
                    }));
                }
            }
        })
    }

    /// Single consumer-facing entry point for event delivery.
    pub fn subscribe(
        &self,
        kind: EventKind,
        callback: impl Fn(&FeedEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.bus.subscribe(kind, callback)
    }

    fn connectors(&self) -> [&dyn Connector; FEED_TOTAL] {
        [&self.crypto, &self.index, &self.fund, &self.movers]
    }

    fn connector(&self, feed: FeedType) -> &dyn Connector {
        match feed {
            FeedType::Crypto => &self.crypto,
            FeedType::BroadIndex => &self.index,
            FeedType::Fund => &self.fund,
            FeedType::Movers => &self.movers,
        }
    }

    /// Reconnect one feed, regardless of kind. The connector itself ignores
    /// the request when it is already active.
    pub fn reconnect_feed(&self, feed: FeedType) {
        self.connector(feed).reconnect();
    }

    /// Reconnect every connector currently disconnected; anything
    /// connecting, connected or polling is left untouched.
    pub fn reconnect_all(&self) {
        let mut restarted = 0usize;
        for connector in self.connectors() {
            if connector.status() == ConnectionStatus::Disconnected {
                connector.reconnect();
                restarted += 1;
            }
        }
        info!(restarted, "reconnect sweep complete");
    }

    /// Grow a poll feed's page window and re-emit the merged set. Returns
    /// whether the set grew; always false for push feeds.
    pub async fn load_more(&self, feed: FeedType) -> bool {
        match feed {
            FeedType::Fund => self.fund.load_more().await,
            FeedType::Movers => self.movers.load_more().await,
            FeedType::Crypto | FeedType::BroadIndex => false,
        }
    }

    /// Manually refresh a poll feed, joining any fetch already in flight.
    pub async fn refresh(&self, feed: FeedType) {
        match feed {
            FeedType::Fund => self.fund.refresh().await,
            FeedType::Movers => self.movers.refresh().await,
            FeedType::Crypto | FeedType::BroadIndex => {}
        }
    }

    /// Startup progress as `(completed, total)`.
    pub fn loading_progress(&self) -> (usize, usize) {
        (self.completed.load(Ordering::SeqCst), FEED_TOTAL)
    }

    /// Per-feed status snapshot for health/debug panels.
    pub fn health(&self) -> Vec<FeedHealth> {
        self.connectors()
            .into_iter()
            .map(|connector| FeedHealth {
                feed: connector.feed(),
                mode: connector.mode(),
                status: connector.status(),
                cache_fresh: connector.cache_fresh(),
                consecutive_errors: connector.consecutive_errors(),
            })
            .collect()
    }

    /// Tear everything down: every connector unconditionally, then the
    /// orchestrator's own registry. Idempotent and never fails.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        for connector in self.connectors() {
            connector.shutdown();
        }
        self.bus.clear();
        info!("feed orchestrator shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_hours::MockMarketClock;
    use async_trait::async_trait;
    use crate::connector::poll::{PageRequest, PageResponse};
    use crate::connector::push::{FrameSink, FrameSource};
    use crate::error::FeedError;

    struct RefusingTransport;

    #[async_trait]
    impl StreamTransport for RefusingTransport {
        async fn connect(
            &self,
            _url: &str,
        ) -> Result<(Box<dyn FrameSink>, Box<dyn FrameSource>), FeedError> {
            Err(FeedError::Stream("connection refused".into()))
        }
    }

    struct EmptyFetcher;

    #[async_trait]
    impl SnapshotFetcher for EmptyFetcher {
        async fn fetch_page(&self, _request: &PageRequest) -> Result<PageResponse, FeedError> {
            serde_json::from_value(serde_json::json!({"data": []}))
                .map_err(|e| FeedError::Body(e.to_string()))
        }
    }

    fn test_runtime() -> FeedRuntime {
        let mut clock = MockMarketClock::new();
        clock.expect_is_open().return_const(true);
        FeedRuntime {
            transport: Arc::new(RefusingTransport),
            fetcher: Arc::new(EmptyFetcher),
            clock: Arc::new(clock),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn health_covers_every_feed_before_start() {
        let orchestrator =
            FeedOrchestrator::new(Arc::new(ServiceConfig::default()), test_runtime());

        let health = orchestrator.health();
        assert_eq!(health.len(), 4);
        for entry in &health {
            assert_eq!(entry.status, ConnectionStatus::Disconnected);
            assert!(!entry.cache_fresh);
        }
        assert_eq!(orchestrator.loading_progress(), (0, 4));
    }

    #[tokio::test(start_paused = true)]
    async fn load_more_on_push_feeds_is_inert() {
        let orchestrator =
            FeedOrchestrator::new(Arc::new(ServiceConfig::default()), test_runtime());
        assert!(!orchestrator.load_more(FeedType::Crypto).await);
        assert!(!orchestrator.load_more(FeedType::BroadIndex).await);
    }
}
