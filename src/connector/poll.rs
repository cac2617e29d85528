//! Poll connector
//!
//! No persistent connection; a repeating, market-hours-aware loop fetches
//! snapshots over request/response calls. Fresh cache is served synchronously
//! with a non-blocking refresh behind it, concurrent fetches collapse into a
//! single request, and repeated failures suspend polling for a cooldown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::{BoxFuture, Shared};
use futures_util::FutureExt;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{lock, Connector, ConnectorCore};
use crate::bus::{EventCallback, Subscription};
use crate::config::ServiceConfig;
use crate::error::FeedError;
use crate::market_hours::MarketClock;
use crate::types::{ConnectionStatus, DataMode, EventKind, FeedEvent, FeedType};

/// Sort direction for snapshot requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortOrder::Asc => "asc",
            SortOrder::Desc => "desc",
        }
    }
}

/// Parameterized snapshot request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub path: &'static str,
    pub limit: usize,
    pub offset: usize,
    pub sort_by: &'static str,
    pub order: SortOrder,
}

/// Snapshot response body. Tolerates either pagination metadata shape.
#[derive(Debug, Clone, Deserialize)]
pub struct PageResponse {
    #[serde(default)]
    pub data: Vec<serde_json::Value>,
    #[serde(default)]
    metadata: Option<PageMetadata>,
    #[serde(default)]
    pagination: Option<PageCursor>,
}

#[derive(Debug, Clone, Deserialize)]
struct PageMetadata {
    total_available: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
struct PageCursor {
    total_count: Option<u64>,
    has_next: Option<bool>,
}

impl PageResponse {
    pub fn total_count(&self) -> Option<u64> {
        self.metadata
            .as_ref()
            .and_then(|m| m.total_available)
            .or_else(|| self.pagination.as_ref().and_then(|p| p.total_count))
    }

    pub fn has_next(&self) -> Option<bool> {
        self.pagination.as_ref().and_then(|p| p.has_next)
    }
}

/// Issues snapshot requests. The production implementation speaks HTTP;
/// tests substitute scripted fetchers.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SnapshotFetcher: Send + Sync {
    async fn fetch_page(&self, request: &PageRequest) -> Result<PageResponse, FeedError>;
}

/// Static description of one poll feed: where it polls, how it sorts and how
/// its rows normalize.
pub trait PollFeed: Send + Sync + 'static {
    type Record: Clone + Send + Sync + 'static;

    const FEED: FeedType;

    fn endpoint_path() -> &'static str;
    fn sort_by() -> &'static str;
    fn sort_order() -> SortOrder;
    fn normalize(row: &serde_json::Value) -> Option<Self::Record>;
    fn update_event(records: Vec<Self::Record>) -> FeedEvent;
}

/// One normalized fetch result, shared between single-flight awaiters.
#[derive(Debug, Clone)]
struct FetchedPage<R> {
    records: Vec<R>,
    total_count: Option<u64>,
    has_next: Option<bool>,
}

type SharedFetch<R> = Shared<BoxFuture<'static, Result<FetchedPage<R>, FeedError>>>;

fn shared_fetch<F: PollFeed>(
    fetcher: Arc<dyn SnapshotFetcher>,
    request: PageRequest,
) -> SharedFetch<F::Record> {
    async move {
        let page = fetcher.fetch_page(&request).await?;
        let records: Vec<F::Record> = page.data.iter().filter_map(F::normalize).collect();
        Ok(FetchedPage {
            records,
            total_count: page.total_count(),
            has_next: page.has_next(),
        })
    }
    .boxed()
    .shared()
}

struct PageState {
    offset: usize,
    limit: usize,
    has_more: bool,
    total_count: Option<u64>,
}

#[derive(Default)]
struct PollTasks {
    poll: Option<JoinHandle<()>>,
    refresh: Option<JoinHandle<()>>,
}

struct PollInner<F: PollFeed> {
    core: ConnectorCore<F::Record>,
    fetcher: Arc<dyn SnapshotFetcher>,
    clock: Arc<dyn MarketClock>,
    paging: Mutex<PageState>,
    inflight: Mutex<Option<SharedFetch<F::Record>>>,
    cooling: AtomicBool,
    tasks: Mutex<PollTasks>,
}

/// Polling feed connector (fund / movers).
pub struct PollConnector<F: PollFeed> {
    inner: Arc<PollInner<F>>,
}

impl<F: PollFeed> Clone for PollConnector<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: PollFeed> PollConnector<F> {
    pub fn new(
        config: Arc<ServiceConfig>,
        fetcher: Arc<dyn SnapshotFetcher>,
        clock: Arc<dyn MarketClock>,
    ) -> Self {
        let page_size = config.poll.page_size;
        Self {
            inner: Arc::new(PollInner {
                core: ConnectorCore::new(F::FEED, DataMode::Poll, config),
                fetcher,
                clock,
                paging: Mutex::new(PageState {
                    offset: 0,
                    limit: page_size,
                    has_more: true,
                    total_count: None,
                }),
                inflight: Mutex::new(None),
                cooling: AtomicBool::new(false),
                tasks: Mutex::new(PollTasks::default()),
            }),
        }
    }

    /// Start the polling loop. Safe to call twice; a no-op once shut down.
    pub fn initialize(&self) {
        if !self.inner.core.mark_initialized() {
            return;
        }
        self.inner.core.set_status(ConnectionStatus::PollMode);
        PollInner::spawn_poll_loop(&self.inner);
    }

    /// Restart polling after a terminal stop. Ignored while polling is
    /// active.
    pub fn reconnect(&self) {
        PollInner::manual_reconnect(&self.inner);
    }

    /// Tear down the connector: cancel the loop and any background refresh,
    /// clear cache and subscriptions. One-way and idempotent.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    pub fn subscribe(
        &self,
        kind: EventKind,
        callback: impl Fn(&FeedEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.core.bus().subscribe(kind, callback)
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.core.status()
    }

    pub fn cache_valid(&self) -> bool {
        self.inner.core.cache_valid()
    }

    pub fn cached_records(&self) -> Option<Vec<F::Record>> {
        self.inner.core.cached_records()
    }

    /// Whether the last fetch reported more rows beyond the current range.
    pub fn has_more(&self) -> bool {
        lock(&self.inner.paging).has_more
    }

    /// Manual refresh; joins any fetch already in flight instead of issuing
    /// a duplicate request.
    pub async fn refresh(&self) {
        if self.inner.core.is_shut_down() || !self.inner.core.is_initialized() {
            return;
        }
        let _ = PollInner::refresh_once(&self.inner).await;
    }

    /// Grow the page window, refetch the full accumulated range and re-emit
    /// the complete merged set. Returns whether the set grew. A no-op while
    /// an error cooldown is active.
    pub async fn load_more(&self) -> bool {
        PollInner::load_more(&self.inner).await
    }
}

impl<F: PollFeed> Connector for PollConnector<F> {
    fn feed(&self) -> FeedType {
        F::FEED
    }

    fn mode(&self) -> DataMode {
        DataMode::Poll
    }

    fn status(&self) -> ConnectionStatus {
        self.inner.core.status()
    }

    fn cache_fresh(&self) -> bool {
        self.inner.core.cache_valid()
    }

    fn consecutive_errors(&self) -> u32 {
        self.inner.core.consecutive_errors()
    }

    fn initialize(&self) {
        PollConnector::initialize(self);
    }

    fn reconnect(&self) {
        PollConnector::reconnect(self);
    }

    fn shutdown(&self) {
        PollConnector::shutdown(self);
    }

    fn subscribe(&self, kind: EventKind, callback: Box<EventCallback>) -> Subscription {
        self.inner.core.bus().subscribe(kind, callback)
    }
}

impl<F: PollFeed> PollInner<F> {
    fn spawn_poll_loop(self: &Arc<Self>) {
        let me = Arc::clone(self);
        let handle = tokio::spawn(async move {
            me.run_poll_loop().await;
        });
        if let Some(old) = lock(&self.tasks).poll.replace(handle) {
            old.abort();
        }
    }

    async fn run_poll_loop(self: Arc<Self>) {
        loop {
            if self.core.is_shut_down() {
                return;
            }
            self.poll_cycle().await;

            let threshold = self.core.config().errors.consecutive_threshold;
            if self.core.consecutive_errors() >= threshold {
                if !self.cooldown().await {
                    return;
                }
                continue;
            }

            // Market state is read fresh every tick; it can change mid-session.
            let interval = if self.clock.is_open() {
                self.core.config().poll.open_interval()
            } else {
                self.core.config().poll.closed_interval()
            };
            tokio::time::sleep(interval).await;
        }
    }

    /// Suspend polling after the error threshold, then restart clean.
    /// Returns false when shut down mid-cooldown.
    async fn cooldown(&self) -> bool {
        let cooldown = self.core.config().errors.cooldown();
        self.cooling.store(true, Ordering::SeqCst);
        self.core.set_status(ConnectionStatus::Disconnected);
        warn!(
            feed = %F::FEED,
            cooldown_secs = cooldown.as_secs(),
            "consecutive fetch failures crossed the threshold; polling suspended"
        );

        tokio::time::sleep(cooldown).await;
        if self.core.is_shut_down() {
            return false;
        }
        self.core.reset_errors();
        self.cooling.store(false, Ordering::SeqCst);
        self.core.set_status(ConnectionStatus::PollMode);
        info!(feed = %F::FEED, "cooldown elapsed; polling resumed");
        true
    }

    /// Cache-first delivery: a valid snapshot is emitted immediately and a
    /// background refresh follows shortly after; without one, the fetch is
    /// awaited before anything is emitted.
    async fn poll_cycle(self: &Arc<Self>) {
        if self.core.cache_valid() {
            if let Some(records) = self.core.cached_records() {
                self.core.emit(F::update_event(records));
            }
            let me = Arc::clone(self);
            let delay = self.core.config().poll.background_refresh_delay();
            let handle = tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if me.core.is_shut_down() {
                    return;
                }
                let _ = Self::refresh_once(&me).await;
            });
            lock(&self.tasks).refresh.replace(handle);
        } else {
            let _ = Self::refresh_once(self).await;
        }
    }

    fn page_request(&self) -> PageRequest {
        let paging = lock(&self.paging);
        PageRequest {
            path: F::endpoint_path(),
            limit: paging.limit,
            offset: paging.offset,
            sort_by: F::sort_by(),
            order: F::sort_order(),
        }
    }

    /// Single-flight fetch: join an in-flight request when one exists,
    /// otherwise own a new one. Only the owner applies the result; a result
    /// arriving after shutdown is discarded. Returns the shared outcome and
    /// whether this caller owned the request.
    async fn refresh_once(self: &Arc<Self>) -> (Result<FetchedPage<F::Record>, FeedError>, bool) {
        let (fut, owner) = {
            let mut slot = lock(&self.inflight);
            match slot.as_ref() {
                Some(existing) => (existing.clone(), false),
                None => {
                    let fut = shared_fetch::<F>(Arc::clone(&self.fetcher), self.page_request());
                    *slot = Some(fut.clone());
                    (fut, true)
                }
            }
        };

        let result = fut.await;

        if owner {
            lock(&self.inflight).take();
            if self.core.is_shut_down() {
                return (result, true);
            }
            match &result {
                Ok(page) => self.apply_page(page),
                Err(e) => {
                    let count = self.core.record_error(e.clone());
                    debug!(feed = %F::FEED, consecutive = count, "snapshot fetch failed");
                }
            }
        }
        (result, owner)
    }

    /// Replace the cached set with the fetched range and fan it out. Cache
    /// write and update event happen in the same synchronous step.
    fn apply_page(&self, page: &FetchedPage<F::Record>) {
        {
            let mut paging = lock(&self.paging);
            paging.total_count = page.total_count;
            paging.has_more = match page.has_next {
                Some(flag) => flag,
                None => page
                    .total_count
                    .is_some_and(|total| (page.records.len() as u64) < total),
            };
        }
        self.core.update_cache(page.records.clone());
        self.core.emit(F::update_event(page.records.clone()));
    }

    async fn load_more(self: &Arc<Self>) -> bool {
        if self.core.is_shut_down() || !self.core.is_initialized() {
            return false;
        }
        if self.cooling.load(Ordering::SeqCst) {
            debug!(feed = %F::FEED, "load-more ignored during error cooldown");
            return false;
        }
        {
            let mut paging = lock(&self.paging);
            if !paging.has_more {
                return false;
            }
            paging.limit += self.core.config().poll.page_size;
        }
        let previous = self.core.cached_records().map_or(0, |records| records.len());

        // Drain any in-flight fetch first, then own one for the grown range.
        loop {
            let (result, owner) = Self::refresh_once(self).await;
            if owner {
                return match result {
                    Ok(page) => page.records.len() > previous,
                    Err(_) => false,
                };
            }
            if self.core.is_shut_down() {
                return false;
            }
            // Let the owner of the drained fetch clear the in-flight slot.
            tokio::task::yield_now().await;
        }
    }

    fn manual_reconnect(self: &Arc<Self>) {
        if self.core.is_shut_down() || !self.core.is_initialized() {
            return;
        }
        if self.core.status() != ConnectionStatus::Disconnected {
            debug!(feed = %F::FEED, status = %self.core.status(), "reconnect ignored; poll connector active");
            return;
        }
        self.cooling.store(false, Ordering::SeqCst);
        self.core.reset_errors();
        self.core.set_status(ConnectionStatus::PollMode);
        self.spawn_poll_loop();
        info!(feed = %F::FEED, "polling restarted");
    }

    fn shutdown(&self) {
        if !self.core.begin_shutdown() {
            return;
        }
        {
            let mut tasks = lock(&self.tasks);
            if let Some(poll) = tasks.poll.take() {
                poll.abort();
            }
            if let Some(refresh) = tasks.refresh.take() {
                refresh.abort();
            }
        }
        lock(&self.inflight).take();
        self.core.finish_shutdown();
        info!(feed = %F::FEED, "poll connector shut down");
    }
}

/// HTTP snapshot fetcher backed by reqwest.
pub struct HttpFetcher {
    client: reqwest::Client,
    base_url: String,
}

impl HttpFetcher {
    pub fn new(base_url: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to create HTTP client");
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl SnapshotFetcher for HttpFetcher {
    async fn fetch_page(&self, request: &PageRequest) -> Result<PageResponse, FeedError> {
        let url = format!("{}/{}/polling", self.base_url, request.path);
        let response = self
            .client
            .get(&url)
            .query(&[
                ("limit", request.limit.to_string()),
                ("offset", request.offset.to_string()),
                ("sort_by", request.sort_by.to_string()),
                ("order", request.order.as_str().to_string()),
            ])
            .send()
            .await
            .map_err(|e| FeedError::Fetch(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FeedError::HttpStatus(status.as_u16()));
        }
        response
            .json::<PageResponse>()
            .await
            .map_err(|e| FeedError::Body(e.to_string()))
    }
}
