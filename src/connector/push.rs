//! Push connector
//!
//! Maintains a persistent streaming connection per feed, heartbeats it and
//! reconnects with exponential backoff on loss. At most one reconnect timer
//! is ever pending; once the attempt budget is exhausted the connector stays
//! disconnected until an external `reconnect()`.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use super::{lock, Connector, ConnectorCore};
use crate::bus::{EventCallback, Subscription};
use crate::config::ServiceConfig;
use crate::error::FeedError;
use crate::types::{ConnectionStatus, DataMode, EventKind, FeedEvent, FeedType};

/// Write half of a streaming connection.
#[async_trait]
pub trait FrameSink: Send {
    async fn send_text(&mut self, frame: &str) -> Result<(), FeedError>;
    async fn close(&mut self);
}

/// Read half of a streaming connection. `None` means the stream closed.
#[async_trait]
pub trait FrameSource: Send {
    async fn next_frame(&mut self) -> Option<Result<String, FeedError>>;
}

/// Opens streaming connections. The production implementation speaks
/// WebSocket; tests substitute scripted transports.
#[async_trait]
pub trait StreamTransport: Send + Sync {
    async fn connect(
        &self,
        url: &str,
    ) -> Result<(Box<dyn FrameSink>, Box<dyn FrameSource>), FeedError>;
}

/// Static description of one push feed: where it streams, which frame type
/// it owns and how its rows normalize.
pub trait PushFeed: Send + Sync + 'static {
    type Record: Clone + Send + Sync + 'static;

    const FEED: FeedType;

    fn endpoint_path() -> &'static str;
    /// Frame type tag this connector consumes as its own updates.
    fn frame_type() -> &'static str;
    /// Keep-alive frame sent on the heartbeat timer.
    fn heartbeat_frame() -> &'static str;
    fn normalize(row: &serde_json::Value) -> Option<Self::Record>;
    fn update_event(records: Vec<Self::Record>) -> FeedEvent;
}

/// Incoming wire frame shape shared by all push feeds.
#[derive(Debug, Deserialize)]
struct StreamFrame {
    #[serde(rename = "type")]
    frame_type: Option<String>,
    #[serde(default)]
    data: Vec<serde_json::Value>,
}

/// Backoff delay for the n-th scheduled reconnect: `min(base * 2^n, cap)`.
fn reconnect_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
    base.checked_mul(factor).map_or(cap, |delay| delay.min(cap))
}

/// A connection that died within the spacing window of opening is flapping;
/// its automatic reconnect is dropped rather than queued.
fn should_drop_reconnect(last_open: Option<Instant>, min_spacing: Duration) -> bool {
    last_open.is_some_and(|opened| opened.elapsed() < min_spacing)
}

#[derive(Default)]
struct RetryState {
    /// Reconnects scheduled since the last successful open.
    attempts: u32,
    /// When the current/most recent connection was established.
    last_open: Option<Instant>,
}

#[derive(Default)]
struct PushTasks {
    session: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
}

struct PushInner<F: PushFeed> {
    core: ConnectorCore<F::Record>,
    transport: Arc<dyn StreamTransport>,
    url: String,
    retry: Mutex<RetryState>,
    tasks: Mutex<PushTasks>,
}

/// Streaming feed connector (crypto / broad-index).
pub struct PushConnector<F: PushFeed> {
    inner: Arc<PushInner<F>>,
}

impl<F: PushFeed> Clone for PushConnector<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: PushFeed> PushConnector<F> {
    pub fn new(config: Arc<ServiceConfig>, transport: Arc<dyn StreamTransport>) -> Self {
        let url = format!(
            "{}/{}",
            config.endpoints.stream_base.trim_end_matches('/'),
            F::endpoint_path()
        );
        Self {
            inner: Arc::new(PushInner {
                core: ConnectorCore::new(F::FEED, DataMode::Push, config),
                transport,
                url,
                retry: Mutex::new(RetryState::default()),
                tasks: Mutex::new(PushTasks::default()),
            }),
        }
    }

    /// Start the connection lifecycle. Safe to call twice; a no-op once shut
    /// down.
    pub fn initialize(&self) {
        if !self.inner.core.mark_initialized() {
            return;
        }
        PushInner::spawn_session(&self.inner);
    }

    /// Externally requested reconnect: resets the attempt budget and starts
    /// a fresh cycle. Ignored while the connector is already active.
    pub fn reconnect(&self) {
        PushInner::manual_reconnect(&self.inner);
    }

    /// Tear down the connector: cancel the session and any pending reconnect
    /// timer, clear cache and subscriptions. One-way and idempotent.
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
}

impl<F: PushFeed> Connector for PushConnector<F> {
    fn feed(&self) -> FeedType {
        F::FEED
    }

    fn mode(&self) -> DataMode {
        DataMode::Push
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
        PushConnector::initialize(self);
    }

    fn reconnect(&self) {
        PushConnector::reconnect(self);
    }

    fn shutdown(&self) {
        PushConnector::shutdown(self);
    }

    fn subscribe(&self, kind: EventKind, callback: Box<EventCallback>) -> Subscription {
        self.inner.core.bus().subscribe(kind, callback)
    }
}

impl<F: PushFeed> PushInner<F> {
    fn spawn_session(self: &Arc<Self>) {
        self.core.set_status(ConnectionStatus::Connecting);
        let me = Arc::clone(self);
        let handle = tokio::spawn(async move {
            me.run_session().await;
        });
        let mut tasks = lock(&self.tasks);
        if let Some(old) = tasks.session.replace(handle) {
            old.abort();
        }
    }

    async fn run_session(self: Arc<Self>) {
        info!(feed = %F::FEED, url = %self.url, "connecting stream");
        let (mut sink, mut source) = match self.transport.connect(&self.url).await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(feed = %F::FEED, error = %e, "stream connect failed");
                self.core.record_error(e);
                if self.core.is_shut_down() {
                    return;
                }
                self.core.set_status(ConnectionStatus::Disconnected);
                self.schedule_reconnect();
                return;
            }
        };

        {
            let mut retry = lock(&self.retry);
            retry.attempts = 0;
            retry.last_open = Some(Instant::now());
        }
        self.core.set_status(ConnectionStatus::Connected);
        info!(feed = %F::FEED, "stream connected");

        let heartbeat_every = self.core.config().stream.heartbeat_interval();
        let mut heartbeat =
            tokio::time::interval_at(Instant::now() + heartbeat_every, heartbeat_every);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    if let Err(e) = sink.send_text(F::heartbeat_frame()).await {
                        warn!(feed = %F::FEED, error = %e, "heartbeat send failed; connection is dead");
                        self.core.record_error(FeedError::Heartbeat(e.to_string()));
                        break;
                    }
                }
                frame = source.next_frame() => {
                    match frame {
                        Some(Ok(text)) => self.handle_frame(&text),
                        Some(Err(e)) => {
                            error!(feed = %F::FEED, error = %e, "stream error");
                            self.core.record_error(e);
                            break;
                        }
                        None => {
                            info!(feed = %F::FEED, "stream closed by server");
                            break;
                        }
                    }
                }
            }
        }

        sink.close().await;
        if self.core.is_shut_down() {
            return;
        }
        self.core.set_status(ConnectionStatus::Disconnected);
        self.schedule_reconnect();
    }

    /// Parse one incoming frame. Own-type data frames land in the cache and
    /// fan out as an update event in the same synchronous step; control
    /// frames are consumed silently; anything else is dropped with a log,
    /// never an error.
    fn handle_frame(&self, text: &str) {
        let frame: StreamFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(feed = %F::FEED, error = %e, "dropping malformed frame");
                return;
            }
        };

        match frame.frame_type.as_deref() {
            Some(tag) if tag == F::frame_type() => {
                let records: Vec<F::Record> = frame.data.iter().filter_map(F::normalize).collect();
                if records.is_empty() {
                    debug!(feed = %F::FEED, "update frame carried no usable rows");
                    return;
                }
                self.core.update_cache(records.clone());
                self.core.emit(F::update_event(records));
            }
            Some("heartbeat_ack") | Some("status") => {}
            other => {
                debug!(feed = %F::FEED, frame_type = ?other, "dropping unrecognized frame");
            }
        }
    }

    /// Arm the single reconnect timer, honoring the attempt budget, the
    /// flap-spacing window and the one-timer invariant.
    fn schedule_reconnect(self: &Arc<Self>) {
        if self.core.is_shut_down() {
            return;
        }
        match self.core.status() {
            ConnectionStatus::Connecting
            | ConnectionStatus::Connected
            | ConnectionStatus::Reconnecting => return,
            _ => {}
        }

        let stream_cfg = &self.core.config().stream;
        let delay = {
            let mut retry = lock(&self.retry);
            if retry.attempts >= stream_cfg.max_reconnect_attempts {
                warn!(
                    feed = %F::FEED,
                    attempts = retry.attempts,
                    "reconnect attempts exhausted; staying disconnected until an explicit reconnect"
                );
                return;
            }
            if should_drop_reconnect(retry.last_open, stream_cfg.min_reconnect_spacing()) {
                debug!(feed = %F::FEED, "connection flapped; dropping automatic reconnect");
                return;
            }
            let delay = reconnect_delay(
                retry.attempts,
                stream_cfg.base_reconnect_delay(),
                stream_cfg.max_reconnect_delay(),
            );
            retry.attempts += 1;
            delay
        };

        self.core.set_status(ConnectionStatus::Reconnecting);
        info!(feed = %F::FEED, delay_ms = delay.as_millis() as u64, "reconnect scheduled");

        let me = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if me.core.is_shut_down() {
                return;
            }
            me.spawn_session();
        });
        if let Some(old) = lock(&self.tasks).reconnect.replace(handle) {
            // Status guards make a second live timer impossible; the slot
            // only ever holds a finished one here.
            old.abort();
        }
    }

    fn manual_reconnect(self: &Arc<Self>) {
        if self.core.is_shut_down() || !self.core.is_initialized() {
            return;
        }
        match self.core.status() {
            ConnectionStatus::Connecting
            | ConnectionStatus::Connected
            | ConnectionStatus::Reconnecting => {
                debug!(feed = %F::FEED, status = %self.core.status(), "reconnect ignored; connector already active");
                return;
            }
            _ => {}
        }
        {
            let mut retry = lock(&self.retry);
            retry.attempts = 0;
            retry.last_open = None;
        }
        self.spawn_session();
    }

    fn shutdown(&self) {
        if !self.core.begin_shutdown() {
            return;
        }
        {
            let mut tasks = lock(&self.tasks);
            if let Some(session) = tasks.session.take() {
                session.abort();
            }
            if let Some(timer) = tasks.reconnect.take() {
                timer.abort();
            }
        }
        self.core.finish_shutdown();
        info!(feed = %F::FEED, "push connector shut down");
    }
}

/// WebSocket transport backed by tokio-tungstenite.
pub struct WsTransport;

#[async_trait]
impl StreamTransport for WsTransport {
    async fn connect(
        &self,
        url: &str,
    ) -> Result<(Box<dyn FrameSink>, Box<dyn FrameSource>), FeedError> {
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| FeedError::Stream(e.to_string()))?;
        let (write, read) = ws_stream.split();
        Ok((Box::new(WsSink { write }), Box::new(WsSource { read })))
    }
}

struct WsSink {
    write: SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send_text(&mut self, frame: &str) -> Result<(), FeedError> {
        self.write
            .send(Message::Text(frame.to_string()))
            .await
            .map_err(|e| FeedError::Stream(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.write.send(Message::Close(None)).await;
    }
}

struct WsSource {
    read: SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>,
}

#[async_trait]
impl FrameSource for WsSource {
    async fn next_frame(&mut self) -> Option<Result<String, FeedError>> {
        while let Some(message) = self.read.next().await {
            match message {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Close(_)) => return None,
                Ok(_) => continue,
                Err(e) => return Some(Err(FeedError::Stream(e.to_string()))),
            }
        }
        None
    }
}
