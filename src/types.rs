//! Core domain types shared across the ingestion layer

use serde::Serialize;

use crate::error::FeedError;

/// Logical real-time data source handled by one connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedType {
    /// Spot crypto quotes (streaming).
    Crypto,
    /// Broad equity index quotes (streaming).
    BroadIndex,
    /// Fund NAV snapshots (polled).
    Fund,
    /// Top gainers/losers snapshots (polled).
    Movers,
}

impl FeedType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedType::Crypto => "crypto",
            FeedType::BroadIndex => "broad_index",
            FeedType::Fund => "fund",
            FeedType::Movers => "movers",
        }
    }

    /// Delivery mode is fixed per feed for the process lifetime.
    pub fn data_mode(&self) -> DataMode {
        match self {
            FeedType::Crypto | FeedType::BroadIndex => DataMode::Push,
            FeedType::Fund | FeedType::Movers => DataMode::Poll,
        }
    }
}

impl std::fmt::Display for FeedType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery mode of a connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DataMode {
    Push,
    Poll,
}

impl std::fmt::Display for DataMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            DataMode::Push => "push",
            DataMode::Poll => "poll",
        })
    }
}

/// Connection lifecycle state. Exactly one value per connector at any
/// instant; push connectors never report `PollMode` and poll connectors use
/// `PollMode` as their active state instead of `Connected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    PollMode,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Reconnecting => "reconnecting",
            ConnectionStatus::PollMode => "poll_mode",
        }
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized crypto quote.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CryptoQuote {
    pub symbol: String,
    pub name: String,
    pub price_usd: f64,
    pub change_pct_24h: f64,
    pub volume_24h: f64,
    /// Epoch milliseconds.
    pub ts: i64,
}

/// Normalized broad-index quote.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexQuote {
    pub symbol: String,
    pub name: String,
    pub value: f64,
    pub change_pct: f64,
    pub ts: i64,
}

/// Normalized fund NAV row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FundQuote {
    pub fund_id: String,
    pub name: String,
    pub nav: f64,
    pub change_pct: f64,
    pub currency: String,
    pub ts: i64,
}

/// Direction of a market mover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MoveDirection {
    Up,
    Down,
}

/// Normalized top-mover row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MoverEntry {
    pub symbol: String,
    pub name: String,
    pub price: f64,
    pub change_pct: f64,
    pub direction: MoveDirection,
    pub ts: i64,
}

/// Event name key of the subscription registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    CryptoUpdate,
    IndexUpdate,
    FundUpdate,
    MoversUpdate,
    ConnectionChange,
    Error,
    MarketStatusChange,
    BackgroundLoadingStart,
    BackgroundLoadingComplete,
    BackgroundLoadingProgress,
}

impl EventKind {
    pub const ALL: [EventKind; 10] = [
        EventKind::CryptoUpdate,
        EventKind::IndexUpdate,
        EventKind::FundUpdate,
        EventKind::MoversUpdate,
        EventKind::ConnectionChange,
        EventKind::Error,
        EventKind::MarketStatusChange,
        EventKind::BackgroundLoadingStart,
        EventKind::BackgroundLoadingComplete,
        EventKind::BackgroundLoadingProgress,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::CryptoUpdate => "crypto_update",
            EventKind::IndexUpdate => "index_update",
            EventKind::FundUpdate => "fund_update",
            EventKind::MoversUpdate => "movers_update",
            EventKind::ConnectionChange => "connection_change",
            EventKind::Error => "error",
            EventKind::MarketStatusChange => "market_status_change",
            EventKind::BackgroundLoadingStart => "background_loading_start",
            EventKind::BackgroundLoadingComplete => "background_loading_complete",
            EventKind::BackgroundLoadingProgress => "background_loading_progress",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection status transition payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionChange {
    pub feed: FeedType,
    pub status: ConnectionStatus,
    pub mode: DataMode,
}

/// Error event payload, tagged with the originating feed.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedErrorEvent {
    pub feed: FeedType,
    pub error: FeedError,
}

/// Market open/closed flip payload.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MarketStatusChange {
    pub open: bool,
    /// Epoch milliseconds at which the flip was observed.
    pub ts: i64,
}

/// Typed event fanned out by connectors and the orchestrator. The variant
/// carries the full payload so subscribers never rely on runtime shape
/// assumptions.
#[derive(Debug, Clone)]
pub enum FeedEvent {
    CryptoUpdate(Vec<CryptoQuote>),
    IndexUpdate(Vec<IndexQuote>),
    FundUpdate(Vec<FundQuote>),
    MoversUpdate(Vec<MoverEntry>),
    ConnectionChange(ConnectionChange),
    Error(FeedErrorEvent),
    MarketStatusChange(MarketStatusChange),
    BackgroundLoadingStart { total: usize },
    BackgroundLoadingComplete { feed: FeedType },
    BackgroundLoadingProgress { completed: usize, total: usize },
}

impl FeedEvent {
    /// Registry key this event is delivered under.
    pub fn kind(&self) -> EventKind {
        match self {
            FeedEvent::CryptoUpdate(_) => EventKind::CryptoUpdate,
            FeedEvent::IndexUpdate(_) => EventKind::IndexUpdate,
            FeedEvent::FundUpdate(_) => EventKind::FundUpdate,
            FeedEvent::MoversUpdate(_) => EventKind::MoversUpdate,
            FeedEvent::ConnectionChange(_) => EventKind::ConnectionChange,
            FeedEvent::Error(_) => EventKind::Error,
            FeedEvent::MarketStatusChange(_) => EventKind::MarketStatusChange,
            FeedEvent::BackgroundLoadingStart { .. } => EventKind::BackgroundLoadingStart,
            FeedEvent::BackgroundLoadingComplete { .. } => EventKind::BackgroundLoadingComplete,
            FeedEvent::BackgroundLoadingProgress { .. } => EventKind::BackgroundLoadingProgress,
        }
    }

    /// Originating feed, where the event has one.
    pub fn feed(&self) -> Option<FeedType> {
        match self {
            FeedEvent::CryptoUpdate(_) => Some(FeedType::Crypto),
            FeedEvent::IndexUpdate(_) => Some(FeedType::BroadIndex),
            FeedEvent::FundUpdate(_) => Some(FeedType::Fund),
            FeedEvent::MoversUpdate(_) => Some(FeedType::Movers),
            FeedEvent::ConnectionChange(change) => Some(change.feed),
            FeedEvent::Error(event) => Some(event.feed),
            FeedEvent::BackgroundLoadingComplete { feed } => Some(*feed),
            _ => None,
        }
    }
}
