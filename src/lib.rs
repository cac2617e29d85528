//! MarketFeed Library
//!
//! Real-time market-data ingestion layer for the dashboard: per-feed live
//! connectors (push and poll) coordinated by one orchestrator with
//! reconnection policy, cache staleness detection and a typed
//! publish/subscribe bus. In-process library boundary only; consumers
//! subscribe once to the orchestrator and never talk to connectors directly.

pub mod bus;
pub mod config;
pub mod connector;
pub mod error;
pub mod feeds;
pub mod market_hours;
pub mod orchestrator;
pub mod types;

pub use bus::{EventBus, Subscription};
pub use config::ServiceConfig;
pub use error::FeedError;
pub use orchestrator::{FeedHealth, FeedOrchestrator, FeedRuntime};
pub use types::{ConnectionStatus, DataMode, EventKind, FeedEvent, FeedType};
