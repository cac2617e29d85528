//! Error taxonomy for the ingestion layer
//!
//! Failures never cross the public boundary as `Err` or panics; they travel
//! inside `error` events on the bus. `FeedError` is `Clone` so one failure
//! can fan out to every subscriber.

use thiserror::Error;

/// Failure classes raised by feed connectors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeedError {
    /// Stream connect failure or mid-stream socket error.
    #[error("stream transport error: {0}")]
    Stream(String),

    /// Keep-alive frame could not be written; the connection is dead.
    #[error("heartbeat send failed: {0}")]
    Heartbeat(String),

    /// Snapshot request failed before any response arrived.
    #[error("snapshot fetch failed: {0}")]
    Fetch(String),

    /// Snapshot endpoint answered outside the 2xx range.
    #[error("snapshot endpoint returned HTTP {0}")]
    HttpStatus(u16),

    /// Response body did not match any accepted shape.
    #[error("malformed snapshot body: {0}")]
    Body(String),
}
