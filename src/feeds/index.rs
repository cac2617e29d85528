//! Broad-index feed: streaming equity index quotes

use serde_json::Value;

use super::{number_field, string_field, timestamp_field};
use crate::connector::push::PushFeed;
use crate::types::{FeedEvent, FeedType, IndexQuote};

/// Streaming broad-equity-index feed descriptor.
pub struct IndexFeed;

impl PushFeed for IndexFeed {
    type Record = IndexQuote;

    const FEED: FeedType = FeedType::BroadIndex;

    fn endpoint_path() -> &'static str {
        "indices/stream"
    }

    fn frame_type() -> &'static str {
        "index_update"
    }

    fn heartbeat_frame() -> &'static str {
        r#"{"action":"heartbeat"}"#
    }

    fn normalize(row: &Value) -> Option<IndexQuote> {
        let symbol = string_field(row, "symbol")?;
        let value = number_field(row, "value").or_else(|| number_field(row, "level"))?;
        if !value.is_finite() || value <= 0.0 {
            return None;
        }
        Some(IndexQuote {
            name: string_field(row, "name").unwrap_or_else(|| symbol.clone()),
            symbol,
            value,
            change_pct: number_field(row, "change_pct").unwrap_or(0.0),
            ts: timestamp_field(row, "timestamp"),
        })
    }

    fn update_event(records: Vec<IndexQuote>) -> FeedEvent {
        FeedEvent::IndexUpdate(records)
    }
}
