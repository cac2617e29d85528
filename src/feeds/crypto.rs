//! Crypto feed: streaming spot quotes

use serde_json::Value;

use super::{number_field, string_field, timestamp_field};
use crate::connector::push::PushFeed;
use crate::types::{CryptoQuote, FeedEvent, FeedType};

/// Streaming crypto quote feed descriptor.
pub struct CryptoFeed;

impl PushFeed for CryptoFeed {
    type Record = CryptoQuote;

    const FEED: FeedType = FeedType::Crypto;

    fn endpoint_path() -> &'static str {
        "crypto/stream"
    }

    fn frame_type() -> &'static str {
        "crypto_update"
    }

    fn heartbeat_frame() -> &'static str {
        r#"{"type":"ping"}"#
    }

    fn normalize(row: &Value) -> Option<CryptoQuote> {
        let symbol = string_field(row, "symbol")?;
        let price_usd = number_field(row, "price_usd").or_else(|| number_field(row, "price"))?;
        if !price_usd.is_finite() || price_usd <= 0.0 {
            return None;
        }
        Some(CryptoQuote {
            name: string_field(row, "name").unwrap_or_else(|| symbol.clone()),
            symbol,
            price_usd,
            change_pct_24h: number_field(row, "change_pct_24h").unwrap_or(0.0),
            volume_24h: number_field(row, "volume_24h").unwrap_or(0.0),
            ts: timestamp_field(row, "timestamp"),
        })
    }

    fn update_event(records: Vec<CryptoQuote>) -> FeedEvent {
        FeedEvent::CryptoUpdate(records)
    }
}
