//! Feed descriptors (crypto, broad-index, fund, movers)
//!
//! Each feed names its endpoint, the wire shape it owns and how raw rows
//! normalize into domain records. Unparseable rows are dropped, never raised
//! as errors.

pub mod crypto;
pub mod fund;
pub mod index;
pub mod movers;

pub use crypto::CryptoFeed;
pub use fund::FundFeed;
pub use index::IndexFeed;
pub use movers::MoversFeed;

use chrono::{DateTime, Utc};
use serde_json::Value;

/// Numeric field that may arrive as a JSON number or a numeric string.
pub(crate) fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub(crate) fn number_field(row: &Value, key: &str) -> Option<f64> {
    row.get(key).and_then(number)
}

pub(crate) fn string_field(row: &Value, key: &str) -> Option<String> {
    row.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Timestamp that may arrive as epoch seconds/milliseconds or ISO8601.
pub(crate) fn epoch_millis(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => {
            let ts = n.as_i64()?;
            // Values below the year-2001 millisecond range are seconds.
            if ts > 0 && ts < 1_000_000_000_000 {
                Some(ts.saturating_mul(1000))
            } else {
                Some(ts)
            }
        }
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.timestamp_millis()),
        _ => None,
    }
}

pub(crate) fn timestamp_field(row: &Value, key: &str) -> i64 {
    row.get(key)
        .and_then(epoch_millis)
        .unwrap_or_else(|| Utc::now().timestamp_millis())
}
