//! Movers feed: polled top gainers/losers snapshots

use serde_json::Value;

use super::{number_field, string_field, timestamp_field};
use crate::connector::poll::{PollFeed, SortOrder};
use crate::types::{FeedEvent, FeedType, MoveDirection, MoverEntry};

/// Polled top-movers feed descriptor.
pub struct MoversFeed;

impl PollFeed for MoversFeed {
    type Record = MoverEntry;

    const FEED: FeedType = FeedType::Movers;

    fn endpoint_path() -> &'static str {
        "movers"
    }

    fn sort_by() -> &'static str {
        "change_pct"
    }

    fn sort_order() -> SortOrder {
        SortOrder::Desc
    }

    fn normalize(row: &Value) -> Option<MoverEntry> {
        let symbol = string_field(row, "symbol")?;
        let price = number_field(row, "price")?;
        if !price.is_finite() || price <= 0.0 {
            return None;
        }
        let change_pct = number_field(row, "change_pct").unwrap_or(0.0);
        let direction = match string_field(row, "direction").as_deref() {
            Some("up") => MoveDirection::Up,
            Some("down") => MoveDirection::Down,
            // No explicit tag: infer from the sign of the move.
            _ if change_pct < 0.0 => MoveDirection::Down,
            _ => MoveDirection::Up,
        };
        Some(MoverEntry {
            name: string_field(row, "name").unwrap_or_else(|| symbol.clone()),
            symbol,
            price,
            change_pct,
            direction,
            ts: timestamp_field(row, "timestamp"),
        })
    }

    fn update_event(records: Vec<MoverEntry>) -> FeedEvent {
        FeedEvent::MoversUpdate(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_prefers_explicit_tag_over_sign() {
        let row = serde_json::json!({
            "symbol": "ACME",
            "price": 12.5,
            "change_pct": -4.2,
            "direction": "up"
        });
        let entry = MoversFeed::normalize(&row).expect("row should normalize");
        assert_eq!(entry.direction, MoveDirection::Up);
    }

    #[test]
    fn direction_falls_back_to_change_sign() {
        let falling = serde_json::json!({"symbol": "ACME", "price": 12.5, "change_pct": -4.2});
        assert_eq!(
            MoversFeed::normalize(&falling).map(|e| e.direction),
            Some(MoveDirection::Down)
        );

        let rising = serde_json::json!({"symbol": "ACME", "price": 12.5, "change_pct": 4.2});
        assert_eq!(
            MoversFeed::normalize(&rising).map(|e| e.direction),
            Some(MoveDirection::Up)
        );
    }
}
