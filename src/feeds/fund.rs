//! Fund feed: polled NAV snapshots

use serde_json::Value;

use super::{number_field, string_field, timestamp_field};
use crate::connector::poll::{PollFeed, SortOrder};
use crate::types::{FeedEvent, FeedType, FundQuote};

/// Polled fund NAV feed descriptor.
pub struct FundFeed;

impl PollFeed for FundFeed {
    type Record = FundQuote;

    const FEED: FeedType = FeedType::Fund;

    fn endpoint_path() -> &'static str {
        "funds"
    }

    fn sort_by() -> &'static str {
        "name"
    }

    fn sort_order() -> SortOrder {
        SortOrder::Asc
    }

    fn normalize(row: &Value) -> Option<FundQuote> {
        let fund_id = string_field(row, "fund_id").or_else(|| string_field(row, "id"))?;
        let nav = number_field(row, "nav")?;
        if !nav.is_finite() || nav <= 0.0 {
            return None;
        }
        Some(FundQuote {
            name: string_field(row, "name").unwrap_or_else(|| fund_id.clone()),
            fund_id,
            nav,
            change_pct: number_field(row, "change_pct").unwrap_or(0.0),
            currency: string_field(row, "currency").unwrap_or_else(|| "USD".to_string()),
            ts: timestamp_field(row, "timestamp"),
        })
    }

    fn update_event(records: Vec<FundQuote>) -> FeedEvent {
        FeedEvent::FundUpdate(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_defaults_currency_and_accepts_id_alias() {
        let row = serde_json::json!({
            "id": "VTSAX",
            "name": "Total Stock Market",
            "nav": "131.72",
            "change_pct": 0.45
        });

        let quote = FundFeed::normalize(&row).expect("row should normalize");
        assert_eq!(quote.fund_id, "VTSAX");
        assert_eq!(quote.nav, 131.72);
        assert_eq!(quote.currency, "USD");
    }

    #[test]
    fn rows_without_nav_are_dropped() {
        assert!(FundFeed::normalize(&serde_json::json!({"fund_id": "X"})).is_none());
        assert!(
            FundFeed::normalize(&serde_json::json!({"fund_id": "X", "nav": -3.0})).is_none()
        );
    }
}
