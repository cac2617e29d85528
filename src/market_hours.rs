//! Market-hours oracle
//!
//! External collaborator consumed by the poll connectors and the
//! orchestrator's market watch; only the trait boundary is owned here.

use std::time::Duration;

use chrono::{DateTime, Datelike, NaiveTime, TimeDelta, Timelike, Utc, Weekday};

/// Reports whether the market is open and how long until the next
/// open/closed transition.
#[cfg_attr(test, mockall::automock)]
pub trait MarketClock: Send + Sync {
    fn is_open(&self) -> bool;
    fn until_next_transition(&self) -> Duration;
}

/// Weekday session calendar with a fixed UTC trading window.
#[derive(Debug, Clone)]
pub struct SessionCalendar {
    open: NaiveTime,
    close: NaiveTime,
}

impl SessionCalendar {
    pub fn new(open: NaiveTime, close: NaiveTime) -> Self {
        Self { open, close }
    }

    /// Regular US equity session expressed in UTC (14:30-21:00).
    pub fn us_equities() -> Self {
        let open = NaiveTime::from_hms_opt(14, 30, 0).unwrap_or(NaiveTime::MIN);
        let close = NaiveTime::from_hms_opt(21, 0, 0).unwrap_or(NaiveTime::MIN);
        Self::new(open, close)
    }

    fn is_trading_day(weekday: Weekday) -> bool {
        !matches!(weekday, Weekday::Sat | Weekday::Sun)
    }

    /// Whether `at` falls inside the trading window.
    pub fn session_contains(&self, at: DateTime<Utc>) -> bool {
        if !Self::is_trading_day(at.weekday()) {
            return false;
        }
        let time = at.time();
        time >= self.open && time < self.close
    }

    /// Next open or close boundary strictly after `at`.
    pub fn next_transition_after(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        if self.session_contains(at) {
            // Close later today.
            let close_today = at
                .with_hour(self.close.hour())
                .and_then(|t| t.with_minute(self.close.minute()))
                .and_then(|t| t.with_second(self.close.second()))
                .and_then(|t| t.with_nanosecond(0));
            if let Some(close) = close_today {
                return close;
            }
        }

        // Next trading-day open, scanning at most a week ahead.
        let mut day = at.date_naive();
        for _ in 0..7 {
            if Self::is_trading_day(day.weekday()) {
                let open = day.and_time(self.open).and_utc();
                if open > at {
                    return open;
                }
            }
            day += TimeDelta::days(1);
        }
        at + TimeDelta::days(1)
    }
}

impl MarketClock for SessionCalendar {
    fn is_open(&self) -> bool {
        self.session_contains(Utc::now())
    }

    fn until_next_transition(&self) -> Duration {
        let now = Utc::now();
        let next = self.next_transition_after(now);
        (next - now).to_std().unwrap_or(Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).single().unwrap()
    }

    #[test]
    fn weekday_session_window() {
        let calendar = SessionCalendar::us_equities();
        // Wednesday 2024-03-06
        assert!(calendar.session_contains(at(2024, 3, 6, 15, 0)));
        assert!(!calendar.session_contains(at(2024, 3, 6, 13, 0)));
        assert!(!calendar.session_contains(at(2024, 3, 6, 21, 0)));
    }

    #[test]
    fn weekend_is_closed() {
        let calendar = SessionCalendar::us_equities();
        // Saturday 2024-03-09
        assert!(!calendar.session_contains(at(2024, 3, 9, 15, 0)));
    }

    #[test]
    fn transition_from_open_is_todays_close() {
        let calendar = SessionCalendar::us_equities();
        let next = calendar.next_transition_after(at(2024, 3, 6, 15, 0));
        assert_eq!(next, at(2024, 3, 6, 21, 0));
    }

    #[test]
    fn transition_over_weekend_lands_on_monday_open() {
        let calendar = SessionCalendar::us_equities();
        // Friday after close -> Monday open
        let next = calendar.next_transition_after(at(2024, 3, 8, 22, 0));
        assert_eq!(next, at(2024, 3, 11, 14, 30));
    }
}
