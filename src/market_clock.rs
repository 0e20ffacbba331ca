// =============================================================================
// Market Clock — session boundaries and trading-day arithmetic
// =============================================================================
//
// Pure calendar logic for a single exchange:
//   - a session runs [open, close] in exchange-local time, Mon–Fri;
//   - a trading day is a weekday that is not in the injected holiday set;
//   - the expected candle grid of a session is every bucket start from `open`
//     up to (but excluding) `close`.
//
// No network access and no hidden "now": callers pass instants in, usually
// from a `Clock`.
// =============================================================================

use std::collections::BTreeSet;

use chrono::{
    DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveTime, Offset, TimeZone, Utc,
    Weekday,
};

use crate::runtime_config::SessionConfig;
use crate::types::Resolution;

/// Upper bound on days walked when searching for a trading day. Only reached
/// with a pathological holiday list.
const MAX_CALENDAR_WALK: usize = 3_660;

#[derive(Debug, Clone)]
pub struct MarketClock {
    open: NaiveTime,
    close: NaiveTime,
    offset: FixedOffset,
    holidays: BTreeSet<NaiveDate>,
}

impl MarketClock {
    pub fn new(
        open: NaiveTime,
        close: NaiveTime,
        offset: FixedOffset,
        holidays: impl IntoIterator<Item = NaiveDate>,
    ) -> Self {
        Self {
            open,
            close,
            offset,
            holidays: holidays.into_iter().collect(),
        }
    }

    /// Build from config. An out-of-range offset falls back to UTC.
    pub fn from_config(cfg: &SessionConfig) -> Self {
        let offset =
            FixedOffset::east_opt(cfg.utc_offset_minutes * 60).unwrap_or_else(|| Utc.fix());
        Self::new(cfg.open, cfg.close, offset, cfg.holidays.iter().copied())
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    /// Exchange-local calendar date of an instant.
    pub fn local_date(&self, at: DateTime<Utc>) -> NaiveDate {
        at.with_timezone(&self.offset).date_naive()
    }

    // -------------------------------------------------------------------------
    // Trading days
    // -------------------------------------------------------------------------

    pub fn is_holiday(&self, date: NaiveDate) -> bool {
        self.holidays.contains(&date)
    }

    pub fn is_trading_day(&self, date: NaiveDate) -> bool {
        !matches!(date.weekday(), Weekday::Sat | Weekday::Sun) && !self.is_holiday(date)
    }

    /// Most recent trading day strictly before `date`.
    pub fn previous_trading_day(&self, date: NaiveDate) -> NaiveDate {
        let mut day = date;
        for _ in 0..MAX_CALENDAR_WALK {
            day = day.pred_opt().unwrap_or(day);
            if self.is_trading_day(day) {
                return day;
            }
        }
        day
    }

    /// Most recent trading day at or before `date`.
    pub fn trading_day_on_or_before(&self, date: NaiveDate) -> NaiveDate {
        if self.is_trading_day(date) {
            date
        } else {
            self.previous_trading_day(date)
        }
    }

    /// The `n` most recent trading days at or before `reference`, oldest
    /// first.
    pub fn last_n_trading_days(&self, reference: NaiveDate, n: usize) -> Vec<NaiveDate> {
        let mut days = Vec::with_capacity(n);
        if n == 0 {
            return days;
        }
        let mut day = self.trading_day_on_or_before(reference);
        days.push(day);
        while days.len() < n {
            day = self.previous_trading_day(day);
            days.push(day);
        }
        days.reverse();
        days
    }

    // -------------------------------------------------------------------------
    // Sessions
    // -------------------------------------------------------------------------

    /// Session open/close of `date` as UTC instants.
    pub fn session_window(&self, date: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
        (self.to_utc(date, self.open), self.to_utc(date, self.close))
    }

    pub fn is_session_open(&self, now: DateTime<Utc>) -> bool {
        let local = now.with_timezone(&self.offset);
        if !self.is_trading_day(local.date_naive()) {
            return false;
        }
        let t = local.time();
        t >= self.open && t <= self.close
    }

    /// The session whose data counts as "current" at `now`: today once its
    /// session has started, otherwise the most recent earlier trading day.
    pub fn current_or_last_session(&self, now: DateTime<Utc>) -> NaiveDate {
        let local = now.with_timezone(&self.offset);
        let today = local.date_naive();
        if self.is_trading_day(today) && local.time() >= self.open {
            today
        } else {
            self.previous_trading_day(today)
        }
    }

    /// Expected bucket starts for a session at `resolution`, ascending.
    /// Empty for non-trading days.
    pub fn session_grid(&self, date: NaiveDate, resolution: Resolution) -> Vec<DateTime<Utc>> {
        if !self.is_trading_day(date) {
            return Vec::new();
        }
        let (start, end) = self.session_window(date);
        let step = resolution.duration();
        let mut grid = Vec::new();
        let mut ts = start;
        while ts < end {
            grid.push(ts);
            ts += step;
        }
        grid
    }

    /// First bucket boundary strictly after `now`, aligned to the session
    /// open so that 5-minute buckets line up with 09:15.
    pub fn next_bucket_boundary(&self, now: DateTime<Utc>, resolution: Resolution) -> DateTime<Utc> {
        let date = self.local_date(now);
        let (anchor, _) = self.session_window(date);
        let step = resolution.duration().num_seconds();
        let elapsed = (now - anchor).num_seconds();
        let buckets = elapsed.div_euclid(step) + 1;
        anchor + Duration::seconds(buckets * step)
    }

    fn to_utc(&self, date: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
        let naive = date.and_time(time);
        // A fixed offset has no gaps or folds, so the mapping is unique.
        self.offset
            .from_local_datetime(&naive)
            .single()
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|| Utc.from_utc_datetime(&naive))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn nse(holidays: Vec<NaiveDate>) -> MarketClock {
        MarketClock::from_config(&SessionConfig {
            holidays,
            ..SessionConfig::default()
        })
    }

    #[test]
    fn session_window_converts_ist_to_utc() {
        let clock = nse(vec![]);
        let (open, close) = clock.session_window(d(2025, 1, 15));
        assert_eq!(open, Utc.with_ymd_and_hms(2025, 1, 15, 3, 45, 0).unwrap());
        assert_eq!(close, Utc.with_ymd_and_hms(2025, 1, 15, 10, 0, 0).unwrap());
    }

    #[test]
    fn session_open_boundaries() {
        let clock = nse(vec![]);
        // Wednesday 2025-01-15.
        let at = |h, m| Utc.with_ymd_and_hms(2025, 1, 15, h, m, 0).unwrap();
        assert!(!clock.is_session_open(at(3, 44)));
        assert!(clock.is_session_open(at(3, 45)));
        assert!(clock.is_session_open(at(7, 0)));
        assert!(clock.is_session_open(at(10, 0)));
        assert!(!clock.is_session_open(at(10, 1)));
    }

    #[test]
    fn session_closed_on_weekends_and_holidays() {
        let clock = nse(vec![d(2025, 1, 14)]);
        // Saturday 2025-01-18, 11:00 IST.
        assert!(!clock.is_session_open(Utc.with_ymd_and_hms(2025, 1, 18, 5, 30, 0).unwrap()));
        // Holiday Tuesday 2025-01-14, 11:00 IST.
        assert!(!clock.is_session_open(Utc.with_ymd_and_hms(2025, 1, 14, 5, 30, 0).unwrap()));
    }

    #[test]
    fn last_n_trading_days_skips_weekend_and_holiday() {
        let clock = nse(vec![d(2025, 1, 13)]);
        // Reference Wednesday 2025-01-15; Monday the 13th is a holiday.
        let days = clock.last_n_trading_days(d(2025, 1, 15), 4);
        assert_eq!(
            days,
            vec![d(2025, 1, 9), d(2025, 1, 10), d(2025, 1, 14), d(2025, 1, 15)]
        );
    }

    #[test]
    fn last_n_trading_days_from_a_sunday() {
        let clock = nse(vec![]);
        let days = clock.last_n_trading_days(d(2025, 1, 19), 1);
        assert_eq!(days, vec![d(2025, 1, 17)]);
        assert!(clock.last_n_trading_days(d(2025, 1, 19), 0).is_empty());
    }

    #[test]
    fn current_or_last_session_falls_back_before_open() {
        let clock = nse(vec![]);
        // Wednesday 08:00 IST — session not started, use Tuesday.
        let before_open = Utc.with_ymd_and_hms(2025, 1, 15, 2, 30, 0).unwrap();
        assert_eq!(clock.current_or_last_session(before_open), d(2025, 1, 14));
        // Wednesday 17:00 IST — today's session has completed.
        let after_close = Utc.with_ymd_and_hms(2025, 1, 15, 11, 30, 0).unwrap();
        assert_eq!(clock.current_or_last_session(after_close), d(2025, 1, 15));
        // Monday 08:00 IST — walk back over the weekend.
        let monday = Utc.with_ymd_and_hms(2025, 1, 20, 2, 30, 0).unwrap();
        assert_eq!(clock.current_or_last_session(monday), d(2025, 1, 17));
    }

    #[test]
    fn session_grid_sizes() {
        let clock = nse(vec![]);
        let one = clock.session_grid(d(2025, 1, 15), Resolution::OneMinute);
        assert_eq!(one.len(), 375);
        let five = clock.session_grid(d(2025, 1, 15), Resolution::FiveMinute);
        assert_eq!(five.len(), 75);
        assert_eq!(
            *five.last().unwrap(),
            Utc.with_ymd_and_hms(2025, 1, 15, 9, 55, 0).unwrap()
        );
        assert!(clock.session_grid(d(2025, 1, 18), Resolution::OneMinute).is_empty());
    }

    #[test]
    fn next_bucket_boundary_aligns_to_session_open() {
        let clock = nse(vec![]);
        // 09:17:30 IST -> next 5m boundary is 09:20 IST.
        let now = Utc.with_ymd_and_hms(2025, 1, 15, 3, 47, 30).unwrap();
        assert_eq!(
            clock.next_bucket_boundary(now, Resolution::FiveMinute),
            Utc.with_ymd_and_hms(2025, 1, 15, 3, 50, 0).unwrap()
        );
        // Exactly on a boundary moves to the following one.
        let on = Utc.with_ymd_and_hms(2025, 1, 15, 3, 50, 0).unwrap();
        assert_eq!(
            clock.next_bucket_boundary(on, Resolution::FiveMinute),
            Utc.with_ymd_and_hms(2025, 1, 15, 3, 55, 0).unwrap()
        );
    }

    proptest! {
        #[test]
        fn last_n_trading_days_is_exact_ascending_and_clean(
            offset_days in 0i64..2_000,
            n in 1usize..40,
            holiday_offsets in proptest::collection::vec(0i64..60, 0..10),
        ) {
            let reference = d(2020, 1, 1) + Duration::days(offset_days);
            let holidays: Vec<NaiveDate> = holiday_offsets
                .iter()
                .map(|o| reference - Duration::days(*o))
                .collect();
            let clock = nse(holidays.clone());
            let days = clock.last_n_trading_days(reference, n);

            prop_assert_eq!(days.len(), n);
            prop_assert!(days.windows(2).all(|w| w[0] < w[1]));
            for day in &days {
                prop_assert!(!matches!(day.weekday(), Weekday::Sat | Weekday::Sun));
                prop_assert!(!holidays.contains(day));
                prop_assert!(*day <= reference);
            }
        }
    }
}
