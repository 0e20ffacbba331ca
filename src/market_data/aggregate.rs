// =============================================================================
// 1-minute → 5-minute candle aggregation
// =============================================================================
//
// Buckets are anchored at the session open (09:15, 09:20, ...). A bucket is
// emitted only once it has closed at `now` and all five of its minutes are
// present, so an aggregated candle never changes after it is stored.
// =============================================================================

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::market_clock::MarketClock;
use crate::types::{Candle, Resolution};

/// Start of the 5-minute bucket containing `ts`.
pub fn bucket_start(market: &MarketClock, ts: DateTime<Utc>) -> DateTime<Utc> {
    let (open, _) = market.session_window(market.local_date(ts));
    let step = Resolution::FiveMinute.duration();
    let n = (ts - open).num_seconds().div_euclid(step.num_seconds());
    open + step * n as i32
}

/// Aggregate ascending 1-minute candles into complete, closed 5-minute
/// candles.
pub fn aggregate_five_minute(
    market: &MarketClock,
    minutes: &[Candle],
    now: DateTime<Utc>,
) -> Vec<Candle> {
    let mut groups: BTreeMap<DateTime<Utc>, Vec<&Candle>> = BTreeMap::new();
    for c in minutes {
        groups.entry(bucket_start(market, c.timestamp)).or_default().push(c);
    }

    let per_bucket = (Resolution::FiveMinute.minutes() / Resolution::OneMinute.minutes()) as usize;

    groups
        .into_iter()
        .filter(|(start, group)| {
            *start + Resolution::FiveMinute.duration() <= now && group.len() == per_bucket
        })
        .map(|(start, group)| {
            let first = group[0];
            let last = group[group.len() - 1];
            Candle {
                timestamp: start,
                open: first.open,
                high: group.iter().map(|c| c.high).fold(f64::NEG_INFINITY, f64::max),
                low: group.iter().map(|c| c.low).fold(f64::INFINITY, f64::min),
                close: last.close,
                volume: group.iter().map(|c| c.volume).sum(),
                open_interest: last.open_interest,
            }
        })
        .collect()
}
