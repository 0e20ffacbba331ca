// =============================================================================
// Monitor-facing views of an indicator cache
// =============================================================================

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::indicators::{Crossover, IndicatorCache, Trend};

/// Lifecycle of a monitored symbol.
///
///   Idle → Fetching → Cached → Expired → Fetching ...
///
/// Stopping or switching symbols returns a symbol to `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorState {
    Idle,
    Fetching,
    Cached,
    Expired,
}

/// What callers see of a cached indicator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndicatorSnapshot {
    pub symbol: String,
    pub period: usize,
    pub value: Option<f64>,
    /// When the value was last (re)computed.
    pub as_of: DateTime<Utc>,
    pub last_candle_at: Option<DateTime<Utc>>,
    pub last_close: Option<f64>,
    pub trend: Trend,
    pub crossover: Crossover,
    /// Older than the TTL, or the last refresh failed.
    pub stale: bool,
}

impl IndicatorSnapshot {
    pub fn from_cache(cache: &IndicatorCache, now: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            symbol: cache.symbol.clone(),
            period: cache.period,
            value: cache.current_value,
            as_of: cache.computed_at,
            last_candle_at: cache.last_candle.as_ref().map(|c| c.timestamp),
            last_close: cache.last_candle.as_ref().and_then(|c| c.valid_close()),
            trend: cache.trend,
            crossover: cache.last_crossover,
            stale: cache.degraded || is_expired(cache, now, ttl),
        }
    }
}

pub fn is_expired(cache: &IndicatorCache, now: DateTime<Utc>, ttl: Duration) -> bool {
    now - cache.computed_at > ttl
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::IndicatorEngine;
    use crate::types::Candle;
    use chrono::TimeZone;

    fn cache(at: DateTime<Utc>) -> IndicatorCache {
        let candles: Vec<Candle> = (0..70)
            .map(|i| {
                let ts = at - Duration::minutes(5 * (70 - i));
                Candle::new(ts, 1.0, 1.0, 1.0, 100.0 + i as f64, 1.0)
            })
            .collect();
        IndicatorEngine::new(55).build("NSE:NIFTY50-INDEX", &candles, 3, at)
    }

    #[test]
    fn snapshot_goes_stale_after_ttl() {
        let t0 = Utc.with_ymd_and_hms(2025, 1, 15, 5, 0, 0).unwrap();
        let c = cache(t0);
        let ttl = Duration::minutes(5);

        let fresh = IndicatorSnapshot::from_cache(&c, t0 + Duration::minutes(5), ttl);
        assert!(!fresh.stale);
        assert!(fresh.value.is_some());
        assert_eq!(fresh.last_close, Some(169.0));

        let old = IndicatorSnapshot::from_cache(&c, t0 + Duration::minutes(5) + Duration::seconds(1), ttl);
        assert!(old.stale);
        assert_eq!(old.value, fresh.value);
    }

    #[test]
    fn degraded_cache_is_stale_immediately() {
        let t0 = Utc.with_ymd_and_hms(2025, 1, 15, 5, 0, 0).unwrap();
        let mut c = cache(t0);
        c.degraded = true;
        assert!(IndicatorSnapshot::from_cache(&c, t0, Duration::minutes(5)).stale);
    }
}
