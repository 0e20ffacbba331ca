// =============================================================================
// HistoricalFetcher — gap detection and rate-limited backfill
// =============================================================================
//
// Gap detection compares the expected session grid (only buckets that have
// already closed) with the stored series. A stored candle within the
// configured tolerance of a grid point counts as present.
//
// Backfill pacing:
//   - `request_delay` between consecutive requests;
//   - `batch_cooldown` after every `batch_size` requests;
//   - one `Historical` limiter permit per request. A denial stops the pass
//     and hands the remaining periods back as deferred.
// =============================================================================

use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::store::{SeriesWindow, TimeSeriesStore};
use crate::client::MarketDataClient;
use crate::clock::Clock;
use crate::error::ClientError;
use crate::market_clock::MarketClock;
use crate::rate_limit::{ApiClass, RateLimiter};
use crate::runtime_config::BackfillConfig;
use crate::types::SeriesId;

/// Inclusive range of expected bucket starts absent from a series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MissingPeriod {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct BackfillFailure {
    pub period: MissingPeriod,
    pub error: ClientError,
}

#[derive(Debug, Clone, Default)]
pub struct BackfillResult {
    /// Candles newly inserted into the store.
    pub filled: usize,
    /// Store writes that inserted at least one candle; each advances the
    /// series version by one.
    pub writes: u64,
    /// Periods still missing after this pass.
    pub remaining: Vec<MissingPeriod>,
    /// True when the limiter denied a request and the pass stopped early.
    pub deferred: bool,
    pub failures: Vec<BackfillFailure>,
}

impl BackfillResult {
    /// An answer that no retry will fix.
    pub fn fatal_error(&self) -> Option<&ClientError> {
        self.failures
            .iter()
            .map(|f| &f.error)
            .find(|e| matches!(e, ClientError::InvalidSymbol { .. } | ClientError::AuthExpired))
    }

    pub fn last_error(&self) -> Option<&ClientError> {
        self.failures.last().map(|f| &f.error)
    }

    fn absorb(&mut self, other: BackfillResult) {
        self.filled += other.filled;
        self.writes += other.writes;
        self.remaining.extend(other.remaining);
        self.deferred |= other.deferred;
        self.failures.extend(other.failures);
    }
}

/// Outcome of [`HistoricalFetcher::load_recent`].
#[derive(Debug, Clone)]
pub struct WindowReport {
    pub window: SeriesWindow,
    pub days_scanned: Vec<NaiveDate>,
    pub backfill: BackfillResult,
}

impl WindowReport {
    pub fn fatal_error(&self) -> Option<&ClientError> {
        self.backfill.fatal_error()
    }
}

pub struct HistoricalFetcher {
    client: Arc<dyn MarketDataClient>,
    limiter: Arc<RateLimiter>,
    store: Arc<TimeSeriesStore>,
    market: MarketClock,
    clock: Arc<dyn Clock>,
    config: BackfillConfig,
}

impl HistoricalFetcher {
    pub fn new(
        client: Arc<dyn MarketDataClient>,
        limiter: Arc<RateLimiter>,
        store: Arc<TimeSeriesStore>,
        market: MarketClock,
        clock: Arc<dyn Clock>,
        config: BackfillConfig,
    ) -> Self {
        Self {
            client,
            limiter,
            store,
            market,
            clock,
            config,
        }
    }

    pub fn store(&self) -> &Arc<TimeSeriesStore> {
        &self.store
    }

    pub fn market(&self) -> &MarketClock {
        &self.market
    }

    // -------------------------------------------------------------------------
    // Gap detection
    // -------------------------------------------------------------------------

    pub fn find_missing_periods(&self, id: &SeriesId, date: NaiveDate) -> Vec<MissingPeriod> {
        let now = self.clock.now();
        let step = id.resolution.duration();
        let tolerance = Duration::seconds(self.config.tolerance_secs);

        let grid: Vec<DateTime<Utc>> = self
            .market
            .session_grid(date, id.resolution)
            .into_iter()
            .filter(|ts| *ts + step <= now)
            .collect();
        let (Some(first), Some(last)) = (grid.first(), grid.last()) else {
            return Vec::new();
        };

        let stored: Vec<DateTime<Utc>> = self
            .store
            .read(id, *first - tolerance, *last + tolerance)
            .candles
            .iter()
            .map(|c| c.timestamp)
            .collect();

        let present = |ts: DateTime<Utc>| {
            let i = stored.partition_point(|s| *s < ts - tolerance);
            stored.get(i).is_some_and(|s| *s <= ts + tolerance)
        };

        let mut periods: Vec<MissingPeriod> = Vec::new();
        let mut prev_missing = false;
        for ts in grid {
            if present(ts) {
                prev_missing = false;
                continue;
            }
            match periods.last_mut() {
                Some(p) if prev_missing => p.end = ts,
                _ => periods.push(MissingPeriod { start: ts, end: ts }),
            }
            prev_missing = true;
        }
        periods
    }

    // -------------------------------------------------------------------------
    // Backfill
    // -------------------------------------------------------------------------

    pub async fn backfill(&self, id: &SeriesId, periods: &[MissingPeriod]) -> BackfillResult {
        let mut result = BackfillResult::default();
        let batch_size = self.config.batch_size.max(1);

        for (i, period) in periods.iter().enumerate() {
            if i > 0 {
                let pause = if i % batch_size == 0 {
                    self.config.batch_cooldown()
                } else {
                    self.config.request_delay()
                };
                tokio::time::sleep(pause).await;
            }

            if !self.limiter.try_acquire(ApiClass::Historical) {
                info!(
                    series = %id,
                    pending = periods.len() - i,
                    "historical budget exhausted, deferring backfill"
                );
                result.remaining.extend_from_slice(&periods[i..]);
                result.deferred = true;
                break;
            }

            match self.fetch_period(id, period).await {
                Ok(filled) => {
                    result.filled += filled;
                    if filled > 0 {
                        result.writes += 1;
                    }
                }
                Err(error) => {
                    warn!(series = %id, start = %period.start, end = %period.end, error = %error, "backfill request failed");
                    let fatal = matches!(error, ClientError::InvalidSymbol { .. } | ClientError::AuthExpired);
                    result.failures.push(BackfillFailure {
                        period: *period,
                        error,
                    });
                    if fatal {
                        result.remaining.extend_from_slice(&periods[i..]);
                        break;
                    }
                    result.remaining.push(*period);
                }
            }
        }

        debug!(
            series = %id,
            filled = result.filled,
            remaining = result.remaining.len(),
            deferred = result.deferred,
            "backfill pass finished"
        );
        result
    }

    async fn fetch_period(&self, id: &SeriesId, period: &MissingPeriod) -> Result<usize, ClientError> {
        let call = self
            .client
            .fetch_history(&id.symbol, id.resolution, period.start, period.end);

        let fetched = match tokio::time::timeout(self.config.request_timeout(), call).await {
            Ok(Ok(candles)) => {
                self.limiter.record_success(ApiClass::Historical);
                candles
            }
            Ok(Err(e)) => {
                if matches!(e, ClientError::RateLimited { .. }) {
                    self.limiter.record_error(ApiClass::Historical);
                }
                return Err(e);
            }
            Err(_) => {
                return Err(ClientError::Unavailable(format!(
                    "history request timed out after {}s",
                    self.config.request_timeout_secs
                )))
            }
        };

        let now = self.clock.now();
        let step = id.resolution.duration();
        let total = fetched.len();
        let usable: Vec<_> = fetched
            .into_iter()
            .filter(|c| c.timestamp >= period.start && c.timestamp <= period.end)
            .filter(|c| c.timestamp + step <= now)
            .collect();
        if usable.len() < total {
            debug!(series = %id, discarded = total - usable.len(), "discarded out-of-range or open candles");
        }

        self.store.append_many(id, usable).map_err(|e| {
            ClientError::Unavailable(format!("store rejected candles: {e:#}"))
        })
    }

    // -------------------------------------------------------------------------
    // Recent window
    // -------------------------------------------------------------------------

    /// Fill gaps day by day, newest session first, until `count` candles are
    /// stored or the lookback budget is spent.
    pub async fn load_recent(&self, id: &SeriesId, count: usize) -> WindowReport {
        let mut day = self.market.current_or_last_session(self.clock.now());
        let mut report = WindowReport {
            window: self.store.latest(id, count),
            days_scanned: Vec::new(),
            backfill: BackfillResult::default(),
        };

        for _ in 0..self.config.max_day_lookback {
            report.days_scanned.push(day);

            let missing = self.find_missing_periods(id, day);
            if !missing.is_empty() {
                let pass = self.backfill(id, &missing).await;
                let stop = pass.fatal_error().is_some() || pass.deferred;
                report.backfill.absorb(pass);
                if stop {
                    break;
                }
            }

            if self.store.len(id) >= count {
                break;
            }
            day = self.market.previous_trading_day(day);
        }

        report.window = self.store.latest(id, count);
        info!(
            series = %id,
            candles = report.window.candles.len(),
            wanted = count,
            days = report.days_scanned.len(),
            "recent window loaded"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::mock::{session_candles, MockMarketDataClient};
    use crate::clock::ManualClock;
    use crate::market_data::backend::MemoryBackend;
    use crate::runtime_config::{RateLimitConfig, SessionConfig};
    use crate::types::{Candle, Resolution};
    use chrono::TimeZone;

    const SYM: &str = "NSE:NIFTY50-INDEX";

    struct Harness {
        client: Arc<MockMarketDataClient>,
        limiter: Arc<RateLimiter>,
        store: Arc<TimeSeriesStore>,
        fetcher: HistoricalFetcher,
    }

    fn fast_config() -> BackfillConfig {
        BackfillConfig {
            batch_cooldown_ms: 0,
            request_delay_ms: 0,
            ..BackfillConfig::default()
        }
    }

    fn harness(client: MockMarketDataClient, now: DateTime<Utc>, config: BackfillConfig) -> Harness {
        let clock = Arc::new(ManualClock::new(now));
        let market = MarketClock::from_config(&SessionConfig::default());
        let client = Arc::new(client);
        let limiter = Arc::new(RateLimiter::new(&RateLimitConfig::default(), clock.clone()));
        let store = Arc::new(TimeSeriesStore::new(
            Arc::new(MemoryBackend::new()),
            market.clone(),
            clock.clone(),
            10_000,
        ));
        let fetcher = HistoricalFetcher::new(
            client.clone(),
            limiter.clone(),
            store.clone(),
            market,
            clock.clone(),
            config,
        );
        Harness {
            client,
            limiter,
            store,
            fetcher,
        }
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, d).unwrap()
    }

    fn after_close(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, d, 10, 30, 0).unwrap()
    }

    fn market() -> MarketClock {
        MarketClock::from_config(&SessionConfig::default())
    }

    fn one_minute_id() -> SeriesId {
        SeriesId::parse(SYM, Resolution::OneMinute).unwrap()
    }

    /// Full 1m session for 2025-01-15 with the given minute offsets removed.
    fn session_with_gaps(gaps: &[usize]) -> (Vec<Candle>, Vec<Candle>) {
        let all = session_candles(&market(), &[day(15)], Resolution::OneMinute, |i| 100.0 + i as f64);
        let stored = all
            .iter()
            .enumerate()
            .filter(|(i, _)| !gaps.contains(i))
            .map(|(_, c)| c.clone())
            .collect();
        (all, stored)
    }

    #[tokio::test]
    async fn gaps_coalesce_into_periods_and_backfill_closes_them() {
        let gaps: Vec<usize> = (10..=15).chain([40]).collect();
        let (all, stored) = session_with_gaps(&gaps);
        let client = MockMarketDataClient::new().with_candles(SYM, Resolution::OneMinute, all.clone());
        let h = harness(client, after_close(15), fast_config());
        let id = one_minute_id();
        h.store.append_many(&id, stored).unwrap();

        let periods = h.fetcher.find_missing_periods(&id, day(15));
        assert_eq!(
            periods,
            vec![
                MissingPeriod { start: all[10].timestamp, end: all[15].timestamp },
                MissingPeriod { start: all[40].timestamp, end: all[40].timestamp },
            ]
        );

        let before = h.store.version(&id);
        let result = h.fetcher.backfill(&id, &periods).await;
        assert_eq!(result.filled, 7);
        assert_eq!(result.writes, 2);
        assert_eq!(h.store.version(&id), before + result.writes);
        assert!(result.remaining.is_empty());
        assert!(!result.deferred);
        assert_eq!(h.client.history_calls(), 2);
        assert!(h.fetcher.find_missing_periods(&id, day(15)).is_empty());
        assert_eq!(h.store.len(&id), 375);
    }

    #[tokio::test]
    async fn tolerance_treats_near_timestamps_as_present() {
        let (all, _) = session_with_gaps(&[]);
        let h = harness(MockMarketDataClient::new(), after_close(15), fast_config());
        let id = one_minute_id();
        let shifted: Vec<Candle> = all
            .iter()
            .map(|c| {
                let mut c = c.clone();
                c.timestamp += Duration::seconds(20);
                c
            })
            .collect();
        h.store.append_many(&id, shifted).unwrap();
        assert!(h.fetcher.find_missing_periods(&id, day(15)).is_empty());
    }

    #[tokio::test]
    async fn only_closed_buckets_are_expected() {
        // 09:20:30 IST: buckets 09:15..09:19 have closed.
        let now = Utc.with_ymd_and_hms(2025, 1, 15, 3, 50, 30).unwrap();
        let h = harness(MockMarketDataClient::new(), now, fast_config());
        let periods = h.fetcher.find_missing_periods(&one_minute_id(), day(15));
        assert_eq!(periods.len(), 1);
        assert_eq!(periods[0].start, Utc.with_ymd_and_hms(2025, 1, 15, 3, 45, 0).unwrap());
        assert_eq!(periods[0].end, Utc.with_ymd_and_hms(2025, 1, 15, 3, 49, 0).unwrap());
    }

    #[tokio::test]
    async fn open_bucket_in_reply_is_discarded() {
        let now = Utc.with_ymd_and_hms(2025, 1, 15, 3, 50, 30).unwrap();
        // Upstream also returns the still-forming 09:20 candle.
        let candles = (0..6)
            .map(|m| {
                let ts = Utc.with_ymd_and_hms(2025, 1, 15, 3, 45 + m, 0).unwrap();
                Candle::new(ts, 1.0, 1.0, 1.0, 1.0, 1.0)
            })
            .collect();
        let client = MockMarketDataClient::new().with_candles(SYM, Resolution::OneMinute, candles);
        let h = harness(client, now, fast_config());
        let id = one_minute_id();
        let periods = vec![MissingPeriod {
            start: Utc.with_ymd_and_hms(2025, 1, 15, 3, 45, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2025, 1, 15, 3, 50, 0).unwrap(),
        }];
        let result = h.fetcher.backfill(&id, &periods).await;
        assert_eq!(result.filled, 5);
        assert_eq!(h.store.len(&id), 5);
    }

    #[tokio::test]
    async fn limiter_denial_defers_remaining_periods() {
        let (all, _) = session_with_gaps(&[]);
        let client = MockMarketDataClient::new().with_candles(SYM, Resolution::OneMinute, all.clone());
        let h = harness(client, after_close(15), fast_config());
        // Leave a single historical permit.
        for _ in 0..49 {
            assert!(h.limiter.try_acquire(ApiClass::Historical));
        }
        let periods: Vec<MissingPeriod> = [0usize, 10, 20]
            .iter()
            .map(|i| MissingPeriod { start: all[*i].timestamp, end: all[*i].timestamp })
            .collect();

        let result = h.fetcher.backfill(&one_minute_id(), &periods).await;
        assert_eq!(result.filled, 1);
        assert!(result.deferred);
        assert_eq!(result.remaining, periods[1..].to_vec());
        assert_eq!(h.client.history_calls(), 1);
    }

    #[tokio::test]
    async fn throttled_replies_feed_the_limiter() {
        let (all, _) = session_with_gaps(&[]);
        let client = MockMarketDataClient::new().with_candles(SYM, Resolution::OneMinute, all.clone());
        client.throttle_next(3);
        let h = harness(client, after_close(15), fast_config());
        let periods: Vec<MissingPeriod> = (0..4)
            .map(|i| MissingPeriod { start: all[i * 10].timestamp, end: all[i * 10].timestamp })
            .collect();

        let result = h.fetcher.backfill(&one_minute_id(), &periods).await;
        assert_eq!(result.failures.len(), 3);
        assert_eq!(result.filled, 1);
        assert_eq!(result.remaining.len(), 3);
        assert!(!result.deferred);
        assert_eq!(h.limiter.limit(ApiClass::Historical), 40);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_upstream_times_out_as_unavailable() {
        let (all, _) = session_with_gaps(&[]);
        let client = MockMarketDataClient::new()
            .with_candles(SYM, Resolution::OneMinute, all.clone())
            .with_delay(std::time::Duration::from_secs(20));
        let h = harness(client, after_close(15), fast_config());
        let periods = vec![MissingPeriod { start: all[0].timestamp, end: all[0].timestamp }];

        let result = h.fetcher.backfill(&one_minute_id(), &periods).await;
        assert_eq!(result.filled, 0);
        assert!(matches!(result.failures[0].error, ClientError::Unavailable(_)));
        assert_eq!(result.remaining, periods);
    }

    #[tokio::test(start_paused = true)]
    async fn batches_pause_between_requests() {
        let (all, _) = session_with_gaps(&[]);
        let client = MockMarketDataClient::new().with_candles(SYM, Resolution::OneMinute, all.clone());
        let h = harness(client, after_close(15), BackfillConfig::default());
        let periods: Vec<MissingPeriod> = (0..7)
            .map(|i| MissingPeriod { start: all[i * 10].timestamp, end: all[i * 10].timestamp })
            .collect();

        let started = tokio::time::Instant::now();
        let result = h.fetcher.backfill(&one_minute_id(), &periods).await;
        assert_eq!(result.filled, 7);
        // 5 delays of 1s plus one 10s cooldown before the sixth request.
        let elapsed = started.elapsed();
        assert!(elapsed >= std::time::Duration::from_secs(15));
        assert!(elapsed < std::time::Duration::from_secs(16));
    }

    #[tokio::test]
    async fn load_recent_walks_back_over_trading_days() {
        let m = market();
        // Tue 14 and Wed 15 have data; Mon 13 too. 75 five-minute buckets each.
        let days = [day(13), day(14), day(15)];
        let candles = session_candles(&m, &days, Resolution::FiveMinute, |i| 100.0 + i as f64);
        let client = MockMarketDataClient::new().with_candles(SYM, Resolution::FiveMinute, candles);
        let h = harness(client, after_close(15), fast_config());
        let id = SeriesId::parse(SYM, Resolution::FiveMinute).unwrap();

        let report = h.fetcher.load_recent(&id, 120).await;
        assert_eq!(report.window.candles.len(), 120);
        assert_eq!(report.days_scanned, vec![day(15), day(14)]);
        assert!(report.fatal_error().is_none());
    }

    #[tokio::test]
    async fn load_recent_stops_on_invalid_symbol() {
        let client = MockMarketDataClient::new().with_invalid("NSE:NIFTY2511699999CE");
        let h = harness(client, after_close(15), fast_config());
        let id = SeriesId::parse("NSE:NIFTY2511699999CE", Resolution::FiveMinute).unwrap();

        let report = h.fetcher.load_recent(&id, 61).await;
        assert!(matches!(report.fatal_error(), Some(ClientError::InvalidSymbol { .. })));
        assert_eq!(report.days_scanned.len(), 1);
        assert_eq!(h.client.history_calls(), 1);
    }

    #[tokio::test]
    async fn load_recent_spends_lookback_budget_on_empty_days() {
        let h = harness(MockMarketDataClient::new(), after_close(15), fast_config());
        let id = SeriesId::parse(SYM, Resolution::FiveMinute).unwrap();

        let report = h.fetcher.load_recent(&id, 61).await;
        assert!(report.window.candles.is_empty());
        assert_eq!(report.days_scanned.len(), 5);
        assert!(matches!(report.backfill.last_error(), Some(ClientError::NoData { .. })));
    }
}
