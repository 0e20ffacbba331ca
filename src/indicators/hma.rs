// =============================================================================
// Hull Moving Average (HMA)
// =============================================================================
//
//   raw_t = 2 · WMA(close, n/2)_t − WMA(close, n)_t
//   HMA_t = WMA(raw, floor(sqrt n))_t
//
// The first defined value needs n + floor(sqrt n) − 1 closes (61 for n = 55).
//
// Two ways to evaluate it:
//   - `compute_hma` — the full series from a slice of closes;
//   - `HmaState`    — rolling buffers of the last n closes and the last
//                     floor(sqrt n) raw values, O(n) per new close.
// Both produce identical values for identical input.
// =============================================================================

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::crossover::{detect_crossover, Crossover};
use super::wma::{wma, wma_last};
use crate::types::Candle;

/// Flatness threshold for [`trend`].
const TREND_EPSILON: f64 = 1e-9;

fn sqrt_len(period: usize) -> usize {
    (period as f64).sqrt().floor() as usize
}

/// Closes needed before the first HMA value is defined.
pub fn min_candles(period: usize) -> usize {
    if period < 2 {
        return usize::MAX;
    }
    period + sqrt_len(period) - 1
}

/// Full HMA series, same length as `closes`.
///
/// # Edge cases
/// - `period < 2` => all `None`
/// - a `None` close poisons every output whose windows include it
pub fn compute_hma(closes: &[Option<f64>], period: usize) -> Vec<Option<f64>> {
    if period < 2 {
        return vec![None; closes.len()];
    }
    let full = wma(closes, period);
    let half = wma(closes, period / 2);
    let raw: Vec<Option<f64>> = half
        .iter()
        .zip(&full)
        .map(|(h, f)| Some(2.0 * (*h)? - (*f)?))
        .collect();
    wma(&raw, sqrt_len(period))
}

// ---------------------------------------------------------------------------
// Trend
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Rising,
    Falling,
    Flat,
}

/// Direction of the last step of an HMA series. Missing values read as flat.
pub fn trend(series: &[Option<f64>]) -> Trend {
    match series {
        [.., Some(prev), Some(last)] => direction(*prev, *last),
        _ => Trend::Flat,
    }
}

fn direction(prev: f64, last: f64) -> Trend {
    if last > prev + TREND_EPSILON {
        Trend::Rising
    } else if last < prev - TREND_EPSILON {
        Trend::Falling
    } else {
        Trend::Flat
    }
}

// ---------------------------------------------------------------------------
// Incremental state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct HmaState {
    period: usize,
    closes: VecDeque<Option<f64>>,
    raw: VecDeque<Option<f64>>,
}

impl HmaState {
    pub fn new(period: usize) -> Self {
        Self {
            period,
            closes: VecDeque::with_capacity(period + 1),
            raw: VecDeque::with_capacity(sqrt_len(period) + 1),
        }
    }

    /// State after consuming `closes`, oldest first. Only the tail that can
    /// still influence future values is replayed.
    pub fn seeded(period: usize, closes: &[Option<f64>]) -> Self {
        let mut state = Self::new(period);
        let keep = min_candles(period).min(closes.len());
        for close in &closes[closes.len() - keep..] {
            state.push(*close);
        }
        state
    }

    /// Feed one close; returns the HMA at that close.
    pub fn push(&mut self, close: Option<f64>) -> Option<f64> {
        if self.period < 2 {
            return None;
        }

        self.closes.push_back(close);
        if self.closes.len() > self.period {
            self.closes.pop_front();
        }

        let raw = if self.closes.len() == self.period {
            let window = self.closes.make_contiguous();
            let full = wma_last(window);
            let half = wma_last(&window[self.period - self.period / 2..]);
            match (half, full) {
                (Some(h), Some(f)) => Some(2.0 * h - f),
                _ => None,
            }
        } else {
            None
        };

        let n = sqrt_len(self.period);
        self.raw.push_back(raw);
        if self.raw.len() > n {
            self.raw.pop_front();
        }
        if self.raw.len() == n && self.closes.len() == self.period {
            wma_last(self.raw.make_contiguous())
        } else {
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Indicator cache
// ---------------------------------------------------------------------------

/// Current HMA of one symbol together with what it was computed from.
#[derive(Debug, Clone)]
pub struct IndicatorCache {
    pub symbol: String,
    pub period: usize,
    /// Series version the cache reflects.
    pub window_version: u64,
    pub current_value: Option<f64>,
    pub previous_value: Option<f64>,
    pub computed_at: DateTime<Utc>,
    pub last_candle: Option<Candle>,
    /// Last refresh failed; value is served as stale.
    pub degraded: bool,
    pub trend: Trend,
    pub last_crossover: Crossover,
    state: HmaState,
}

/// Feed one newly closed candle into the cache. Returns the new HMA value.
pub fn incremental_update(cache: &mut IndicatorCache, candle: &Candle) -> Option<f64> {
    if cache
        .last_candle
        .as_ref()
        .is_some_and(|last| candle.timestamp <= last.timestamp)
    {
        return cache.current_value;
    }

    let value = cache.state.push(candle.valid_close());

    cache.last_crossover = match (&cache.last_candle, candle.valid_close()) {
        (Some(prev), Some(curr)) => match prev.valid_close() {
            Some(prev_close) => detect_crossover(prev_close, curr, cache.current_value, value),
            None => Crossover::None,
        },
        _ => Crossover::None,
    };
    cache.previous_value = cache.current_value;
    cache.current_value = value;
    cache.trend = match (cache.previous_value, value) {
        (Some(p), Some(v)) => direction(p, v),
        _ => Trend::Flat,
    };
    cache.last_candle = Some(candle.clone());
    value
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Builds and advances [`IndicatorCache`]s for a fixed HMA period.
#[derive(Debug, Clone, Copy)]
pub struct IndicatorEngine {
    period: usize,
}

impl IndicatorEngine {
    /// Periods below 2 have no HMA; they are raised to 2.
    pub fn new(period: usize) -> Self {
        Self {
            period: period.max(2),
        }
    }

    pub fn period(&self) -> usize {
        self.period
    }

    pub fn min_candles(&self) -> usize {
        min_candles(self.period)
    }

    /// Full recompute from an ascending window of candles read at series
    /// `version`.
    pub fn build(
        &self,
        symbol: &str,
        candles: &[Candle],
        version: u64,
        now: DateTime<Utc>,
    ) -> IndicatorCache {
        let closes: Vec<Option<f64>> = candles.iter().map(Candle::valid_close).collect();
        let series = compute_hma(&closes, self.period);

        let current_value = series.last().copied().flatten();
        let previous_value = series.iter().rev().nth(1).copied().flatten();

        let last_crossover = match (candles, &series[..]) {
            ([.., prev, curr], [.., prev_hma, curr_hma]) => {
                match (prev.valid_close(), curr.valid_close()) {
                    (Some(p), Some(c)) => detect_crossover(p, c, *prev_hma, *curr_hma),
                    _ => Crossover::None,
                }
            }
            _ => Crossover::None,
        };

        IndicatorCache {
            symbol: symbol.to_string(),
            period: self.period,
            window_version: version,
            current_value,
            previous_value,
            computed_at: now,
            last_candle: candles.last().cloned(),
            degraded: false,
            trend: trend(&series),
            last_crossover,
            state: HmaState::seeded(self.period, &closes),
        }
    }

    /// Advance `cache` with candles newer than its last candle. Returns the
    /// crossovers seen along the way.
    pub fn apply(
        &self,
        cache: &mut IndicatorCache,
        candles: &[Candle],
        version: u64,
        now: DateTime<Utc>,
    ) -> Vec<Crossover> {
        let mut seen = Vec::new();
        for candle in candles {
            let before = cache.last_candle.as_ref().map(|c| c.timestamp);
            incremental_update(cache, candle);
            if cache.last_candle.as_ref().map(|c| c.timestamp) != before
                && cache.last_crossover != Crossover::None
            {
                seen.push(cache.last_crossover);
            }
        }
        cache.window_version = version;
        cache.computed_at = now;
        cache.degraded = false;
        seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;

    fn some(xs: &[f64]) -> Vec<Option<f64>> {
        xs.iter().copied().map(Some).collect()
    }

    fn candles(closes: &[f64]) -> Vec<Candle> {
        let t0 = Utc.with_ymd_and_hms(2025, 1, 15, 3, 45, 0).unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, c)| Candle::new(t0 + Duration::minutes(5 * i as i64), *c, *c, *c, *c, 1.0))
            .collect()
    }

    fn build(engine: &IndicatorEngine, candles: &[Candle]) -> IndicatorCache {
        engine.build("NSE:NIFTY50-INDEX", candles, 1, Utc::now())
    }

    #[test]
    fn min_candles_for_default_period() {
        assert_eq!(min_candles(55), 61);
        assert_eq!(min_candles(4), 5);
        assert_eq!(min_candles(1), usize::MAX);
    }

    #[test]
    fn golden_vector_period_four() {
        let out = compute_hma(&some(&[10.0, 12.0, 11.0, 13.0, 15.0, 14.0]), 4);
        assert_eq!(out.len(), 6);
        assert!(out[..4].iter().all(Option::is_none));
        assert!((out[4].unwrap() - 14.5).abs() < 1e-9);
        assert!((out[5].unwrap() - 1353.0 / 90.0).abs() < 1e-9);
    }

    #[test]
    fn ramp_with_period_55_lags_by_four_thirds() {
        let closes: Vec<Option<f64>> = (0..200).map(|i| Some(i as f64)).collect();
        let out = compute_hma(&closes, 55);
        assert!(out[..60].iter().all(Option::is_none));
        for (i, v) in out.iter().enumerate().skip(60) {
            let v = v.expect("defined after warm-up");
            assert!((v - (i as f64 - 4.0 / 3.0)).abs() < 1e-6, "index {i}: {v}");
        }
    }

    #[test]
    fn missing_close_poisons_dependent_outputs() {
        let mut closes = some(&(0..80).map(|i| i as f64).collect::<Vec<_>>());
        closes[70] = None;
        let out = compute_hma(&closes, 55);
        assert!(out[69].is_some());
        assert!(out[70].is_none());
        assert!(out[79].is_none());
    }

    #[test]
    fn small_periods_are_undefined() {
        assert_eq!(compute_hma(&some(&[1.0, 2.0, 3.0]), 1), vec![None; 3]);
        assert_eq!(compute_hma(&some(&[1.0, 2.0, 3.0]), 0), vec![None; 3]);
    }

    #[test]
    fn trend_from_last_two_values() {
        assert_eq!(trend(&[Some(1.0), Some(2.0)]), Trend::Rising);
        assert_eq!(trend(&[Some(2.0), Some(1.0)]), Trend::Falling);
        assert_eq!(trend(&[Some(2.0), Some(2.0)]), Trend::Flat);
        assert_eq!(trend(&[None, Some(2.0)]), Trend::Flat);
        assert_eq!(trend(&[Some(2.0)]), Trend::Flat);
    }

    #[test]
    fn incremental_matches_batch() {
        let closes: Vec<f64> = (0..150)
            .map(|i| 100.0 + (i as f64 * 0.37).sin() * 5.0 + i as f64 * 0.1)
            .collect();
        let all = candles(&closes);
        let batch = compute_hma(&some(&closes), 55);

        let engine = IndicatorEngine::new(55);
        let mut cache = build(&engine, &all[..70]);
        assert_eq!(cache.current_value, batch[69]);

        for (i, c) in all.iter().enumerate().skip(70) {
            let v = incremental_update(&mut cache, c);
            let expected = batch[i].unwrap();
            assert!((v.unwrap() - expected).abs() < 1e-9, "index {i}");
        }
        assert_eq!(cache.last_candle.as_ref().unwrap().timestamp, all[149].timestamp);
    }

    #[test]
    fn duplicate_or_older_candle_is_ignored() {
        let closes: Vec<f64> = (0..70).map(|i| i as f64).collect();
        let all = candles(&closes);
        let engine = IndicatorEngine::new(55);
        let mut cache = build(&engine, &all);
        let before = cache.current_value;
        assert_eq!(incremental_update(&mut cache, &all[69]), before);
        assert_eq!(incremental_update(&mut cache, &all[10]), before);
    }

    #[test]
    fn build_with_short_window_has_no_value() {
        let all = candles(&[1.0; 30]);
        let cache = build(&IndicatorEngine::new(55), &all);
        assert_eq!(cache.current_value, None);
        assert_eq!(cache.trend, Trend::Flat);
    }

    #[test]
    fn apply_reports_crossover_when_price_jumps_through_hma() {
        let mut closes: Vec<f64> = vec![100.0; 70];
        let all = candles(&closes);
        let engine = IndicatorEngine::new(55);
        let mut cache = build(&engine, &all);
        assert!((cache.current_value.unwrap() - 100.0).abs() < 1e-9);

        closes.push(120.0);
        let next = candles(&closes);
        let seen = engine.apply(&mut cache, &next[70..], 2, Utc::now());
        assert_eq!(seen, vec![Crossover::Above]);
        assert_eq!(cache.window_version, 2);
        assert_eq!(cache.trend, Trend::Rising);
    }

    proptest! {
        #[test]
        fn short_series_is_all_none(period in 2usize..80, extra in 0usize..200) {
            let len = extra % min_candles(period);
            let closes: Vec<Option<f64>> = (0..len).map(|i| Some(i as f64)).collect();
            let out = compute_hma(&closes, period);
            prop_assert_eq!(out.len(), len);
            prop_assert!(out.iter().all(Option::is_none));
        }

        #[test]
        fn full_series_is_defined_from_min_candles(period in 2usize..60) {
            let n = min_candles(period) + 5;
            let closes: Vec<Option<f64>> = (0..n).map(|i| Some(50.0 + i as f64)).collect();
            let out = compute_hma(&closes, period);
            prop_assert!(out[min_candles(period) - 2].is_none());
            prop_assert!(out[min_candles(period) - 1..].iter().all(Option::is_some));
        }
    }
}
