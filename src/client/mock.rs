// =============================================================================
// Scripted market data client for tests
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::MarketDataClient;
use crate::error::ClientError;
use crate::market_clock::MarketClock;
use crate::types::{Candle, Depth, Quote, Resolution};

/// Serves canned candles per `(symbol, resolution)` and replays scripted
/// failures. History requests behave like the broker: only candles inside
/// `[from, to]` are returned and an empty answer is `NoData`.
#[derive(Default)]
pub struct MockMarketDataClient {
    candles: Mutex<HashMap<(String, Resolution), Vec<Candle>>>,
    invalid: Mutex<HashSet<String>>,
    failing: Mutex<HashMap<String, ClientError>>,
    throttle_next: AtomicUsize,
    history_calls: AtomicUsize,
    calls_by_symbol: Mutex<HashMap<String, usize>>,
    delay: Mutex<Option<std::time::Duration>>,
}

impl MockMarketDataClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_candles(self, symbol: &str, resolution: Resolution, candles: Vec<Candle>) -> Self {
        self.set_candles(symbol, resolution, candles);
        self
    }

    pub fn set_candles(&self, symbol: &str, resolution: Resolution, mut candles: Vec<Candle>) {
        candles.sort_by_key(|c| c.timestamp);
        self.candles
            .lock()
            .insert((symbol.to_string(), resolution), candles);
    }

    pub fn with_invalid(self, symbol: &str) -> Self {
        self.invalid.lock().insert(symbol.to_string());
        self
    }

    /// Every history call for `symbol` fails with `err` until cleared.
    pub fn fail_symbol(&self, symbol: &str, err: ClientError) {
        self.failing.lock().insert(symbol.to_string(), err);
    }

    pub fn clear_failure(&self, symbol: &str) {
        self.failing.lock().remove(symbol);
    }

    /// The next `n` history calls answer `RateLimited`.
    pub fn throttle_next(&self, n: usize) {
        self.throttle_next.store(n, Ordering::SeqCst);
    }

    /// Each history call sleeps this long before answering.
    pub fn with_delay(self, delay: std::time::Duration) -> Self {
        *self.delay.lock() = Some(delay);
        self
    }

    pub fn set_delay(&self, delay: std::time::Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn history_calls(&self) -> usize {
        self.history_calls.load(Ordering::SeqCst)
    }

    pub fn calls_for(&self, symbol: &str) -> usize {
        self.calls_by_symbol.lock().get(symbol).copied().unwrap_or(0)
    }

    fn check_symbol(&self, symbol: &str) -> Result<(), ClientError> {
        if self.invalid.lock().contains(symbol) {
            return Err(ClientError::InvalidSymbol {
                symbol: symbol.to_string(),
                message: "symbol not found".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl MarketDataClient for MockMarketDataClient {
    async fn fetch_quote(&self, symbol: &str) -> Result<Quote, ClientError> {
        self.check_symbol(symbol)?;
        let map = self.candles.lock();
        let last = map
            .iter()
            .filter(|((s, _), _)| s == symbol)
            .filter_map(|(_, v)| v.last())
            .max_by_key(|c| c.timestamp)
            .cloned()
            .ok_or_else(|| ClientError::NoData {
                symbol: symbol.to_string(),
            })?;
        Ok(Quote {
            symbol: symbol.to_string(),
            last_price: last.close,
            open: last.open,
            high: last.high,
            low: last.low,
            prev_close: last.open,
            volume: last.volume,
            timestamp: last.timestamp,
        })
    }

    async fn fetch_history(
        &self,
        symbol: &str,
        resolution: Resolution,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Candle>, ClientError> {
        self.history_calls.fetch_add(1, Ordering::SeqCst);
        *self
            .calls_by_symbol
            .lock()
            .entry(symbol.to_string())
            .or_default() += 1;

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.check_symbol(symbol)?;
        if let Some(err) = self.failing.lock().get(symbol) {
            return Err(err.clone());
        }
        let throttled = self
            .throttle_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if throttled {
            return Err(ClientError::RateLimited { status: 429 });
        }

        let map = self.candles.lock();
        let out: Vec<Candle> = map
            .get(&(symbol.to_string(), resolution))
            .map(|v| {
                v.iter()
                    .filter(|c| c.timestamp >= from && c.timestamp <= to)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        if out.is_empty() {
            return Err(ClientError::NoData {
                symbol: symbol.to_string(),
            });
        }
        Ok(out)
    }

    async fn fetch_depth(&self, symbol: &str) -> Result<Depth, ClientError> {
        self.check_symbol(symbol)?;
        Ok(Depth {
            symbol: symbol.to_string(),
            bids: Vec::new(),
            asks: Vec::new(),
            total_buy_qty: 0.0,
            total_sell_qty: 0.0,
        })
    }
}

// ---------------------------------------------------------------------------
// Fixture builders
// ---------------------------------------------------------------------------

/// Full-session candles for each trading day, closes following `price(i)`
/// where `i` counts buckets across all days.
pub fn session_candles(
    clock: &MarketClock,
    days: &[chrono::NaiveDate],
    resolution: Resolution,
    price: impl Fn(usize) -> f64,
) -> Vec<Candle> {
    let mut out = Vec::new();
    let mut i = 0;
    for day in days {
        for ts in clock.session_grid(*day, resolution) {
            let p = price(i);
            out.push(Candle::new(ts, p, p + 1.0, p - 1.0, p, 100.0));
            i += 1;
        }
    }
    out
}
