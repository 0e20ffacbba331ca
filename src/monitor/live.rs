// =============================================================================
// LiveMonitor — per-symbol HMA caches with background refresh
// =============================================================================
//
// Each monitored symbol owns a `MonitorHandle`: the cached indicator, a stop
// channel and the refresh task's JoinHandle. The handle map is the single
// owner; removing a handle is how a symbol goes back to Idle.
//
// Refresh task, per symbol:
//   1. sleep until the next 5-minute boundary plus the settle delay;
//   2. if the session is live (or the cache has expired) fill today's gaps
//      and feed the new candles to the incremental HMA;
//   3. on failure keep the old value and mark the cache degraded.
//
// Stopping signals the watch channel and awaits the task. Cache writes are
// additionally checked against the handle generation, so a task from an
// earlier start of the same symbol can never overwrite a newer cache.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures_util::future::join_all;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::cache::{is_expired, IndicatorSnapshot, MonitorState};
use super::query::IndicatorQuery;
use crate::clock::Clock;
use crate::error::{ClientError, MonitorError};
use crate::indicators::{IndicatorCache, IndicatorEngine};
use crate::market_data::{BackfillResult, HistoricalFetcher};
use crate::rate_limit::RateLimiter;
use crate::runtime_config::IndicatorConfig;
use crate::types::{Instrument, Resolution, SeriesId};

pub use crate::indicators::{detect_crossover, Crossover};

/// Monitors run on the 5-minute series.
const MONITOR_RESOLUTION: Resolution = Resolution::FiveMinute;

struct MonitorHandle {
    id: SeriesId,
    generation: u64,
    cache: Arc<Mutex<IndicatorCache>>,
    stop_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

/// Outcome of starting a CE/PE pair. Each side is independent.
#[derive(Debug)]
pub struct PairResult {
    pub ce: Result<IndicatorSnapshot, MonitorError>,
    pub pe: Result<IndicatorSnapshot, MonitorError>,
}

pub struct LiveMonitor {
    fetcher: Arc<HistoricalFetcher>,
    limiter: Arc<RateLimiter>,
    clock: Arc<dyn Clock>,
    engine: IndicatorEngine,
    config: IndicatorConfig,
    handles: Mutex<HashMap<String, MonitorHandle>>,
    pending: Mutex<HashSet<String>>,
    next_generation: AtomicU64,
}

impl LiveMonitor {
    pub fn new(
        fetcher: Arc<HistoricalFetcher>,
        limiter: Arc<RateLimiter>,
        clock: Arc<dyn Clock>,
        config: IndicatorConfig,
    ) -> Self {
        Self {
            fetcher,
            limiter,
            clock,
            engine: IndicatorEngine::new(config.hma_period),
            config,
            handles: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashSet::new()),
            next_generation: AtomicU64::new(0),
        }
    }

    fn ttl(&self) -> Duration {
        Duration::seconds(self.config.cache_ttl_secs)
    }

    /// Candles loaded for a fresh cache.
    fn wanted_candles(&self) -> usize {
        self.config.lookback_candles.max(self.engine.min_candles())
    }

    pub fn monitored_symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.handles.lock().keys().cloned().collect();
        symbols.sort();
        symbols
    }

    pub fn state(&self, symbol: &str) -> MonitorState {
        if self.pending.lock().contains(symbol) {
            return MonitorState::Fetching;
        }
        let handles = self.handles.lock();
        match handles.get(symbol) {
            None => MonitorState::Idle,
            Some(h) if is_expired(&h.cache.lock(), self.clock.now(), self.ttl()) => {
                MonitorState::Expired
            }
            Some(_) => MonitorState::Cached,
        }
    }

    // -------------------------------------------------------------------------
    // Start / stop
    // -------------------------------------------------------------------------

    /// Load history, build the cache and spawn the refresh task. Starting a
    /// symbol that is already monitored returns its current snapshot.
    pub async fn start_monitoring(
        self: &Arc<Self>,
        symbol: &str,
    ) -> Result<IndicatorSnapshot, MonitorError> {
        let instrument = Instrument::parse(symbol).map_err(|reason| MonitorError::InvalidSymbol {
            symbol: symbol.to_string(),
            reason,
        })?;
        let symbol = instrument.symbol.clone();

        if let Some(snapshot) = self.get_indicator(&symbol) {
            return Ok(snapshot);
        }

        self.pending.lock().insert(symbol.clone());
        let loaded = self.load_cache(&instrument).await;
        self.pending.lock().remove(&symbol);

        let cache = match loaded {
            Ok(cache) => cache,
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "monitoring start failed");
                return Err(e);
            }
        };

        let now = self.clock.now();
        let mut handles = self.handles.lock();
        if let Some(existing) = handles.get(&symbol) {
            // Lost a race with a concurrent start of the same symbol.
            return Ok(IndicatorSnapshot::from_cache(&existing.cache.lock(), now, self.ttl()));
        }

        let snapshot = IndicatorSnapshot::from_cache(&cache, now, self.ttl());
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(Arc::clone(self).refresh_loop(symbol.clone(), generation, stop_rx));

        handles.insert(
            symbol.clone(),
            MonitorHandle {
                id: SeriesId::new(&instrument, MONITOR_RESOLUTION),
                generation,
                cache: Arc::new(Mutex::new(cache)),
                stop_tx,
                task: Some(task),
            },
        );

        info!(
            symbol = %symbol,
            generation,
            hma = ?snapshot.value,
            last_candle = ?snapshot.last_candle_at,
            "monitoring started"
        );
        Ok(snapshot)
    }

    async fn load_cache(&self, instrument: &Instrument) -> Result<IndicatorCache, MonitorError> {
        let symbol = instrument.symbol.as_str();
        let id = SeriesId::new(instrument, MONITOR_RESOLUTION);
        let required = self.engine.min_candles();
        let wanted = self.wanted_candles();

        let mut deferrals = 0;
        let report = loop {
            let report = self.fetcher.load_recent(&id, wanted).await;
            if let Some(err) = report.fatal_error() {
                return Err(terminal_error(symbol, err));
            }
            let short = report.window.candles.len() < required;
            if short && report.backfill.deferred && deferrals < self.config.max_deferred_ticks {
                deferrals += 1;
                let wait = self.limiter.time_until_reset();
                info!(symbol, deferrals, wait_ms = wait.as_millis() as u64, "history budget exhausted, waiting for next window");
                tokio::time::sleep(wait).await;
                continue;
            }
            break report;
        };

        let now = self.clock.now();
        let found = report.window.candles.len();
        if found < required {
            return Err(self.shortfall_error(symbol, found, required, &report.backfill, now));
        }

        let window = report.window;
        Ok(self.engine.build(symbol, &window.candles, window.version, now))
    }

    fn shortfall_error(
        &self,
        symbol: &str,
        found: usize,
        required: usize,
        backfill: &BackfillResult,
        now: DateTime<Utc>,
    ) -> MonitorError {
        let symbol = symbol.to_string();
        let throttled = backfill.deferred
            || matches!(backfill.last_error(), Some(ClientError::RateLimited { .. }));
        if throttled {
            return MonitorError::UpstreamThrottled { symbol };
        }
        if found == 0 && !self.fetcher.market().is_session_open(now) {
            return MonitorError::MarketClosed { symbol };
        }
        // Retries of an unavailable upstream are spent by now; with no prior
        // cache that is a shortfall like any other.
        MonitorError::InsufficientData {
            symbol,
            found,
            required,
        }
    }

    /// Remove the handle, signal its task and wait for it to finish. Returns
    /// false when the symbol was not monitored.
    pub async fn stop_monitoring(&self, symbol: &str) -> bool {
        let handle = self.handles.lock().remove(symbol);
        let Some(mut handle) = handle else {
            return false;
        };

        let _ = handle.stop_tx.send(true);
        if let Some(task) = handle.task.take() {
            if let Err(e) = task.await {
                warn!(symbol, error = %e, "refresh task ended abnormally");
            }
        }
        info!(symbol, generation = handle.generation, "monitoring stopped");
        true
    }

    /// Stop `old`, then start `new`.
    pub async fn change_symbol(
        self: &Arc<Self>,
        old: &str,
        new: &str,
    ) -> Result<IndicatorSnapshot, MonitorError> {
        self.stop_monitoring(old).await;
        self.start_monitoring(new).await
    }

    /// Start a call/put pair concurrently.
    pub async fn fetch_hma_for_symbols(self: &Arc<Self>, ce: &str, pe: &str) -> PairResult {
        let (ce, pe) = tokio::join!(self.start_monitoring(ce), self.start_monitoring(pe));
        PairResult { ce, pe }
    }

    pub async fn shutdown(&self) {
        let symbols: Vec<String> = self.handles.lock().keys().cloned().collect();
        let stopped = join_all(symbols.iter().map(|s| self.stop_monitoring(s))).await;
        info!(
            stopped = stopped.into_iter().filter(|s| *s).count(),
            "live monitor shut down"
        );
    }

    // -------------------------------------------------------------------------
    // Refresh
    // -------------------------------------------------------------------------

    async fn refresh_loop(self: Arc<Self>, symbol: String, generation: u64, mut stop: watch::Receiver<bool>) {
        let settle = std::time::Duration::from_secs(self.config.settle_delay_secs);
        loop {
            let now = self.clock.now();
            let boundary = self.fetcher.market().next_bucket_boundary(now, MONITOR_RESOLUTION);
            let wait = (boundary - now).to_std().unwrap_or_default() + settle;

            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                    continue;
                }
                _ = tokio::time::sleep(wait) => {}
            }

            if !self.tick_due(&symbol, generation) {
                continue;
            }
            if self.refresh_generation(&symbol, generation).await.is_none() {
                break;
            }
        }
        debug!(symbol = %symbol, generation, "refresh task exiting");
    }

    /// A tick refreshes while the last bucket belongs to a live session, or
    /// whenever the cache has expired.
    fn tick_due(&self, symbol: &str, generation: u64) -> bool {
        let now = self.clock.now();
        if self
            .fetcher
            .market()
            .is_session_open(now - MONITOR_RESOLUTION.duration())
        {
            return true;
        }
        let handles = self.handles.lock();
        handles
            .get(symbol)
            .filter(|h| h.generation == generation)
            .is_some_and(|h| is_expired(&h.cache.lock(), now, self.ttl()))
    }

    /// Fill today's gaps and advance the cache. `None` when the symbol is not
    /// monitored.
    pub async fn refresh_once(&self, symbol: &str) -> Option<IndicatorSnapshot> {
        let generation = self.handles.lock().get(symbol)?.generation;
        self.refresh_generation(symbol, generation).await
    }

    async fn refresh_generation(&self, symbol: &str, generation: u64) -> Option<IndicatorSnapshot> {
        let (id, cache) = {
            let handles = self.handles.lock();
            let h = handles.get(symbol).filter(|h| h.generation == generation)?;
            (h.id.clone(), Arc::clone(&h.cache))
        };

        let market = self.fetcher.market();
        let session = market.current_or_last_session(self.clock.now());
        let missing = self.fetcher.find_missing_periods(&id, session);
        let last_ts = cache.lock().last_candle.as_ref().map(|c| c.timestamp);

        let (failed, writes) = if missing.is_empty() {
            (false, 0)
        } else {
            let result = self.fetcher.backfill(&id, &missing).await;
            (!result.failures.is_empty() || result.deferred, result.writes)
        };

        if !self.is_current(symbol, generation) {
            return None;
        }

        let now = self.clock.now();
        let store = self.fetcher.store();
        let mut c = cache.lock();

        // The rolling state is only valid if every write since the cache was
        // built is one of ours landing after the cached tail.
        let behind_tail = last_ts.is_some_and(|t| missing.iter().any(|p| p.start <= t));
        let foreign_write = store.version(&id) != c.window_version + writes;
        if behind_tail || foreign_write {
            let window = store.latest(&id, self.wanted_candles());
            *c = self.engine.build(symbol, &window.candles, window.version, now);
            c.degraded = failed;
            debug!(symbol, version = window.version, behind_tail, foreign_write, "cache rebuilt from store");
        } else {
            let (open, _) = market.session_window(session);
            let from = last_ts.map_or(open, |t| t + Duration::seconds(1));
            let window = store.read(&id, from, now);
            if failed && window.candles.is_empty() {
                c.degraded = true;
            } else {
                for crossover in self.engine.apply(&mut c, &window.candles, window.version, now) {
                    info!(symbol, ?crossover, hma = ?c.current_value, "price crossed HMA");
                }
                c.degraded = failed;
            }
        }

        if c.degraded {
            warn!(symbol, "refresh incomplete, serving cached HMA as stale");
        }
        Some(self.snapshot(&id, &c, now))
    }

    /// Snapshot of `cache`, stale as well when the series has moved on since
    /// the value was computed.
    fn snapshot(&self, id: &SeriesId, cache: &IndicatorCache, now: DateTime<Utc>) -> IndicatorSnapshot {
        let mut snapshot = IndicatorSnapshot::from_cache(cache, now, self.ttl());
        if self.fetcher.store().version(id) != cache.window_version {
            snapshot.stale = true;
        }
        snapshot
    }

    fn is_current(&self, symbol: &str, generation: u64) -> bool {
        self.handles
            .lock()
            .get(symbol)
            .is_some_and(|h| h.generation == generation)
    }
}

impl IndicatorQuery for LiveMonitor {
    fn get_indicator(&self, symbol: &str) -> Option<IndicatorSnapshot> {
        let (id, cache) = {
            let handles = self.handles.lock();
            let handle = handles.get(symbol)?;
            (handle.id.clone(), Arc::clone(&handle.cache))
        };
        let cache = cache.lock();
        Some(self.snapshot(&id, &cache, self.clock.now()))
    }
}

fn terminal_error(symbol: &str, err: &ClientError) -> MonitorError {
    match err {
        ClientError::AuthExpired => MonitorError::AuthExpired {
            symbol: symbol.to_string(),
        },
        ClientError::InvalidSymbol { message, .. } => MonitorError::InvalidSymbol {
            symbol: symbol.to_string(),
            reason: message.clone(),
        },
        other => MonitorError::UpstreamUnavailable {
            symbol: symbol.to_string(),
            reason: other.to_string(),
        },
    }
}
