// =============================================================================
// TimeSeriesStore — deduplicated, append-only candle series per SeriesId
// =============================================================================
//
// Thread safety:
//   - the series map lock is held only to look up or create an entry;
//   - each series has its own Mutex, so there is a single writer per series
//     and unrelated series never contend.
//
// Series are hydrated lazily from the backend on first access (consolidated
// record merged with any shards not yet consolidated). Every insert is
// written through to the day shard; backend write failures are logged and
// the in-memory series still advances.
// =============================================================================

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::backend::{merge_first_wins, SeriesBackend};
use crate::clock::Clock;
use crate::market_clock::MarketClock;
use crate::types::{Candle, Resolution, SeriesId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Inserted,
    DuplicateIgnored,
}

/// Ordered view of part of a series, tagged with the series version it was
/// read at.
#[derive(Debug, Clone, Serialize)]
pub struct SeriesWindow {
    pub symbol: String,
    pub resolution: Resolution,
    pub candles: Vec<Candle>,
    pub version: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PruneReport {
    /// Oldest trading day kept.
    pub cutoff: Option<NaiveDate>,
    pub series: usize,
    pub shards_removed: usize,
    pub candles_dropped: usize,
}

struct SymbolSeries {
    candles: BTreeMap<DateTime<Utc>, Candle>,
    version: u64,
}

pub struct TimeSeriesStore {
    series: RwLock<HashMap<SeriesId, Arc<Mutex<SymbolSeries>>>>,
    backend: Arc<dyn SeriesBackend>,
    market: MarketClock,
    clock: Arc<dyn Clock>,
    max_in_memory: usize,
}

impl TimeSeriesStore {
    pub fn new(
        backend: Arc<dyn SeriesBackend>,
        market: MarketClock,
        clock: Arc<dyn Clock>,
        max_in_memory: usize,
    ) -> Self {
        Self {
            series: RwLock::new(HashMap::new()),
            backend,
            market,
            clock,
            max_in_memory: max_in_memory.max(1),
        }
    }

    // -------------------------------------------------------------------------
    // Series lookup / hydration
    // -------------------------------------------------------------------------

    fn entry(&self, id: &SeriesId) -> Result<Arc<Mutex<SymbolSeries>>> {
        if let Some(s) = self.series.read().get(id) {
            return Ok(Arc::clone(s));
        }

        // Hydrate outside the map lock; a racing hydration loses below.
        let hydrated = self.hydrate(id)?;

        let mut map = self.series.write();
        let entry = map
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(hydrated)));
        Ok(Arc::clone(entry))
    }

    /// Like `entry`, but a series with nothing in memory or in the backend is
    /// not registered. Read paths use this so unknown ids leave no trace.
    fn lookup(&self, id: &SeriesId) -> Result<Option<Arc<Mutex<SymbolSeries>>>> {
        if let Some(s) = self.series.read().get(id) {
            return Ok(Some(Arc::clone(s)));
        }

        let hydrated = self.hydrate(id)?;
        if hydrated.candles.is_empty() {
            return Ok(None);
        }

        let mut map = self.series.write();
        let entry = map
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(hydrated)));
        Ok(Some(Arc::clone(entry)))
    }

    fn hydrate(&self, id: &SeriesId) -> Result<SymbolSeries> {
        let mut candles = self
            .backend
            .load_consolidated(id)
            .with_context(|| format!("failed to load consolidated series {id}"))?;
        for date in self.backend.shard_dates(id)? {
            let shard = self
                .backend
                .load_shard(id, date)
                .with_context(|| format!("failed to load shard {id} {date}"))?;
            candles = merge_first_wins(candles, shard);
        }

        let skip = candles.len().saturating_sub(self.max_in_memory);
        let candles: BTreeMap<_, _> = candles
            .into_iter()
            .skip(skip)
            .map(|c| (c.timestamp, c))
            .collect();

        if !candles.is_empty() {
            debug!(series = %id, count = candles.len(), "series hydrated from backend");
        }
        Ok(SymbolSeries {
            candles,
            version: 0,
        })
    }

    // -------------------------------------------------------------------------
    // Writes
    // -------------------------------------------------------------------------

    pub fn append(&self, id: &SeriesId, candle: Candle) -> Result<AppendOutcome> {
        let inserted = self.append_many(id, vec![candle])?;
        Ok(if inserted == 1 {
            AppendOutcome::Inserted
        } else {
            AppendOutcome::DuplicateIgnored
        })
    }

    /// Insert every candle whose timestamp is not yet present. Returns the
    /// number inserted; the version advances once if any were.
    pub fn append_many(&self, id: &SeriesId, candles: Vec<Candle>) -> Result<usize> {
        let series = self.entry(id)?;
        let mut s = series.lock();

        let mut fresh: BTreeMap<NaiveDate, Vec<Candle>> = BTreeMap::new();
        for candle in candles {
            if s.candles.contains_key(&candle.timestamp) {
                continue;
            }
            fresh
                .entry(self.market.local_date(candle.timestamp))
                .or_default()
                .push(candle.clone());
            s.candles.insert(candle.timestamp, candle);
        }

        let inserted: usize = fresh.values().map(Vec::len).sum();
        if inserted == 0 {
            return Ok(0);
        }

        while s.candles.len() > self.max_in_memory {
            s.candles.pop_first();
        }
        s.version += 1;

        for (date, rows) in &fresh {
            if let Err(e) = self.backend.append_to_shard(id, *date, rows) {
                warn!(series = %id, %date, error = %e, "shard write failed; keeping in-memory data");
            }
        }

        debug!(series = %id, inserted, version = s.version, "candles appended");
        Ok(inserted)
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    fn window(&self, id: &SeriesId, candles: Vec<Candle>, version: u64) -> SeriesWindow {
        SeriesWindow {
            symbol: id.symbol.clone(),
            resolution: id.resolution,
            candles,
            version,
        }
    }

    /// Candles with `from <= timestamp <= to`, ascending.
    pub fn read(&self, id: &SeriesId, from: DateTime<Utc>, to: DateTime<Utc>) -> SeriesWindow {
        let Some(series) = self.series_or_log(id) else {
            return self.window(id, Vec::new(), 0);
        };
        let s = series.lock();
        let candles = if from <= to {
            s.candles.range(from..=to).map(|(_, c)| c.clone()).collect()
        } else {
            Vec::new()
        };
        self.window(id, candles, s.version)
    }

    /// The newest `count` candles, ascending.
    pub fn latest(&self, id: &SeriesId, count: usize) -> SeriesWindow {
        let Some(series) = self.series_or_log(id) else {
            return self.window(id, Vec::new(), 0);
        };
        let s = series.lock();
        let mut candles: Vec<Candle> = s.candles.values().rev().take(count).cloned().collect();
        candles.reverse();
        self.window(id, candles, s.version)
    }

    pub fn version(&self, id: &SeriesId) -> u64 {
        self.series_or_log(id).map_or(0, |s| s.lock().version)
    }

    pub fn len(&self, id: &SeriesId) -> usize {
        self.series_or_log(id).map_or(0, |s| s.lock().candles.len())
    }

    pub fn is_empty(&self, id: &SeriesId) -> bool {
        self.len(id) == 0
    }

    fn series_or_log(&self, id: &SeriesId) -> Option<Arc<Mutex<SymbolSeries>>> {
        match self.lookup(id) {
            Ok(s) => s,
            Err(e) => {
                warn!(series = %id, error = %e, "series unavailable");
                None
            }
        }
    }

    // -------------------------------------------------------------------------
    // Consolidation & retention
    // -------------------------------------------------------------------------

    /// Rebuild the consolidated record of `id` from its shards. Returns the
    /// number of candles in the record.
    pub fn consolidate(&self, id: &SeriesId) -> Result<usize> {
        let series = self.lookup(id)?;
        let _guard = series.as_ref().map(|s| s.lock());

        let mut candles = self.backend.load_consolidated(id)?;
        for date in self.backend.shard_dates(id)? {
            candles = merge_first_wins(candles, self.backend.load_shard(id, date)?);
        }
        if series.is_none() && candles.is_empty() {
            return Ok(0);
        }
        self.backend
            .write_consolidated(id, &candles)
            .with_context(|| format!("failed to write consolidated series {id}"))?;

        debug!(series = %id, count = candles.len(), "series consolidated");
        Ok(candles.len())
    }

    fn all_ids(&self) -> Vec<SeriesId> {
        let mut ids: Vec<SeriesId> = self.series.read().keys().cloned().collect();
        match self.backend.series_ids() {
            Ok(stored) => {
                for id in stored {
                    if !ids.contains(&id) {
                        ids.push(id);
                    }
                }
            }
            Err(e) => warn!(error = %e, "failed to list stored series"),
        }
        ids
    }

    /// Consolidate every known series. Failures are logged per series.
    pub fn consolidate_all(&self) -> usize {
        let mut done = 0;
        for id in self.all_ids() {
            match self.consolidate(&id) {
                Ok(_) => done += 1,
                Err(e) => warn!(series = %id, error = %e, "consolidation failed"),
            }
        }
        info!(series = done, "consolidation pass complete");
        done
    }

    /// Drop everything older than the last `retention_days` trading days.
    pub fn prune(&self, retention_days: usize) -> PruneReport {
        let now = self.clock.now();
        let reference = self.market.current_or_last_session(now);
        let Some(cutoff) = self
            .market
            .last_n_trading_days(reference, retention_days.max(1))
            .first()
            .copied()
        else {
            return PruneReport::default();
        };

        let mut report = PruneReport {
            cutoff: Some(cutoff),
            ..PruneReport::default()
        };

        for id in self.all_ids() {
            let market = &self.market;
            if let Some(series) = self.series_or_log(&id) {
                let mut s = series.lock();
                let before = s.candles.len();
                s.candles.retain(|ts, _| market.local_date(*ts) >= cutoff);
                let dropped = before - s.candles.len();
                if dropped > 0 {
                    s.version += 1;
                    report.candles_dropped += dropped;
                }
            }

            match self.backend.shard_dates(&id) {
                Ok(dates) => {
                    for date in dates.into_iter().filter(|d| *d < cutoff) {
                        match self.backend.remove_shard(&id, date) {
                            Ok(()) => report.shards_removed += 1,
                            Err(e) => warn!(series = %id, %date, error = %e, "shard removal failed"),
                        }
                    }
                }
                Err(e) => warn!(series = %id, error = %e, "failed to list shards"),
            }

            match self.backend.load_consolidated(&id) {
                Ok(consolidated) => {
                    let kept: Vec<Candle> = consolidated
                        .iter()
                        .filter(|c| market.local_date(c.timestamp) >= cutoff)
                        .cloned()
                        .collect();
                    if kept.len() != consolidated.len() {
                        if let Err(e) = self.backend.write_consolidated(&id, &kept) {
                            warn!(series = %id, error = %e, "consolidated rewrite failed");
                        }
                    }
                }
                Err(e) => warn!(series = %id, error = %e, "failed to load consolidated series"),
            }
            report.series += 1;
        }

        info!(
            cutoff = %cutoff,
            series = report.series,
            shards_removed = report.shards_removed,
            candles_dropped = report.candles_dropped,
            "retention prune complete"
        );
        report
    }
}
