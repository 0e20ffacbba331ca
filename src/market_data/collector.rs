// =============================================================================
// DataCollector — scheduled 1-minute collection with 5-minute aggregation
// =============================================================================
//
// Every tick, for each configured symbol:
//   1. fill the 1-minute gaps of the current (or last completed) session;
//   2. aggregate complete 5-minute buckets into the 5-minute series.
//
// Once per day after the session closes the store is consolidated and then
// pruned to the retention horizon.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

use super::aggregate::aggregate_five_minute;
use super::fetcher::HistoricalFetcher;
use crate::clock::Clock;
use crate::types::{Instrument, Resolution, SeriesId};

#[derive(Debug, Clone, Default, Serialize)]
pub struct CollectReport {
    pub session: Option<NaiveDate>,
    pub symbols: usize,
    pub filled: usize,
    pub aggregated: usize,
    pub deferred: bool,
    pub housekeeping: bool,
}

pub struct DataCollector {
    fetcher: Arc<HistoricalFetcher>,
    clock: Arc<dyn Clock>,
    instruments: Vec<Instrument>,
    interval: Duration,
    retention_days: usize,
    housekept_for: Mutex<Option<NaiveDate>>,
}

impl DataCollector {
    /// Symbols that fail to parse are logged and skipped.
    pub fn new(
        fetcher: Arc<HistoricalFetcher>,
        clock: Arc<dyn Clock>,
        symbols: &[String],
        interval: Duration,
        retention_days: usize,
    ) -> Self {
        let instruments = symbols
            .iter()
            .filter_map(|s| match Instrument::parse(s) {
                Ok(i) => Some(i),
                Err(reason) => {
                    warn!(symbol = %s, %reason, "skipping unparseable collector symbol");
                    None
                }
            })
            .collect();
        Self {
            fetcher,
            clock,
            instruments,
            interval,
            retention_days,
            housekept_for: Mutex::new(None),
        }
    }

    pub fn instruments(&self) -> &[Instrument] {
        &self.instruments
    }

    pub async fn collect_once(&self) -> CollectReport {
        let now = self.clock.now();
        let market = self.fetcher.market();
        let store = self.fetcher.store();
        let session = market.current_or_last_session(now);

        let mut report = CollectReport {
            session: Some(session),
            ..CollectReport::default()
        };

        for instrument in &self.instruments {
            let minute_id = SeriesId::new(instrument, Resolution::OneMinute);
            let five_id = SeriesId::new(instrument, Resolution::FiveMinute);

            let missing = self.fetcher.find_missing_periods(&minute_id, session);
            if !missing.is_empty() {
                let result = self.fetcher.backfill(&minute_id, &missing).await;
                report.filled += result.filled;
                report.deferred |= result.deferred;
                if let Some(err) = result.fatal_error() {
                    warn!(symbol = %instrument.symbol, error = %err, "collection stopped for symbol");
                    continue;
                }
            }

            let (open, close) = market.session_window(session);
            let minutes = store.read(&minute_id, open, close).candles;
            let bars = aggregate_five_minute(market, &minutes, now);
            match store.append_many(&five_id, bars) {
                Ok(n) => report.aggregated += n,
                Err(e) => warn!(series = %five_id, error = %e, "failed to store aggregated candles"),
            }
            report.symbols += 1;

            if report.deferred {
                // Budget is gone for this minute; the next tick resumes.
                break;
            }
        }

        let (_, close) = market.session_window(session);
        let already_done = *self.housekept_for.lock() == Some(session);
        if now > close && !already_done {
            store.consolidate_all();
            store.prune(self.retention_days);
            *self.housekept_for.lock() = Some(session);
            report.housekeeping = true;
        }

        info!(
            session = %session,
            symbols = report.symbols,
            filled = report.filled,
            aggregated = report.aggregated,
            deferred = report.deferred,
            "collection pass complete"
        );
        report
    }

    /// Collect on every interval until `stop` flips to true or its sender is
    /// dropped.
    pub async fn run(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        info!(
            symbols = self.instruments.len(),
            interval_secs = self.interval.as_secs(),
            "data collector started"
        );
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    self.collect_once().await;
                }
            }
        }
        info!("data collector stopped");
    }
}
