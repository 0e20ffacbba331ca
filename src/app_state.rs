// =============================================================================
// Central Application State — HMA engine
// =============================================================================
//
// Every service is constructed once here and shared via `Arc`; there are no
// globals. The HTTP layer, the collector task and `main` all hold an
// `Arc<AppState>`.
//
// Construction order (leaf first):
//   clock → market clock → rate limiter → store → fetcher → monitor/collector
// =============================================================================

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use crate::client::MarketDataClient;
use crate::clock::Clock;
use crate::market_clock::MarketClock;
use crate::market_data::{DataCollector, HistoricalFetcher, SeriesBackend, TimeSeriesStore};
use crate::monitor::LiveMonitor;
use crate::rate_limit::RateLimiter;
use crate::runtime_config::RuntimeConfig;

/// Maximum number of recent errors to retain.
const MAX_RECENT_ERRORS: usize = 50;

/// A recorded error event, surfaced by the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub message: String,
    /// Machine-readable kind, e.g. `insufficient_data`.
    pub code: Option<String>,
    pub at: DateTime<Utc>,
}

pub struct AppState {
    /// Incremented on every recorded event.
    pub state_version: AtomicU64,

    pub runtime_config: Arc<RwLock<RuntimeConfig>>,

    pub clock: Arc<dyn Clock>,
    pub market: MarketClock,
    pub limiter: Arc<RateLimiter>,
    pub client: Arc<dyn MarketDataClient>,
    pub store: Arc<TimeSeriesStore>,
    pub fetcher: Arc<HistoricalFetcher>,
    pub monitor: Arc<LiveMonitor>,
    pub collector: Arc<DataCollector>,

    pub started_at: DateTime<Utc>,
    recent_errors: RwLock<VecDeque<ErrorRecord>>,
}

impl AppState {
    pub fn new(
        config: RuntimeConfig,
        client: Arc<dyn MarketDataClient>,
        backend: Arc<dyn SeriesBackend>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let market = MarketClock::from_config(&config.session);
        let limiter = Arc::new(RateLimiter::new(&config.rate_limits, Arc::clone(&clock)));
        let store = Arc::new(TimeSeriesStore::new(
            backend,
            market.clone(),
            Arc::clone(&clock),
            config.storage.max_candles_in_memory,
        ));
        let fetcher = Arc::new(HistoricalFetcher::new(
            Arc::clone(&client),
            Arc::clone(&limiter),
            Arc::clone(&store),
            market.clone(),
            Arc::clone(&clock),
            config.backfill.clone(),
        ));
        let monitor = Arc::new(LiveMonitor::new(
            Arc::clone(&fetcher),
            Arc::clone(&limiter),
            Arc::clone(&clock),
            config.indicator.clone(),
        ));
        let collector = Arc::new(DataCollector::new(
            Arc::clone(&fetcher),
            Arc::clone(&clock),
            &config.symbols,
            Duration::from_secs(config.storage.collect_interval_secs.max(1)),
            config.storage.retention_days,
        ));

        Self {
            state_version: AtomicU64::new(0),
            started_at: clock.now(),
            runtime_config: Arc::new(RwLock::new(config)),
            clock,
            market,
            limiter,
            client,
            store,
            fetcher,
            monitor,
            collector,
            recent_errors: RwLock::new(VecDeque::new()),
        }
    }

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    /// Record an error with an optional machine-readable code.
    pub fn push_error(&self, message: String, code: Option<String>) {
        let record = ErrorRecord {
            message,
            code,
            at: self.clock.now(),
        };

        let mut errors = self.recent_errors.write();
        errors.push_back(record);
        while errors.len() > MAX_RECENT_ERRORS {
            errors.pop_front();
        }
        drop(errors);

        self.increment_version();
    }

    pub fn recent_errors(&self) -> Vec<ErrorRecord> {
        self.recent_errors.read().iter().cloned().collect()
    }
}
