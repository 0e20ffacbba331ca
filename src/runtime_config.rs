// =============================================================================
// Runtime Configuration — engine settings with atomic save
// =============================================================================
//
// Every tunable of the collector, limiter, calendar and monitor lives here.
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default)]` so that adding new fields never
// breaks loading an older config file.
// =============================================================================

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbols() -> Vec<String> {
    vec![
        "NSE:NIFTY50-INDEX".to_string(),
        "NSE:NIFTYBANK-INDEX".to_string(),
    ]
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_api_base_url() -> String {
    "https://api-t1.fyers.in".to_string()
}

fn default_historical_limit() -> u32 {
    50
}

fn default_option_limit() -> u32 {
    30
}

fn default_market_limit() -> u32 {
    20
}

fn default_default_limit() -> u32 {
    100
}

fn default_error_threshold() -> u32 {
    3
}

fn default_reduction_pct() -> u32 {
    20
}

fn default_min_limit() -> u32 {
    5
}

fn default_reduction_secs() -> u64 {
    300
}

fn default_session_open() -> NaiveTime {
    NaiveTime::from_hms_opt(9, 15, 0).unwrap_or_default()
}

fn default_session_close() -> NaiveTime {
    NaiveTime::from_hms_opt(15, 30, 0).unwrap_or_default()
}

fn default_utc_offset_minutes() -> i32 {
    330
}

fn default_batch_size() -> usize {
    5
}

fn default_batch_cooldown_ms() -> u64 {
    10_000
}

fn default_request_delay_ms() -> u64 {
    1_000
}

fn default_tolerance_secs() -> i64 {
    30
}

fn default_max_day_lookback() -> usize {
    5
}

fn default_request_timeout_secs() -> u64 {
    15
}

fn default_hma_period() -> usize {
    55
}

fn default_lookback_candles() -> usize {
    60
}

fn default_cache_ttl_secs() -> i64 {
    300
}

fn default_settle_delay_secs() -> u64 {
    5
}

fn default_max_deferred_ticks() -> u32 {
    3
}

fn default_retention_days() -> usize {
    3
}

fn default_max_candles_in_memory() -> usize {
    // Five sessions of 1-minute candles.
    375 * 5
}

fn default_collect_interval_secs() -> u64 {
    60
}

// =============================================================================
// Sections
// =============================================================================

/// Per-minute budgets per API class plus the adaptive-backoff knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_historical_limit")]
    pub historical_per_min: u32,

    #[serde(default = "default_option_limit")]
    pub option_per_min: u32,

    #[serde(default = "default_market_limit")]
    pub market_per_min: u32,

    #[serde(default = "default_default_limit")]
    pub default_per_min: u32,

    /// Consecutive throttling errors before the class limit is reduced.
    #[serde(default = "default_error_threshold")]
    pub error_threshold: u32,

    /// Percentage cut applied to the limit while reduced.
    #[serde(default = "default_reduction_pct")]
    pub reduction_pct: u32,

    /// A reduced limit never drops below this.
    #[serde(default = "default_min_limit")]
    pub min_limit: u32,

    #[serde(default = "default_reduction_secs")]
    pub reduction_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            historical_per_min: default_historical_limit(),
            option_per_min: default_option_limit(),
            market_per_min: default_market_limit(),
            default_per_min: default_default_limit(),
            error_threshold: default_error_threshold(),
            reduction_pct: default_reduction_pct(),
            min_limit: default_min_limit(),
            reduction_secs: default_reduction_secs(),
        }
    }
}

/// Exchange session hours, timezone and holiday calendar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_session_open")]
    pub open: NaiveTime,

    #[serde(default = "default_session_close")]
    pub close: NaiveTime,

    /// Exchange offset from UTC in minutes (IST = +330).
    #[serde(default = "default_utc_offset_minutes")]
    pub utc_offset_minutes: i32,

    /// ISO dates on which the exchange is shut.
    #[serde(default)]
    pub holidays: Vec<NaiveDate>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            open: default_session_open(),
            close: default_session_close(),
            utc_offset_minutes: default_utc_offset_minutes(),
            holidays: Vec::new(),
        }
    }
}

/// Pacing of historical backfill requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_batch_cooldown_ms")]
    pub batch_cooldown_ms: u64,

    #[serde(default = "default_request_delay_ms")]
    pub request_delay_ms: u64,

    /// A stored candle within this many seconds of a grid point counts as
    /// present.
    #[serde(default = "default_tolerance_secs")]
    pub tolerance_secs: i64,

    /// Trading days scanned backwards when a window is short.
    #[serde(default = "default_max_day_lookback")]
    pub max_day_lookback: usize,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            batch_cooldown_ms: default_batch_cooldown_ms(),
            request_delay_ms: default_request_delay_ms(),
            tolerance_secs: default_tolerance_secs(),
            max_day_lookback: default_max_day_lookback(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl BackfillConfig {
    pub fn batch_cooldown(&self) -> Duration {
        Duration::from_millis(self.batch_cooldown_ms)
    }

    pub fn request_delay(&self) -> Duration {
        Duration::from_millis(self.request_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// HMA parameters and live-cache behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndicatorConfig {
    #[serde(default = "default_hma_period")]
    pub hma_period: usize,

    /// Five-minute candles requested when monitoring starts.
    #[serde(default = "default_lookback_candles")]
    pub lookback_candles: usize,

    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: i64,

    /// Delay after a bucket boundary before the refresh tick fires, so the
    /// upstream has published the closed candle.
    #[serde(default = "default_settle_delay_secs")]
    pub settle_delay_secs: u64,

    /// Limiter windows waited when a start is deferred by rate limiting.
    #[serde(default = "default_max_deferred_ticks")]
    pub max_deferred_ticks: u32,
}

impl Default for IndicatorConfig {
    fn default() -> Self {
        Self {
            hma_period: default_hma_period(),
            lookback_candles: default_lookback_candles(),
            cache_ttl_secs: default_cache_ttl_secs(),
            settle_delay_secs: default_settle_delay_secs(),
            max_deferred_ticks: default_max_deferred_ticks(),
        }
    }
}

/// Flat-file storage and retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default = "default_retention_days")]
    pub retention_days: usize,

    #[serde(default = "default_max_candles_in_memory")]
    pub max_candles_in_memory: usize,

    #[serde(default = "default_collect_interval_secs")]
    pub collect_interval_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            retention_days: default_retention_days(),
            max_candles_in_memory: default_max_candles_in_memory(),
            collect_interval_secs: default_collect_interval_secs(),
        }
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration.
///
/// Every field has a serde default so that older JSON files missing new fields
/// will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Symbols collected at 1-minute resolution during the session.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// Option pair monitored at startup, if any.
    #[serde(default)]
    pub ce_symbol: Option<String>,

    #[serde(default)]
    pub pe_symbol: Option<String>,

    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,

    #[serde(default)]
    pub rate_limits: RateLimitConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub backfill: BackfillConfig,

    #[serde(default)]
    pub indicator: IndicatorConfig,

    #[serde(default)]
    pub storage: StorageConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            ce_symbol: None,
            pe_symbol: None,
            api_base_url: default_api_base_url(),
            rate_limits: RateLimitConfig::default(),
            session: SessionConfig::default(),
            backfill: BackfillConfig::default(),
            indicator: IndicatorConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbols = ?config.symbols,
            holidays = config.session.holidays.len(),
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Copy of this config with process-level overrides applied. `lookup`
    /// reads one variable (`std::env::var` in `main`). Overrides live only in
    /// the returned copy and are never written back to the config file.
    ///
    /// Recognised: `HMA_SYMBOLS` (comma separated), `BROKER_BASE_URL`,
    /// `HMA_DATA_DIR`.
    pub fn with_overrides(&self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = self.clone();
        if let Some(syms) = lookup("HMA_SYMBOLS") {
            config.symbols = syms
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(url) = lookup("BROKER_BASE_URL") {
            config.api_base_url = url;
        }
        if let Some(dir) = lookup("HMA_DATA_DIR") {
            config.storage.data_dir = dir.into();
        }
        config
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }
}
