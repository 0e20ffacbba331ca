// =============================================================================
// Error taxonomy
// =============================================================================
//
// `ClientError` is what the upstream data client surfaces. `MonitorError` is
// what a single symbol's monitoring attempt resolves to. Neither is ever
// allowed to take the process down; callers inspect them as values.
// =============================================================================

use serde::Serialize;
use thiserror::Error;

/// Distinguishable failures reported by a [`MarketDataClient`](crate::client::MarketDataClient).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error("invalid symbol {symbol}: {message}")]
    InvalidSymbol { symbol: String, message: String },

    #[error("access token expired or rejected")]
    AuthExpired,

    /// HTTP 429 / 422 or an equivalent throttling reply.
    #[error("upstream rate limit hit (status {status})")]
    RateLimited { status: u16 },

    #[error("no data for {symbol} in requested range")]
    NoData { symbol: String },

    /// Timeouts, transport failures and 5xx replies.
    #[error("upstream unavailable: {0}")]
    Unavailable(String),

    #[error("malformed upstream response: {0}")]
    Malformed(String),
}

impl ClientError {
    /// Whether retrying later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::Unavailable(_) | Self::NoData { .. }
        )
    }
}

/// Terminal outcome of a monitoring attempt for one symbol.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MonitorError {
    #[error("invalid symbol {symbol}: {reason}")]
    InvalidSymbol { symbol: String, reason: String },

    #[error("insufficient data for {symbol}: found {found} candles, need {required}")]
    InsufficientData {
        symbol: String,
        found: usize,
        required: usize,
    },

    #[error("upstream throttled while fetching {symbol}")]
    UpstreamThrottled { symbol: String },

    #[error("upstream unavailable for {symbol}: {reason}")]
    UpstreamUnavailable { symbol: String, reason: String },

    #[error("market closed and no data available for {symbol}")]
    MarketClosed { symbol: String },

    #[error("broker session expired while fetching {symbol}")]
    AuthExpired { symbol: String },
}

impl MonitorError {
    pub fn symbol(&self) -> &str {
        match self {
            Self::InvalidSymbol { symbol, .. }
            | Self::InsufficientData { symbol, .. }
            | Self::UpstreamThrottled { symbol }
            | Self::UpstreamUnavailable { symbol, .. }
            | Self::MarketClosed { symbol }
            | Self::AuthExpired { symbol } => symbol,
        }
    }
}
