// =============================================================================
// Shared types used across the HMA engine
// =============================================================================

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Candles
// ---------------------------------------------------------------------------

/// One OHLCV sample for a fixed time bucket. `timestamp` is the bucket start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    /// Only futures carry open interest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open_interest: Option<f64>,
}

impl Candle {
    pub fn new(
        timestamp: DateTime<Utc>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Self {
        Self {
            timestamp,
            open,
            high,
            low,
            close,
            volume,
            open_interest: None,
        }
    }

    /// A close is usable only when it is a finite number.
    pub fn valid_close(&self) -> Option<f64> {
        self.close.is_finite().then_some(self.close)
    }
}

/// Candle bucket width.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum Resolution {
    #[serde(rename = "1")]
    OneMinute,
    #[serde(rename = "5")]
    FiveMinute,
}

impl Resolution {
    pub fn minutes(self) -> i64 {
        match self {
            Self::OneMinute => 1,
            Self::FiveMinute => 5,
        }
    }

    pub fn duration(self) -> Duration {
        Duration::minutes(self.minutes())
    }

    /// Value sent to the upstream history endpoint.
    pub fn as_api_str(self) -> &'static str {
        match self {
            Self::OneMinute => "1",
            Self::FiveMinute => "5",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "1" | "1m" => Some(Self::OneMinute),
            "5" | "5m" => Some(Self::FiveMinute),
            _ => None,
        }
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OneMinute => write!(f, "1m"),
            Self::FiveMinute => write!(f, "5m"),
        }
    }
}

// ---------------------------------------------------------------------------
// Instruments
// ---------------------------------------------------------------------------

/// Storage class of an instrument.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum DataType {
    #[serde(rename = "INDEX")]
    Index,
    #[serde(rename = "FUTURES")]
    Futures,
    #[serde(rename = "OPTION")]
    Option,
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Index => write!(f, "INDEX"),
            Self::Futures => write!(f, "FUTURES"),
            Self::Option => write!(f, "OPTION"),
        }
    }
}

#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum OptionSide {
    Call,
    Put,
}

/// A validated `EXCHANGE:TICKER` symbol.
///
/// The ticker suffix decides the data type: `-INDEX` for indices, `FUT` for
/// futures, `CE`/`PE` for options.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct Instrument {
    pub symbol: String,
    pub exchange: String,
    pub ticker: String,
    pub data_type: DataType,
    pub option_side: Option<OptionSide>,
}

impl Instrument {
    /// Parse and classify a symbol, returning a human-readable reason on
    /// rejection.
    pub fn parse(symbol: &str) -> Result<Self, String> {
        let symbol = symbol.trim();
        let (exchange, ticker) = symbol
            .split_once(':')
            .ok_or_else(|| "expected EXCHANGE:TICKER".to_string())?;

        if exchange.is_empty() || !exchange.chars().all(|c| c.is_ascii_uppercase()) {
            return Err(format!("invalid exchange prefix '{exchange}'"));
        }
        if ticker.is_empty()
            || !ticker
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '-' || c == '&')
        {
            return Err(format!("invalid ticker '{ticker}'"));
        }

        let (data_type, option_side) = if ticker.ends_with("-INDEX") {
            (DataType::Index, None)
        } else if ticker.ends_with("FUT") {
            (DataType::Futures, None)
        } else if ticker.ends_with("CE") && has_strike(ticker) {
            (DataType::Option, Some(OptionSide::Call))
        } else if ticker.ends_with("PE") && has_strike(ticker) {
            (DataType::Option, Some(OptionSide::Put))
        } else {
            return Err(format!("unrecognised instrument '{ticker}'"));
        };

        Ok(Self {
            symbol: symbol.to_string(),
            exchange: exchange.to_string(),
            ticker: ticker.to_string(),
            data_type,
            option_side,
        })
    }
}

/// Option tickers end in `<strike>CE` / `<strike>PE`.
fn has_strike(ticker: &str) -> bool {
    ticker[..ticker.len() - 2]
        .chars()
        .last()
        .is_some_and(|c| c.is_ascii_digit())
}

/// Identity of one stored series: a symbol at one resolution.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct SeriesId {
    pub symbol: String,
    pub data_type: DataType,
    pub resolution: Resolution,
}

impl SeriesId {
    pub fn new(instrument: &Instrument, resolution: Resolution) -> Self {
        Self {
            symbol: instrument.symbol.clone(),
            data_type: instrument.data_type,
            resolution,
        }
    }

    pub fn parse(symbol: &str, resolution: Resolution) -> Result<Self, String> {
        Instrument::parse(symbol).map(|i| Self::new(&i, resolution))
    }
}

impl std::fmt::Display for SeriesId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.symbol, self.resolution)
    }
}

// ---------------------------------------------------------------------------
// Quotes & depth
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    pub last_price: f64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub prev_close: f64,
    pub volume: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepthLevel {
    pub price: f64,
    pub quantity: f64,
    pub orders: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Depth {
    pub symbol: String,
    pub bids: Vec<DepthLevel>,
    pub asks: Vec<DepthLevel>,
    pub total_buy_qty: f64,
    pub total_sell_qty: f64,
}
