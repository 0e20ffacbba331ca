// =============================================================================
// Market data client capability
// =============================================================================
//
// The engine never talks HTTP directly; it consumes this trait. The REST
// implementation lives in `rest`, tests use the scripted client in `mock`.
// =============================================================================

pub mod rest;

#[cfg(test)]
pub mod mock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::ClientError;
use crate::types::{Candle, Depth, Quote, Resolution};

pub use rest::RestMarketDataClient;

#[async_trait]
pub trait MarketDataClient: Send + Sync {
    async fn fetch_quote(&self, symbol: &str) -> Result<Quote, ClientError>;

    /// Candles whose bucket start lies in `[from, to]`, ascending.
    async fn fetch_history(
        &self,
        symbol: &str,
        resolution: Resolution,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Candle>, ClientError>;

    async fn fetch_depth(&self, symbol: &str) -> Result<Depth, ClientError>;
}
