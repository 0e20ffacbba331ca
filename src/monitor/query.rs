// =============================================================================
// Read-side capabilities exposed to callers (HTTP layer, embedders)
// =============================================================================

use chrono::{DateTime, Utc};

use super::cache::IndicatorSnapshot;
use crate::error::MonitorError;
use crate::market_data::TimeSeriesStore;
use crate::types::{Candle, Resolution, SeriesId};

pub trait IndicatorQuery: Send + Sync {
    /// Latest cached indicator for a monitored symbol; `None` when idle.
    fn get_indicator(&self, symbol: &str) -> Option<IndicatorSnapshot>;
}

pub trait SeriesQuery: Send + Sync {
    fn get_series(
        &self,
        symbol: &str,
        resolution: Resolution,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Candle>, MonitorError>;
}

impl SeriesQuery for TimeSeriesStore {
    fn get_series(
        &self,
        symbol: &str,
        resolution: Resolution,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Candle>, MonitorError> {
        let id = SeriesId::parse(symbol, resolution).map_err(|reason| {
            MonitorError::InvalidSymbol {
                symbol: symbol.to_string(),
                reason,
            }
        })?;
        Ok(self.read(&id, from, to).candles)
    }
}
