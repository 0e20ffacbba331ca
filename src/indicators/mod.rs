// =============================================================================
// Indicator Engine
// =============================================================================
//
// Pure, side-effect-free indicator math. Inputs are `Option<f64>` closes so a
// missing or non-finite candle propagates as `None` instead of a bogus value.

pub mod crossover;
pub mod hma;
pub mod wma;

pub use crossover::{detect_crossover, Crossover};
pub use hma::{
    compute_hma, incremental_update, min_candles, trend, HmaState, IndicatorCache,
    IndicatorEngine, Trend,
};
pub use wma::wma;
