// =============================================================================
// Live monitoring of per-symbol HMA caches
// =============================================================================

pub mod cache;
pub mod live;
pub mod query;

pub use cache::{IndicatorSnapshot, MonitorState};
pub use live::{detect_crossover, Crossover, LiveMonitor, PairResult};
pub use query::{IndicatorQuery, SeriesQuery};
