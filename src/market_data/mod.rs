// =============================================================================
// Market data: storage, gap filling and scheduled collection
// =============================================================================

pub mod aggregate;
pub mod backend;
pub mod collector;
pub mod fetcher;
pub mod store;

pub use backend::{FileBackend, MemoryBackend, SeriesBackend};
pub use collector::{CollectReport, DataCollector};
pub use fetcher::{BackfillResult, HistoricalFetcher, MissingPeriod, WindowReport};
pub use store::{AppendOutcome, PruneReport, SeriesWindow, TimeSeriesStore};
