// =============================================================================
// HMA Engine — rate-limited candle collection and Hull MA monitoring
// =============================================================================
//
// Library root. The binary in `main.rs` wires these modules together; tests
// and embedding callers construct the same services explicitly.
// =============================================================================

pub mod api;
pub mod app_state;
pub mod client;
pub mod clock;
pub mod error;
pub mod indicators;
pub mod market_clock;
pub mod market_data;
pub mod monitor;
pub mod rate_limit;
pub mod runtime_config;
pub mod types;
