// =============================================================================
// HMA Engine — Main Entry Point
// =============================================================================
//
// Loads config, wires the services into `AppState`, starts the background
// collector and the configured CE/PE monitors, then serves the REST API until
// Ctrl+C.
// =============================================================================

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use hma_engine::api;
use hma_engine::app_state::AppState;
use hma_engine::client::RestMarketDataClient;
use hma_engine::clock::SystemClock;
use hma_engine::market_data::FileBackend;
use hma_engine::runtime_config::RuntimeConfig;

const CONFIG_PATH: &str = "runtime_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("HMA engine starting up");

    let file_config = match RuntimeConfig::load(CONFIG_PATH) {
        Ok(config) => config,
        Err(e) => {
            warn!(error = %e, "Failed to load config, using defaults");
            let defaults = RuntimeConfig::default();
            if !std::path::Path::new(CONFIG_PATH).exists() {
                if let Err(e) = defaults.save(CONFIG_PATH) {
                    warn!(error = %e, "Could not write default config");
                }
            }
            defaults
        }
    };
    // Env overrides apply to this run only; the file is never rewritten.
    let config = file_config.with_overrides(|key| std::env::var(key).ok());

    info!(
        symbols = ?config.symbols,
        ce = ?config.ce_symbol,
        pe = ?config.pe_symbol,
        data_dir = %config.storage.data_dir.display(),
        "Configuration loaded"
    );

    // ── 2. Client, storage, shared state ─────────────────────────────────
    let app_id = std::env::var("BROKER_APP_ID").unwrap_or_default();
    let access_token = std::env::var("BROKER_ACCESS_TOKEN").unwrap_or_default();
    if access_token.is_empty() {
        warn!("BROKER_ACCESS_TOKEN is not set; upstream calls will be rejected");
    }
    let client = Arc::new(
        RestMarketDataClient::new(
            config.api_base_url.clone(),
            &app_id,
            &access_token,
            config.backfill.request_timeout(),
        )
        .context("building market data client")?,
    );
    let backend = Arc::new(
        FileBackend::new(config.storage.data_dir.clone()).context("opening candle storage")?,
    );

    let ce_symbol = config.ce_symbol.clone();
    let pe_symbol = config.pe_symbol.clone();
    let state = Arc::new(AppState::new(config, client, backend, Arc::new(SystemClock)));

    // ── 3. Background collector ──────────────────────────────────────────
    let (stop_tx, stop_rx) = watch::channel(false);
    let collector = tokio::spawn(Arc::clone(&state.collector).run(stop_rx));

    // ── 4. Configured option pair ────────────────────────────────────────
    match (ce_symbol, pe_symbol) {
        (Some(ce), Some(pe)) => {
            let pair = state.monitor.fetch_hma_for_symbols(&ce, &pe).await;
            for (side, result) in [("CE", &pair.ce), ("PE", &pair.pe)] {
                match result {
                    Ok(snap) => info!(side, symbol = %snap.symbol, value = ?snap.value, "Monitoring started"),
                    Err(e) => {
                        warn!(side, error = %e, "Monitoring could not start");
                        state.push_error(e.to_string(), Some(side.to_lowercase()));
                    }
                }
            }
        }
        (Some(symbol), None) | (None, Some(symbol)) => {
            if let Err(e) = state.monitor.start_monitoring(&symbol).await {
                warn!(symbol = %symbol, error = %e, "Monitoring could not start");
                state.push_error(e.to_string(), None);
            }
        }
        (None, None) => info!("No CE/PE pair configured; monitors start on request"),
    }

    // ── 5. API server ────────────────────────────────────────────────────
    let bind_addr = std::env::var("HMA_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".into());
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding API server to {bind_addr}"))?;
    info!(addr = %bind_addr, "API server listening");

    let app = api::router(Arc::clone(&state));
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "API server failed");
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 6. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    server.abort();
    state.monitor.shutdown().await;

    let _ = stop_tx.send(true);
    if let Err(e) = collector.await {
        error!(error = %e, "Collector task ended abnormally");
    }

    let consolidated = state.store.consolidate_all();
    info!(series = consolidated, "Consolidated stored series");

    info!("HMA engine shut down complete.");
    Ok(())
}
