// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. Monitoring endpoints drive the
// `LiveMonitor`; read endpoints serve cached indicators and stored series.
//
// CORS is configured permissively; the service is meant to sit behind a
// private network or reverse proxy.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::app_state::{AppState, ErrorRecord};
use crate::error::{ClientError, MonitorError};
use crate::monitor::{IndicatorQuery, IndicatorSnapshot, MonitorState, SeriesQuery};
use crate::rate_limit::{ApiClass, RateLimitSnapshot};
use crate::types::{Candle, DataType, Instrument, Quote, Resolution};

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/market/status", get(market_status))
        .route("/api/v1/rate-limits", get(rate_limits))
        // ── Monitoring ──────────────────────────────────────────────
        .route("/api/v1/monitor", get(monitored))
        .route("/api/v1/monitor/pair", post(monitor_pair))
        .route(
            "/api/v1/monitor/:symbol",
            post(start_monitor).delete(stop_monitor),
        )
        .route("/api/v1/indicator/:symbol", get(indicator))
        // ── Data ────────────────────────────────────────────────────
        .route("/api/v1/series/:symbol", get(series))
        .route("/api/v1/quote/:symbol", get(quote))
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Error responses
// =============================================================================

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<MonitorError>,
}

/// Handler failure mapped onto an HTTP status.
enum ApiError {
    Monitor(MonitorError),
    NotFound(String),
    BadRequest(String),
    Upstream(StatusCode, String),
}

fn monitor_status(err: &MonitorError) -> StatusCode {
    match err {
        MonitorError::InvalidSymbol { .. } => StatusCode::BAD_REQUEST,
        MonitorError::InsufficientData { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        MonitorError::UpstreamThrottled { .. } => StatusCode::TOO_MANY_REQUESTS,
        MonitorError::UpstreamUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        MonitorError::MarketClosed { .. } => StatusCode::CONFLICT,
        MonitorError::AuthExpired { .. } => StatusCode::UNAUTHORIZED,
    }
}

fn client_status(err: &ClientError) -> StatusCode {
    match err {
        ClientError::InvalidSymbol { .. } => StatusCode::BAD_REQUEST,
        ClientError::AuthExpired => StatusCode::UNAUTHORIZED,
        ClientError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        ClientError::NoData { .. } => StatusCode::NOT_FOUND,
        ClientError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        ClientError::Malformed(_) => StatusCode::BAD_GATEWAY,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::Monitor(err) => (
                monitor_status(&err),
                ErrorBody {
                    error: err.to_string(),
                    detail: Some(err),
                },
            ),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, ErrorBody { error: msg, detail: None }),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, ErrorBody { error: msg, detail: None }),
            ApiError::Upstream(status, msg) => (status, ErrorBody { error: msg, detail: None }),
        };
        (status, Json(body)).into_response()
    }
}

/// Record a monitoring failure in the health log before returning it.
fn record_monitor_error(state: &AppState, err: MonitorError) -> ApiError {
    let code = serde_json::to_value(&err)
        .ok()
        .and_then(|v| v.get("kind").and_then(|k| k.as_str()).map(str::to_string));
    state.push_error(err.to_string(), code);
    ApiError::Monitor(err)
}

// =============================================================================
// Health & status
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    state_version: u64,
    server_time: DateTime<Utc>,
    started_at: DateTime<Utc>,
    session_open: bool,
    monitored: Vec<String>,
    recent_errors: Vec<ErrorRecord>,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let now = state.clock.now();
    Json(HealthResponse {
        status: "ok",
        state_version: state.current_state_version(),
        server_time: now,
        started_at: state.started_at,
        session_open: state.market.is_session_open(now),
        monitored: state.monitor.monitored_symbols(),
        recent_errors: state.recent_errors(),
    })
}

#[derive(Serialize)]
struct MarketStatusResponse {
    now: DateTime<Utc>,
    session_open: bool,
    /// Today if it is a trading day, otherwise the last one.
    session_date: NaiveDate,
    session_start: DateTime<Utc>,
    session_end: DateTime<Utc>,
    next_five_minute_boundary: DateTime<Utc>,
}

async fn market_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let now = state.clock.now();
    let session_date = state.market.current_or_last_session(now);
    let (session_start, session_end) = state.market.session_window(session_date);
    Json(MarketStatusResponse {
        now,
        session_open: state.market.is_session_open(now),
        session_date,
        session_start,
        session_end,
        next_five_minute_boundary: state
            .market
            .next_bucket_boundary(now, Resolution::FiveMinute),
    })
}

async fn rate_limits(State(state): State<Arc<AppState>>) -> Json<RateLimitSnapshot> {
    Json(state.limiter.snapshot())
}

// =============================================================================
// Monitoring
// =============================================================================

#[derive(Serialize)]
struct MonitoredEntry {
    symbol: String,
    state: MonitorState,
    indicator: Option<IndicatorSnapshot>,
}

async fn monitored(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let entries: Vec<MonitoredEntry> = state
        .monitor
        .monitored_symbols()
        .into_iter()
        .map(|symbol| MonitoredEntry {
            state: state.monitor.state(&symbol),
            indicator: state.monitor.get_indicator(&symbol),
            symbol,
        })
        .collect();
    Json(entries)
}

async fn start_monitor(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
) -> Result<Json<IndicatorSnapshot>, ApiError> {
    match state.monitor.start_monitoring(&symbol).await {
        Ok(snapshot) => {
            info!(symbol = %symbol, value = ?snapshot.value, "monitoring started via API");
            state.increment_version();
            Ok(Json(snapshot))
        }
        Err(e) => {
            warn!(symbol = %symbol, error = %e, "monitoring request failed");
            Err(record_monitor_error(&state, e))
        }
    }
}

#[derive(Serialize)]
struct StopResponse {
    symbol: String,
    stopped: bool,
}

async fn stop_monitor(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
) -> impl IntoResponse {
    let stopped = state.monitor.stop_monitoring(&symbol).await;
    if stopped {
        state.increment_version();
    }
    Json(StopResponse { symbol, stopped })
}

#[derive(Deserialize)]
struct PairRequest {
    ce: String,
    pe: String,
}

/// One side of a pair request; a failed side never fails the other.
#[derive(Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum SideResult {
    Ok { indicator: IndicatorSnapshot },
    Error { error: String, detail: MonitorError },
}

#[derive(Serialize)]
struct PairResponse {
    ce: SideResult,
    pe: SideResult,
}

fn side_result(state: &AppState, result: Result<IndicatorSnapshot, MonitorError>) -> SideResult {
    match result {
        Ok(indicator) => SideResult::Ok { indicator },
        Err(err) => {
            state.push_error(err.to_string(), None);
            SideResult::Error {
                error: err.to_string(),
                detail: err,
            }
        }
    }
}

async fn monitor_pair(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PairRequest>,
) -> impl IntoResponse {
    let pair = state.monitor.fetch_hma_for_symbols(&req.ce, &req.pe).await;
    state.increment_version();
    Json(PairResponse {
        ce: side_result(&state, pair.ce),
        pe: side_result(&state, pair.pe),
    })
}

async fn indicator(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
) -> Result<Json<IndicatorSnapshot>, ApiError> {
    state
        .monitor
        .get_indicator(&symbol)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("{symbol} is not monitored")))
}

// =============================================================================
// Data
// =============================================================================

#[derive(Deserialize)]
struct SeriesParams {
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
    resolution: Option<String>,
}

#[derive(Serialize)]
struct SeriesResponse {
    symbol: String,
    resolution: Resolution,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    candles: Vec<Candle>,
}

/// Stored candles in `[from, to]`. Defaults to the current or last session.
async fn series(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
    Query(params): Query<SeriesParams>,
) -> Result<Json<SeriesResponse>, ApiError> {
    let resolution = match params.resolution.as_deref() {
        None => Resolution::FiveMinute,
        Some(raw) => Resolution::parse(raw)
            .ok_or_else(|| ApiError::BadRequest(format!("unknown resolution '{raw}'")))?,
    };

    let now = state.clock.now();
    let (session_start, _) = state
        .market
        .session_window(state.market.current_or_last_session(now));
    let from = params.from.unwrap_or(session_start);
    let to = params.to.unwrap_or(now);
    if from > to {
        return Err(ApiError::BadRequest("`from` is after `to`".into()));
    }

    let candles = state
        .store
        .get_series(&symbol, resolution, from, to)
        .map_err(ApiError::Monitor)?;
    Ok(Json(SeriesResponse {
        symbol,
        resolution,
        from,
        to,
        candles,
    }))
}

/// Live quote passthrough, paced by the option or market budget.
async fn quote(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
) -> Result<Json<Quote>, ApiError> {
    let instrument = Instrument::parse(&symbol).map_err(|reason| {
        ApiError::Monitor(MonitorError::InvalidSymbol {
            symbol: symbol.clone(),
            reason,
        })
    })?;
    let class = match instrument.data_type {
        DataType::Option => ApiClass::Option,
        _ => ApiClass::Market,
    };

    if !state.limiter.try_acquire(class) {
        return Err(ApiError::Upstream(
            StatusCode::TOO_MANY_REQUESTS,
            format!("{class} budget exhausted"),
        ));
    }

    let timeout = state.runtime_config.read().backfill.request_timeout();
    let result = match tokio::time::timeout(timeout, state.client.fetch_quote(&symbol)).await {
        Ok(r) => r,
        Err(_) => Err(ClientError::Unavailable(format!(
            "quote timed out after {}s",
            timeout.as_secs()
        ))),
    };

    match result {
        Ok(q) => {
            state.limiter.record_success(class);
            Ok(Json(q))
        }
        Err(e) => {
            if matches!(e, ClientError::RateLimited { .. }) {
                state.limiter.record_error(class);
            }
            warn!(symbol = %symbol, error = %e, "quote fetch failed");
            state.push_error(e.to_string(), Some("quote".into()));
            Err(ApiError::Upstream(client_status(&e), e.to_string()))
        }
    }
}
