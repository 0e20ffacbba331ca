// =============================================================================
// Broker REST client — quotes, history and depth
// =============================================================================
//
// SECURITY: the access token is never logged or serialized. It is issued by
// the broker login flow (outside this crate) and sent as
// `Authorization: <app_id>:<access_token>` on every request.
//
// Error mapping:
//   HTTP 429 / 422                 -> RateLimited
//   HTTP 401 / 403, token codes    -> AuthExpired
//   "s": "no_data"                 -> NoData
//   invalid-symbol replies         -> InvalidSymbol
//   transport errors, 5xx          -> Unavailable
// =============================================================================

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::StatusCode;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use super::MarketDataClient;
use crate::error::ClientError;
use crate::types::{Candle, Depth, DepthLevel, Quote, Resolution};

/// Broker error codes that mean the session token is no longer valid.
const TOKEN_ERROR_CODES: &[i64] = &[-8, -15, -16, -17];

/// Broker error code for an unknown or malformed symbol.
const INVALID_SYMBOL_CODE: i64 = -300;

#[derive(Clone)]
pub struct RestMarketDataClient {
    base_url: String,
    client: reqwest::Client,
}

impl RestMarketDataClient {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    /// Create a client for `base_url`.
    ///
    /// # Arguments
    /// * `app_id`       — broker application id.
    /// * `access_token` — token issued by the broker login flow.
    /// * `timeout`      — per-request timeout.
    pub fn new(
        base_url: impl Into<String>,
        app_id: &str,
        access_token: &str,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&format!("{app_id}:{access_token}")) {
            default_headers.insert(AUTHORIZATION, val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(timeout)
            .build()?;

        let base_url = base_url.into().trim_end_matches('/').to_string();
        debug!(base_url = %base_url, "RestMarketDataClient initialised");

        Ok(Self { base_url, client })
    }

    async fn get_json(&self, path: &str, query: &[(&str, String)]) -> Result<Value, ClientError> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(|e| ClientError::Unavailable(format!("GET {path}: {e}")))?;

        let status = resp.status();
        let body: Value = resp.json().await.unwrap_or(Value::Null);

        if let Some(err) = classify_status(status, &body) {
            warn!(path, status = status.as_u16(), error = %err, "broker request rejected");
            return Err(err);
        }
        Ok(body)
    }
}

#[async_trait]
impl MarketDataClient for RestMarketDataClient {
    /// GET /data/quotes
    #[instrument(skip(self), name = "broker::fetch_quote")]
    async fn fetch_quote(&self, symbol: &str) -> Result<Quote, ClientError> {
        let body = self
            .get_json("/data/quotes", &[("symbols", symbol.to_string())])
            .await?;
        check_body(symbol, &body)?;
        parse_quote(symbol, &body)
    }

    /// GET /data/history
    #[instrument(skip(self), name = "broker::fetch_history")]
    async fn fetch_history(
        &self,
        symbol: &str,
        resolution: Resolution,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Candle>, ClientError> {
        let query = [
            ("symbol", symbol.to_string()),
            ("resolution", resolution.as_api_str().to_string()),
            ("date_format", "0".to_string()),
            ("range_from", from.timestamp().to_string()),
            ("range_to", to.timestamp().to_string()),
            ("cont_flag", "1".to_string()),
        ];
        let body = self.get_json("/data/history", &query).await?;
        check_body(symbol, &body)?;
        let candles = parse_history(symbol, &body)?;
        debug!(symbol, %resolution, count = candles.len(), "history fetched");
        Ok(candles)
    }

    /// GET /data/depth
    #[instrument(skip(self), name = "broker::fetch_depth")]
    async fn fetch_depth(&self, symbol: &str) -> Result<Depth, ClientError> {
        let body = self
            .get_json(
                "/data/depth",
                &[("symbol", symbol.to_string()), ("ohlcv_flag", "1".to_string())],
            )
            .await?;
        check_body(symbol, &body)?;
        parse_depth(symbol, &body)
    }
}

// =============================================================================
// Response classification and parsing
// =============================================================================

fn classify_status(status: StatusCode, body: &Value) -> Option<ClientError> {
    if status.is_success() {
        return None;
    }
    let code = status.as_u16();
    match code {
        429 | 422 => Some(ClientError::RateLimited { status: code }),
        401 | 403 => Some(ClientError::AuthExpired),
        _ if status.is_server_error() => {
            Some(ClientError::Unavailable(format!("HTTP {code}: {body}")))
        }
        _ => Some(
            body_error(body).unwrap_or_else(|| ClientError::Malformed(format!("HTTP {code}: {body}"))),
        ),
    }
}

/// Map a broker `{"s": "error", "code": .., "message": ..}` body to an error.
fn body_error(body: &Value) -> Option<ClientError> {
    let code = body["code"].as_i64().unwrap_or(0);
    let message = body["message"].as_str().unwrap_or_default().to_string();
    if TOKEN_ERROR_CODES.contains(&code) || message.to_lowercase().contains("token") {
        return Some(ClientError::AuthExpired);
    }
    if code == INVALID_SYMBOL_CODE || message.to_lowercase().contains("invalid symbol") {
        return Some(ClientError::InvalidSymbol {
            symbol: String::new(),
            message,
        });
    }
    if code == 429 || message.to_lowercase().contains("limit") {
        return Some(ClientError::RateLimited { status: 429 });
    }
    None
}

/// Inspect the `s` status field of a 200 reply.
fn check_body(symbol: &str, body: &Value) -> Result<(), ClientError> {
    match body["s"].as_str() {
        Some("ok") => Ok(()),
        Some("no_data") => Err(ClientError::NoData {
            symbol: symbol.to_string(),
        }),
        _ => Err(match body_error(body) {
            Some(ClientError::InvalidSymbol { message, .. }) => ClientError::InvalidSymbol {
                symbol: symbol.to_string(),
                message,
            },
            Some(other) => other,
            None => ClientError::Malformed(format!("unexpected reply for {symbol}: {body}")),
        }),
    }
}

/// History rows are `[epoch_secs, open, high, low, close, volume, (oi)]`.
fn parse_history(symbol: &str, body: &Value) -> Result<Vec<Candle>, ClientError> {
    let rows = body["candles"]
        .as_array()
        .ok_or_else(|| ClientError::Malformed("history reply missing 'candles'".into()))?;

    if rows.is_empty() {
        return Err(ClientError::NoData {
            symbol: symbol.to_string(),
        });
    }

    let mut candles = Vec::with_capacity(rows.len());
    for row in rows {
        let Some(arr) = row.as_array().filter(|a| a.len() >= 6) else {
            warn!(symbol, "skipping malformed history row");
            continue;
        };
        let Some(timestamp) = arr[0].as_i64().and_then(|t| Utc.timestamp_opt(t, 0).single())
        else {
            warn!(symbol, "skipping history row with bad timestamp");
            continue;
        };
        let num = |i: usize| arr[i].as_f64().unwrap_or(f64::NAN);
        candles.push(Candle {
            timestamp,
            open: num(1),
            high: num(2),
            low: num(3),
            close: num(4),
            volume: num(5),
            open_interest: arr.get(6).and_then(Value::as_f64),
        });
    }
    candles.sort_by_key(|c| c.timestamp);
    Ok(candles)
}

fn parse_quote(symbol: &str, body: &Value) -> Result<Quote, ClientError> {
    let entry = body["d"]
        .as_array()
        .and_then(|d| d.iter().find(|e| e["n"].as_str() == Some(symbol)))
        .ok_or_else(|| ClientError::NoData {
            symbol: symbol.to_string(),
        })?;

    if entry["s"].as_str() == Some("error") {
        return Err(ClientError::InvalidSymbol {
            symbol: symbol.to_string(),
            message: entry["v"]["errmsg"].as_str().unwrap_or_default().to_string(),
        });
    }

    let v = &entry["v"];
    let num = |k: &str| required_f64(v, k, symbol);
    let timestamp = v["tt"]
        .as_i64()
        .or_else(|| v["tt"].as_str().and_then(|s| s.parse().ok()))
        .and_then(|t| Utc.timestamp_opt(t, 0).single())
        .ok_or_else(|| ClientError::Malformed(format!("quote for {symbol} has no valid 'tt'")))?;

    Ok(Quote {
        symbol: symbol.to_string(),
        last_price: num("lp")?,
        open: num("open_price")?,
        high: num("high_price")?,
        low: num("low_price")?,
        prev_close: num("prev_close_price")?,
        volume: num("volume")?,
        timestamp,
    })
}

fn parse_depth(symbol: &str, body: &Value) -> Result<Depth, ClientError> {
    let book = &body["d"][symbol];
    if book.is_null() {
        return Err(ClientError::NoData {
            symbol: symbol.to_string(),
        });
    }

    let levels = |side: &str| -> Result<Vec<DepthLevel>, ClientError> {
        let Some(rows) = book[side].as_array() else {
            return Ok(Vec::new());
        };
        rows.iter()
            .map(|r| {
                Ok(DepthLevel {
                    price: required_f64(r, "price", symbol)?,
                    quantity: required_f64(r, "volume", symbol)?,
                    orders: r["ord"].as_u64().unwrap_or(0) as u32,
                })
            })
            .collect()
    };

    Ok(Depth {
        symbol: symbol.to_string(),
        bids: levels("bids")?,
        asks: levels("ask")?,
        total_buy_qty: required_f64(book, "totalbuyqty", symbol)?,
        total_sell_qty: required_f64(book, "totalsellqty", symbol)?,
    })
}

/// A numeric field, given either as a JSON number or a numeric string.
fn required_f64(obj: &Value, key: &str, symbol: &str) -> Result<f64, ClientError> {
    let field = &obj[key];
    field
        .as_f64()
        .or_else(|| field.as_str().and_then(|s| s.trim().parse().ok()))
        .filter(|x: &f64| x.is_finite())
        .ok_or_else(|| ClientError::Malformed(format!("{symbol}: missing or non-numeric '{key}'")))
}
