//! Read-only HTTP surface over the engine.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use crate::candle::Candle;
use crate::engine::{FailureStage, HistoricalDataEngine, HistoricalDataError, InitState};

/// Paths served by [`stats_router`].
pub const ROUTES: [&str; 3] = ["/health", "/stats", "/klines"];

pub fn stats_router(engine: Arc<HistoricalDataEngine>) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/stats", get(get_stats))
        .route("/klines", get(get_klines))
        .with_state(AppState { engine })
}

#[derive(Clone)]
struct AppState {
    engine: Arc<HistoricalDataEngine>,
}

#[derive(Debug, Deserialize)]
pub struct KlinesQuery {
    pub symbol: String,
    pub timeframe: String,
    /// `YYYY-MM-DD`
    pub start: String,
    pub end: String,
}

#[derive(Debug, Serialize)]
struct KlinesResponse<'a> {
    symbol: &'a str,
    timeframe: &'a str,
    start: &'a str,
    end: &'a str,
    candle_count: usize,
    candles: &'a [Candle],
}

async fn get_health(State(state): State<AppState>) -> Response {
    let init = state.engine.get_system_stats().initialization;
    let status = match init.state {
        InitState::Failed => StatusCode::SERVICE_UNAVAILABLE,
        InitState::Pending | InitState::Ready => StatusCode::OK,
    };
    (status, Json(json!({ "status": init.state, "error": init.error }))).into_response()
}

async fn get_stats(State(state): State<AppState>) -> impl IntoResponse {
    info!(component = "server", event = "http.stats.request");
    Json(state.engine.get_system_stats())
}

async fn get_klines(State(state): State<AppState>, Query(query): Query<KlinesQuery>) -> Response {
    info!(
        component = "server",
        event = "http.klines.request",
        symbol = %query.symbol,
        timeframe = %query.timeframe,
        start = %query.start,
        end = %query.end
    );

    let (Some(start), Some(end)) = (parse_date(&query.start), parse_date(&query.end)) else {
        return error_body(
            StatusCode::BAD_REQUEST,
            FailureStage::Config,
            false,
            "start and end must be YYYY-MM-DD dates".to_string(),
        );
    };

    match state
        .engine
        .get_historical_data(&query.symbol, &query.timeframe, start, end)
        .await
    {
        Ok(candles) => Json(KlinesResponse {
            symbol: &query.symbol,
            timeframe: &query.timeframe,
            start: query.start.trim(),
            end: query.end.trim(),
            candle_count: candles.len(),
            candles: &candles,
        })
        .into_response(),
        Err(err) => error_body(status_for(&err), err.stage(), err.is_retryable(), err.to_string()),
    }
}

/// Maps the engine's error taxonomy onto HTTP statuses.
pub fn status_for(err: &HistoricalDataError) -> StatusCode {
    match err {
        HistoricalDataError::ValidationConfig { .. } => StatusCode::BAD_REQUEST,
        HistoricalDataError::Quality { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        HistoricalDataError::Upstream { .. } => StatusCode::BAD_GATEWAY,
        HistoricalDataError::Transport { .. } => StatusCode::SERVICE_UNAVAILABLE,
    }
}

fn error_body(status: StatusCode, stage: FailureStage, retryable: bool, message: String) -> Response {
    (
        status,
        Json(json!({ "error": message, "stage": stage, "retryable": retryable })),
    )
        .into_response()
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").ok()
}
