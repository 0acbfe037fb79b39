use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use crate::error::AppError;
use crate::server::AppState;
use crate::services::FetchParams;

/// Query parameters for /historical
#[derive(Debug, Deserialize)]
pub struct HistoricalQuery {
    /// Comma-separated `EXCHANGE:pair` identifiers
    pub markets: Option<String>,
}

/// GET /historical/{from}/{to}/{timeframe} - ranged bar query
///
/// Examples:
/// - /historical/1700000000000/1700003600000/60000?markets=BINANCE:btcusdt
/// - /historical/1700000000000/1700003600000/10000 (every market)
#[instrument(skip(state))]
pub async fn get_historical_handler(
    State(state): State<AppState>,
    Path((from, to, timeframe)): Path<(i64, i64, i64)>,
    Query(query): Query<HistoricalQuery>,
) -> impl IntoResponse {
    let markets: Vec<String> = query
        .markets
        .as_deref()
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|market| !market.is_empty())
        .map(str::to_string)
        .collect();

    debug!(from, to, timeframe, markets = markets.len(), "historical query");

    let params = FetchParams {
        from,
        to,
        timeframe,
        markets,
    };

    match state.query.fetch(&params).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(AppError::InvalidInput(message)) => {
            warn!(%message, "rejected historical query");
            (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": message })),
            )
                .into_response()
        }
        Err(err) => {
            warn!(error = %err, "historical query failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": "internal error" })),
            )
                .into_response()
        }
    }
}

/// GET /health
pub async fn health_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(serde_json::json!({ "status": "ok" })),
    )
}
