pub mod api;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{routing::get, Router};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::services::QueryService;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    pub query: Arc<QueryService>,
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([axum::http::Method::GET, axum::http::Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route(
            "/historical/{from}/{to}/{timeframe}",
            get(api::get_historical_handler),
        )
        .route("/health", get(api::health_handler))
        .layer(cors)
        .with_state(state)
}

/// Start the axum server
pub async fn serve(query: Arc<QueryService>, port: u16) -> crate::error::Result<()> {
    let app = router(AppState { query });

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "query API listening");
    info!("  GET /historical/{{from}}/{{to}}/{{timeframe}}?markets=BINANCE:btcusdt,...");
    info!("  GET /health");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
