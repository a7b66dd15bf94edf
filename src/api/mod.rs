//! Read-only HTTP surface over the cache
//!
//! - `GET /health`
//! - `GET /status`
//! - `GET /symbols`, `GET /symbols/:symbol`
//! - `GET /charts/:symbol`, `GET /charts/:symbol/:interval`

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::ingest::IngestionPipeline;

pub type ApiState = Arc<IngestionPipeline>;

pub fn router(pipeline: ApiState) -> Router {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/status", get(get_status))
        .route("/symbols", get(list_symbols))
        .route("/symbols/:symbol", get(get_symbol))
        .route("/charts/:symbol", get(get_chart))
        .route("/charts/:symbol/:interval", get(get_candles))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(pipeline)
}

fn error_response(status: StatusCode, message: &str) -> Response {
    let body = serde_json::json!({ "error": message });
    (status, Json(body)).into_response()
}

async fn get_status(State(pipeline): State<ApiState>) -> Response {
    Json(pipeline.status()).into_response()
}

async fn list_symbols(State(pipeline): State<ApiState>) -> Response {
    Json(pipeline.directory().list()).into_response()
}

async fn get_symbol(State(pipeline): State<ApiState>, Path(symbol): Path<String>) -> Response {
    let symbol = symbol.to_uppercase();
    match pipeline.directory().get(&symbol) {
        Some(info) => Json(info).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "symbol not tracked"),
    }
}

async fn get_chart(State(pipeline): State<ApiState>, Path(symbol): Path<String>) -> Response {
    let symbol = symbol.to_uppercase();
    match pipeline.market().snapshot(&symbol) {
        Some(snapshot) => Json(snapshot).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "no data for symbol"),
    }
}

async fn get_candles(
    State(pipeline): State<ApiState>,
    Path((symbol, interval)): Path<(String, String)>,
) -> Response {
    let symbol = symbol.to_uppercase();
    match pipeline.market().ring(&symbol, &interval) {
        Ok(ring) => Json(ring.ascending()).into_response(),
        Err(e) => error_response(StatusCode::NOT_FOUND, &e.to_string()),
    }
}
