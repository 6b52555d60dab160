//! Operational HTTP endpoints: `/health` and Prometheus `/metrics`.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use tower_http::trace::TraceLayer;

use crate::stats::Stats;

pub fn router(stats: Arc<Stats>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(stats)
}

async fn health() -> &'static str {
    "OK"
}

async fn metrics(State(stats): State<Arc<Stats>>) -> impl IntoResponse {
    match stats.metrics().render() {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!("render metrics: {:?}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to render metrics".to_string(),
            )
        }
    }
}
