//! Route configuration and setup.

mod health;

use axum::{
    http::Method,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::constants::{API_PREFIX, WEBHOOK_PREFIX};
use crate::handlers::analysis::{get_analysis, reset_analysis, start_analysis};
use crate::handlers::webhooks::receive_webhook;
use crate::state::AppState;

/// Provider payloads are small JSON documents.
const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

pub fn setup_routes(state: Arc<AppState>) -> Router<()> {
    let http_concurrency_limit = std::env::var("HTTP_CONCURRENCY_LIMIT")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(1_000)
        .max(1);
    tracing::info!(http_concurrency_limit, "HTTP concurrency limit layer enabled");

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    let api = Router::new()
        .route(
            "/media/{media_id}/analysis",
            get(get_analysis).post(start_analysis),
        )
        .route("/media/{media_id}/analysis/reset", post(reset_analysis));

    let webhooks = Router::new().route("/{processor_id}", post(receive_webhook));

    Router::new()
        .route("/health", get(health::health_check))
        .nest(API_PREFIX, api)
        .nest(WEBHOOK_PREFIX, webhooks)
        .layer(ConcurrencyLimitLayer::new(http_concurrency_limit))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
