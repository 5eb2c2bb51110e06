//! Health check handler.

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::state::AppState;

const CHECK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Serialize)]
struct HealthCheckResponse {
    status: &'static str,
    database: String,
    processors: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    queued_jobs: Option<usize>,
}

pub(super) async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let database = match &state.pool {
        None => "in-memory".to_string(),
        Some(pool) => {
            match tokio::time::timeout(CHECK_TIMEOUT, sqlx::query("SELECT 1").execute(pool)).await {
                Ok(Ok(_)) => "healthy".to_string(),
                Ok(Err(e)) => {
                    tracing::error!(error = %e, "Database health check failed");
                    format!("unhealthy: {}", e)
                }
                Err(_) => "timeout".to_string(),
            }
        }
    };

    let queued_jobs = match &state.jobs {
        Some(jobs) => match jobs.queue.pending().await {
            Ok(count) => Some(count),
            Err(e) => {
                tracing::warn!(error = %e, "Could not count queued jobs");
                None
            }
        },
        None => None,
    };

    let healthy = database == "healthy" || database == "in-memory";
    let response = HealthCheckResponse {
        status: if healthy { "healthy" } else { "unhealthy" },
        database,
        processors: state.coordinator.registry().len(),
        queued_jobs,
    };
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status, Json(response))
}
