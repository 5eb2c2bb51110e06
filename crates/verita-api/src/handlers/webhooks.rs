//! Provider callbacks.

use axum::{
    extract::{Path, State},
    Json,
};
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;

use verita_analysis::WebhookOutcome;
use verita_core::AppError;

use crate::error::{HttpAppError, ValidatedJson};
use crate::state::AppState;

/// Store a provider's completion and refresh the owning media's summary.
///
/// Duplicate and unknown deliveries are acknowledged so providers stop retrying.
#[tracing::instrument(skip(state, payload), fields(processor_id = %processor_id))]
pub async fn receive_webhook(
    State(state): State<Arc<AppState>>,
    Path(processor_id): Path<String>,
    ValidatedJson(payload): ValidatedJson<JsonValue>,
) -> Result<Json<JsonValue>, HttpAppError> {
    let status = match state.webhooks.receive(&processor_id, payload).await? {
        WebhookOutcome::Completed(row) => {
            match state.coordinator.reconcile_track(row.media_id).await {
                Ok(Some(reconciliation)) => tracing::debug!(
                    media_id = %reconciliation.media.id,
                    persisted = reconciliation.persisted,
                    "Summary reconciled after webhook"
                ),
                Ok(None) => tracing::warn!(track_id = %row.media_id, "Webhook row has no media"),
                Err(e) => tracing::error!(track_id = %row.media_id, error = %e, "Failed to reconcile after webhook"),
            }
            "completed"
        }
        WebhookOutcome::AlreadySettled => "already_settled",
        WebhookOutcome::UnknownRequest => "unknown_request",
        WebhookOutcome::MissingRequestId => {
            return Err(
                AppError::BadRequest("Webhook payload carries no request id".to_string()).into(),
            );
        }
    };

    Ok(Json(json!({ "status": status })))
}
