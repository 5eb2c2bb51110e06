//! Inbound provider webhooks
//!
//! A provider calls back with `{"requestId": ..., ...}`. The row is located by
//! (processor, request id) and completed with the whole payload; the adapter
//! decides later whether the payload carries results or an error.

use serde_json::Value as JsonValue;
use std::sync::Arc;

use verita_core::models::{AnalysisResult, RequestState};
use verita_db::AnalysisResultStore;
use verita_processors::ProcessorRegistry;

use crate::error::CoordinatorError;

#[derive(Debug, Clone, PartialEq)]
pub enum WebhookOutcome {
    Completed(AnalysisResult),
    /// The row had already reached a terminal state, or was taken by a newer dispatch.
    AlreadySettled,
    UnknownRequest,
    MissingRequestId,
}

pub struct WebhookReceiver {
    registry: Arc<ProcessorRegistry>,
    results: Arc<dyn AnalysisResultStore>,
}

/// Request id carried by a webhook body.
pub fn request_id_of(payload: &JsonValue) -> Option<String> {
    ["requestId", "request_id"]
        .iter()
        .filter_map(|field| payload.get(field))
        .find_map(|value| match value {
            JsonValue::String(s) if !s.is_empty() => Some(s.clone()),
            JsonValue::Number(n) => Some(n.to_string()),
            _ => None,
        })
}

impl WebhookReceiver {
    pub fn new(registry: Arc<ProcessorRegistry>, results: Arc<dyn AnalysisResultStore>) -> Self {
        Self { registry, results }
    }

    #[tracing::instrument(skip(self, payload), fields(processor_id = %processor_id))]
    pub async fn receive(
        &self,
        processor_id: &str,
        payload: JsonValue,
    ) -> Result<WebhookOutcome, CoordinatorError> {
        let processor = self
            .registry
            .get(processor_id)
            .ok_or_else(|| CoordinatorError::UnknownProcessor(processor_id.to_string()))?;
        if !processor.is_webhook() {
            return Err(CoordinatorError::NotWebhook(processor_id.to_string()));
        }

        let Some(request_id) = request_id_of(&payload) else {
            tracing::warn!("Webhook without request id");
            return Ok(WebhookOutcome::MissingRequestId);
        };

        let Some(row) = self
            .results
            .find_by_request_id(processor_id, &request_id)
            .await?
        else {
            tracing::warn!(request_id = %request_id, "Webhook for unknown request");
            return Ok(WebhookOutcome::UnknownRequest);
        };

        if row.request_state.is_terminal() {
            return Ok(WebhookOutcome::AlreadySettled);
        }

        match self
            .results
            .finish(&row.key(), &request_id, RequestState::Complete, payload)
            .await?
        {
            Some(done) => {
                tracing::info!(request_id = %request_id, track_id = %done.media_id, "Webhook completed analysis");
                Ok(WebhookOutcome::Completed(done))
            }
            None => Ok(WebhookOutcome::AlreadySettled),
        }
    }
}
