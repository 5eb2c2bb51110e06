//! Generic JSON-over-HTTP provider integration
//!
//! Protocol:
//! - `POST {base_url}/analyses` with the track URL and our placeholder reference.
//!   The provider answers `{"status": "complete", "result": {...}}` when it
//!   finished synchronously, `{"status": "error", "error": ...}` when it refused
//!   the input, or `{"request_id": "...", "status": "processing"}` otherwise.
//! - `GET {base_url}/analyses/{request_id}` returns the same status shape.
//!
//! Missing credentials and 4xx answers fail the row immediately. 429 and 5xx
//! answers are handed back to the caller when it can retry (queued jobs), and
//! fail the row otherwise.

use anyhow::Context;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::time::Duration;

use verita_core::models::{error_payload, AnalysisResult, RequestState};

use crate::error::ProcessorError;
use crate::slot::{DispatchSlot, Reservation};
use crate::starter::{CheckRequest, Checker, StartOutcome, StartRequest, Starter};

const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;

fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

#[derive(Clone, Serialize, Deserialize)]
pub struct HttpProcessorConfig {
    pub base_url: String,
    /// Never logged.
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    /// Webhook URL handed to providers that push results.
    #[serde(default)]
    pub callback_url: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Debug for HttpProcessorConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("HttpProcessorConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("callback_url", &self.callback_url)
            .finish()
    }
}

impl HttpProcessorConfig {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            callback_url: None,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }

    pub fn with_callback_url(mut self, url: impl Into<String>) -> Self {
        self.callback_url = Some(url.into());
        self
    }

    fn client(&self) -> anyhow::Result<Client> {
        Client::builder()
            .timeout(Duration::from_secs(self.request_timeout_secs))
            .build()
            .context("Failed to create HTTP client for processor")
    }
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    #[serde(default)]
    request_id: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    result: Option<JsonValue>,
    #[serde(default)]
    error: Option<JsonValue>,
}

async fn read_status(response: reqwest::Response) -> Result<StatusResponse, ProcessorError> {
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        return Err(ProcessorError::from_status(status.as_u16(), body));
    }

    response
        .json::<StatusResponse>()
        .await
        .map_err(|e| ProcessorError::InvalidResponse(e.to_string()))
}

fn provider_error_message(error: Option<&JsonValue>) -> String {
    match error {
        Some(JsonValue::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => "provider reported an error".to_string(),
    }
}

/// Map the row left behind by a settled slot to what the Starter reports.
fn outcome_for(row: Option<AnalysisResult>) -> StartOutcome {
    match row {
        Some(row) if row.request_state == RequestState::Complete => StartOutcome::Complete(row),
        Some(row) if row.request_state == RequestState::Error => {
            StartOutcome::Error(row.error_message().unwrap_or_default())
        }
        _ => StartOutcome::Processing,
    }
}

pub struct HttpStarter {
    processor_id: String,
    config: HttpProcessorConfig,
    client: Client,
}

impl Debug for HttpStarter {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("HttpStarter")
            .field("processor_id", &self.processor_id)
            .field("config", &self.config)
            .finish()
    }
}

impl HttpStarter {
    pub fn new(processor_id: impl Into<String>, config: HttpProcessorConfig) -> anyhow::Result<Self> {
        let client = config.client()?;
        Ok(Self {
            processor_id: processor_id.into(),
            config,
            client,
        })
    }

    async fn dispatch(
        &self,
        request: &StartRequest,
        reference: &str,
        api_key: &str,
    ) -> Result<StatusResponse, ProcessorError> {
        let body = json!({
            "reference": reference,
            "media_id": request.track.id,
            "media_type": request.track.media_type,
            "url": request.track.url,
            "filename": request.track.filename,
            "mime_type": request.track.mime_type,
            "priority": request.priority.as_i32(),
            "callback_url": self.config.callback_url,
        });

        let response = self
            .client
            .post(format!("{}/analyses", self.config.base_url))
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await?;

        read_status(response).await
    }
}

#[async_trait]
impl Starter for HttpStarter {
    #[tracing::instrument(skip(self, request), fields(processor_id = %self.processor_id, media_id = %request.track.id))]
    async fn start(&self, request: StartRequest) -> Result<StartOutcome, ProcessorError> {
        let key = verita_core::models::AnalysisKey::new(request.track.id, &self.processor_id);
        let reservation = DispatchSlot::reserve(
            request.store.clone(),
            key,
            request.placeholder_request_id(),
            &request.attribution,
        )
        .await?;

        let mut slot = match reservation {
            Reservation::Reserved(slot) => slot,
            Reservation::Settled(row) => return Ok(outcome_for(Some(row))),
        };

        let Some(api_key) = self.config.api_key.clone() else {
            let err = ProcessorError::MissingCredentials(self.processor_id.clone());
            tracing::error!(error = %err, "Cannot dispatch without credentials");
            let row = slot.fail(err.to_string(), Some(json!({"code": err.code()}))).await?;
            return Ok(outcome_for(row).or_error(err.to_string()));
        };

        let reference = slot.request_id().to_string();
        let response = match self.dispatch(&request, &reference, &api_key).await {
            Ok(response) => response,
            Err(err) if err.is_retryable() && request.can_retry() => {
                tracing::warn!(error = %err, "Transient provider failure, leaving row for retry");
                return Err(err);
            }
            Err(err) => {
                tracing::warn!(error = %err, "Provider dispatch failed");
                let row = slot
                    .fail(err.to_string(), Some(json!({"code": err.code()})))
                    .await?;
                return Ok(outcome_for(row).or_error(err.to_string()));
            }
        };

        match (response.status.as_deref(), response.result) {
            (Some("complete"), Some(result)) => {
                tracing::info!("Provider completed synchronously");
                Ok(outcome_for(slot.complete(result).await?))
            }
            (Some("error"), _) => {
                let message = provider_error_message(response.error.as_ref());
                let row = slot.fail(message.clone(), response.error).await?;
                Ok(outcome_for(row).or_error(message))
            }
            _ => match response.request_id {
                Some(provider_id) => {
                    slot.record_request_id(&provider_id).await?;
                    tracing::info!(request_id = %provider_id, "Analysis dispatched");
                    Ok(StartOutcome::Processing)
                }
                None => {
                    let err = ProcessorError::InvalidResponse("missing request_id".to_string());
                    let row = slot.fail(err.to_string(), Some(json!({"code": err.code()}))).await?;
                    Ok(outcome_for(row).or_error(err.to_string()))
                }
            },
        }
    }
}

impl StartOutcome {
    /// Failures written by this dispatch still surface as errors if the row was
    /// lost to a concurrent dispatch.
    fn or_error(self, message: String) -> StartOutcome {
        match self {
            StartOutcome::Processing => StartOutcome::Error(message),
            other => other,
        }
    }
}

pub struct HttpChecker {
    processor_id: String,
    config: HttpProcessorConfig,
    client: Client,
}

impl Debug for HttpChecker {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("HttpChecker")
            .field("processor_id", &self.processor_id)
            .field("config", &self.config)
            .finish()
    }
}

impl HttpChecker {
    pub fn new(processor_id: impl Into<String>, config: HttpProcessorConfig) -> anyhow::Result<Self> {
        let client = config.client()?;
        Ok(Self {
            processor_id: processor_id.into(),
            config,
            client,
        })
    }
}

#[async_trait]
impl Checker for HttpChecker {
    #[tracing::instrument(skip(self, request), fields(processor_id = %self.processor_id, request_id = %request.request_id()))]
    async fn check(&self, request: CheckRequest) -> Result<Option<AnalysisResult>, ProcessorError> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .ok_or_else(|| ProcessorError::MissingCredentials(self.processor_id.clone()))?;

        let response = self
            .client
            .get(format!(
                "{}/analyses/{}",
                self.config.base_url,
                request.request_id()
            ))
            .bearer_auth(api_key)
            .send()
            .await?;
        let status = read_status(response).await?;

        let (state, raw) = match (status.status.as_deref(), status.result) {
            (Some("complete"), Some(result)) => (RequestState::Complete, result),
            (Some("error"), _) => (
                RequestState::Error,
                error_payload(provider_error_message(status.error.as_ref()), status.error),
            ),
            _ => return Ok(None),
        };

        let key = request.row.key();
        let written = request
            .store
            .finish(&key, request.request_id(), state, raw)
            .await?;
        match written {
            Some(row) => {
                tracing::info!(state = %row.request_state, "Polled analysis finished");
                Ok(Some(row))
            }
            // Someone else settled the row first
            None => Ok(request
                .store
                .get(&key)
                .await?
                .filter(|row| row.request_state.is_terminal())),
        }
    }
}
