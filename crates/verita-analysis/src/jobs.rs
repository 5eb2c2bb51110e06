//! Scheduled analysis jobs
//!
//! - [`StartProcessorJob`]: dispatch one processor for one track through the
//!   queue, so partner-facing failures get the queue's retry and backoff.
//! - [`RefreshResultsJob`]: re-evaluate a media item and persist its summary,
//!   retrying while enabled processors are still running.
//!
//! Both handlers re-read the analysis rows before acting, so a redelivered or
//! late job is harmless.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use verita_core::models::{
    error_payload, AnalysisKey, Attribution, MediaTrack, RequestState, UserCategory,
};
use verita_core::{JobError, JobResultExt};
use verita_db::AnalysisResultStore;
use verita_processors::{is_placeholder_request_id, ProcessorRegistry, StartRequest};
use verita_worker::{
    FieldKind, FieldSpec, JobDirective, JobHandler, JobMetadata, JobPayload, PayloadSchema,
    ScheduledJob,
};

use crate::cache::CacheDecision;
use crate::coordinator::{AnalysisCoordinator, CheckOptions};
use crate::error::CoordinatorError;

pub type StartProcessorScheduler = ScheduledJob<StartProcessorJob, StartProcessorHandler>;
pub type RefreshResultsScheduler = ScheduledJob<RefreshResultsJob, RefreshResultsHandler>;

/// Delay before re-checking a media item whose processors are still running.
pub const REFRESH_RETRY_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartProcessorJob {
    pub processor_id: String,
    /// Resolved track, url included.
    pub track: MediaTrack,
    pub user_category: UserCategory,
    #[serde(default)]
    pub user_id: Option<Uuid>,
    #[serde(default)]
    pub api_key_id: Option<Uuid>,
}

impl StartProcessorJob {
    pub fn new(processor_id: &str, track: &MediaTrack, attribution: &Attribution) -> Self {
        Self {
            processor_id: processor_id.to_string(),
            track: track.clone(),
            user_category: attribution.category,
            user_id: attribution.user_id,
            api_key_id: attribution.api_key_id,
        }
    }

    pub fn attribution(&self) -> Attribution {
        Attribution {
            user_id: self.user_id,
            api_key_id: self.api_key_id,
            category: self.user_category,
        }
    }
}

impl JobPayload for StartProcessorJob {
    const JOB_TYPE: &'static str = "analysis.start_processor";

    fn schema_history() -> Vec<PayloadSchema> {
        let v1 = vec![
            FieldSpec::required("processor_id", FieldKind::String),
            FieldSpec::required("track", FieldKind::Object),
            FieldSpec::required("user_category", FieldKind::String),
            FieldSpec::optional("user_id", FieldKind::String),
        ];
        let mut v2 = v1.clone();
        v2.push(FieldSpec::optional("api_key_id", FieldKind::String));

        vec![PayloadSchema::new(1, v1), PayloadSchema::new(2, v2)]
    }

    fn schema_samples() -> Vec<(u32, JsonValue)> {
        let track = json!({
            "id": "6f1c2b9e-3d4a-4c6b-9a51-0d2e8f7b1c3a",
            "media_id": "6f1c2b9e-3d4a-4c6b-9a51-0d2e8f7b1c3a",
            "media_type": "video",
            "filename": "clip.mp4",
            "mime_type": "video/mp4",
            "url": "https://cdn.example/clip.mp4",
            "size": 1048576,
            "duration": 12.5
        });
        vec![
            (
                1,
                json!({
                    "processor_id": "reality",
                    "track": track,
                    "user_category": "registered",
                    "user_id": "0b7e4f0a-5c1d-4e2f-8a3b-9c6d2e1f4a5b"
                }),
            ),
            (
                1,
                json!({
                    "processor_id": "reality",
                    "track": track,
                    "user_category": "anonymous"
                }),
            ),
            (
                2,
                json!({
                    "processor_id": "reality",
                    "track": track,
                    "user_category": "api",
                    "user_id": null,
                    "api_key_id": "d3a9c8b7-1e2f-4a5b-8c6d-7e8f9a0b1c2d"
                }),
            ),
        ]
    }
}

pub struct StartProcessorHandler {
    registry: Arc<ProcessorRegistry>,
    results: Arc<dyn AnalysisResultStore>,
    max_retries: u32,
}

impl StartProcessorHandler {
    /// `max_retries` must match the queue's, so the last attempt can close the row.
    pub fn new(
        registry: Arc<ProcessorRegistry>,
        results: Arc<dyn AnalysisResultStore>,
        max_retries: u32,
    ) -> Self {
        Self {
            registry,
            results,
            max_retries,
        }
    }
}

#[async_trait]
impl JobHandler<StartProcessorJob> for StartProcessorHandler {
    #[tracing::instrument(skip(self, payload, meta), fields(processor_id = %payload.processor_id, track_id = %payload.track.id, job.id = %meta.job_id))]
    async fn handle(
        &self,
        payload: StartProcessorJob,
        meta: &JobMetadata,
    ) -> Result<JobDirective, JobError> {
        let processor = self
            .registry
            .get(&payload.processor_id)
            .cloned()
            .ok_or_else(|| CoordinatorError::UnknownProcessor(payload.processor_id.clone()))
            .unrecoverable()?;

        let key = AnalysisKey::new(payload.track.id, processor.id());
        if let Some(row) = self.results.get(&key).await? {
            if row.request_state.is_terminal() {
                tracing::debug!("Analysis already settled, nothing to start");
                return Ok(JobDirective::Complete);
            }
            // Some delivery of this job already handed off to the provider
            if row.request_id != meta.job_id && !is_placeholder_request_id(&row.request_id) {
                tracing::debug!(request_id = %row.request_id, "Analysis already dispatched");
                return Ok(JobDirective::Complete);
            }
        }

        let attribution = payload.attribution();
        let request = StartRequest {
            processor: processor.spec.clone(),
            track: payload.track,
            attribution,
            priority: meta.priority,
            job_id: Some(meta.job_id.clone()),
            store: self.results.clone(),
        };

        match processor.starter().start(request).await {
            Ok(outcome) => {
                tracing::info!(outcome = ?outcome, "Processor started from job");
                Ok(JobDirective::Complete)
            }
            Err(e) if e.is_retryable() && meta.attempt < self.max_retries => {
                tracing::warn!(error = %e, attempt = meta.attempt, "Processor start failed, will retry");
                Err(e.into())
            }
            Err(e) => {
                tracing::error!(error = %e, "Processor start failed for good");
                let detail = json!({ "code": e.code(), "attempts": meta.attempt + 1 });
                self.results
                    .finish(
                        &key,
                        &meta.job_id,
                        RequestState::Error,
                        error_payload(e.to_string(), Some(detail)),
                    )
                    .await?;
                Ok(JobDirective::Failed {
                    reason: e.to_string(),
                })
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshResultsJob {
    pub media_id: Uuid,
    #[serde(default)]
    pub include_audio: bool,
}

impl JobPayload for RefreshResultsJob {
    const JOB_TYPE: &'static str = "analysis.refresh_results";

    fn schema_history() -> Vec<PayloadSchema> {
        vec![PayloadSchema::new(
            1,
            vec![
                FieldSpec::required("media_id", FieldKind::String),
                FieldSpec::optional("include_audio", FieldKind::Boolean),
            ],
        )]
    }

    fn schema_samples() -> Vec<(u32, JsonValue)> {
        vec![
            (1, json!({"media_id": "6f1c2b9e-3d4a-4c6b-9a51-0d2e8f7b1c3a"})),
            (
                1,
                json!({"media_id": "6f1c2b9e-3d4a-4c6b-9a51-0d2e8f7b1c3a", "include_audio": true}),
            ),
        ]
    }
}

pub struct RefreshResultsHandler {
    coordinator: Arc<AnalysisCoordinator>,
}

impl RefreshResultsHandler {
    pub fn new(coordinator: Arc<AnalysisCoordinator>) -> Self {
        Self { coordinator }
    }
}

#[async_trait]
impl JobHandler<RefreshResultsJob> for RefreshResultsHandler {
    #[tracing::instrument(skip(self, payload, meta), fields(media_id = %payload.media_id, job.id = %meta.job_id))]
    async fn handle(
        &self,
        payload: RefreshResultsJob,
        meta: &JobMetadata,
    ) -> Result<JobDirective, JobError> {
        let opts = CheckOptions {
            include_audio: payload.include_audio,
            include_ignored: false,
        };
        let reconciliation = match self.coordinator.reconcile(payload.media_id, opts).await {
            Ok(reconciliation) => reconciliation,
            Err(CoordinatorError::MediaNotFound(_)) => {
                tracing::info!("Media is gone, dropping refresh");
                return Ok(JobDirective::Complete);
            }
            Err(e) => return Err(JobError::recoverable(e)),
        };

        match reconciliation.decision {
            CacheDecision::BlockingPenders(pending) => {
                tracing::debug!(pending, "Processors still running, refreshing later");
                Ok(JobDirective::Retry {
                    delay: Some(REFRESH_RETRY_DELAY),
                })
            }
            _ => Ok(JobDirective::Complete),
        }
    }
}
