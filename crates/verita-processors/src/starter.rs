//! Starter / Checker protocol
//!
//! A [`Starter`] dispatches one processor on one track. A [`Checker`] polls the
//! provider for processors that don't push their results through a webhook and
//! persists the terminal transition when it observes one.

use async_trait::async_trait;
use std::sync::Arc;

use verita_core::models::{AnalysisResult, Attribution, MediaTrack, MediaType, Priority, ProcessorSpec};
use verita_db::AnalysisResultStore;

use crate::error::ProcessorError;

/// What a Starter observed by the time it returned.
#[derive(Debug, Clone, PartialEq)]
pub enum StartOutcome {
    /// The provider answered synchronously; the row is terminal.
    Complete(AnalysisResult),
    /// Dispatch failed; the row (if any) holds an `{error, detail}` payload.
    Error(String),
    /// Dispatched; completion arrives through a Checker poll or webhook.
    Processing,
}

/// Everything a Starter needs to dispatch one (track, processor) pair.
#[derive(Clone)]
pub struct StartRequest {
    pub processor: Arc<ProcessorSpec>,
    /// Track with a resolved URL.
    pub track: MediaTrack,
    pub attribution: Attribution,
    pub priority: Priority,
    /// Scheduled job id when running inside a queued job. Used as the placeholder
    /// request id, and transient failures are returned as errors so the queue retries.
    pub job_id: Option<String>,
    pub store: Arc<dyn AnalysisResultStore>,
}

impl StartRequest {
    /// Transient failures may be handed back to a retrying caller.
    pub fn can_retry(&self) -> bool {
        self.job_id.is_some()
    }

    pub fn placeholder_request_id(&self) -> String {
        self.job_id.clone().unwrap_or_else(new_placeholder_request_id)
    }
}

const PLACEHOLDER_PREFIX: &str = "verita-";

/// Request id a row holds until the provider hands back its own.
pub fn new_placeholder_request_id() -> String {
    format!("{}{}", PLACEHOLDER_PREFIX, uuid::Uuid::new_v4())
}

pub fn is_placeholder_request_id(request_id: &str) -> bool {
    request_id.starts_with(PLACEHOLDER_PREFIX)
}

#[async_trait]
pub trait Starter: Send + Sync {
    /// Dispatch the track to the provider.
    ///
    /// Fatal failures are reported as `Ok(StartOutcome::Error)` with a terminal
    /// row. `Err` is reserved for transient failures of retryable requests, in
    /// which case the row stays PROCESSING.
    async fn start(&self, request: StartRequest) -> Result<StartOutcome, ProcessorError>;
}

/// Inputs for polling one PROCESSING row.
#[derive(Clone)]
pub struct CheckRequest {
    pub processor: Arc<ProcessorSpec>,
    pub row: AnalysisResult,
    pub media_type: MediaType,
    pub store: Arc<dyn AnalysisResultStore>,
}

impl CheckRequest {
    pub fn request_id(&self) -> &str {
        &self.row.request_id
    }

    pub fn media_id(&self) -> uuid::Uuid {
        self.row.media_id
    }
}

#[async_trait]
pub trait Checker: Send + Sync {
    /// Poll the provider. Returns the terminal row when the analysis finished
    /// (already persisted), `None` while it's still running.
    async fn check(&self, request: CheckRequest) -> Result<Option<AnalysisResult>, ProcessorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholder_request_ids() {
        let placeholder = new_placeholder_request_id();
        assert!(is_placeholder_request_id(&placeholder));
        assert_ne!(placeholder, new_placeholder_request_id());
        assert!(!is_placeholder_request_id("job-1"));
        assert!(!is_placeholder_request_id("hive-7f3a"));
    }
}
