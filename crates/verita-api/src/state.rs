//! Application state shared by every handler.

use anyhow::Result;
use sqlx::PgPool;
use std::sync::{Arc, Weak};

use verita_analysis::{AnalysisCoordinator, RefreshResultsScheduler, WebhookReceiver};
use verita_core::models::RateLimitRule;
use verita_core::Config;
use verita_infra::{SlidingLogLimiter, ThrottleGuard};
use verita_worker::{JobQueue, JobRouter, LocalJobQueue, PgJobQueue};

/// The queue jobs are scheduled on: durable when a database is configured.
#[derive(Clone)]
pub enum JobQueueBackend {
    Local(LocalJobQueue),
    Postgres(PgJobQueue),
}

impl JobQueueBackend {
    pub fn kind(&self) -> &'static str {
        match self {
            JobQueueBackend::Local(_) => "local",
            JobQueueBackend::Postgres(_) => "postgres",
        }
    }

    pub fn handle(&self) -> Arc<dyn JobQueue> {
        match self {
            JobQueueBackend::Local(queue) => Arc::new(queue.clone()),
            JobQueueBackend::Postgres(queue) => Arc::new(queue.clone()),
        }
    }

    pub async fn start(&self, router: Weak<JobRouter>) -> Result<()> {
        match self {
            JobQueueBackend::Local(queue) => queue.start(router).await,
            JobQueueBackend::Postgres(queue) => queue.start(router).await,
        }
    }

    /// Jobs waiting to run, including delayed ones.
    pub async fn pending(&self) -> Result<usize> {
        match self {
            JobQueueBackend::Local(queue) => Ok(queue.pending().await),
            JobQueueBackend::Postgres(queue) => queue.pending().await,
        }
    }

    pub async fn shutdown(&self) {
        match self {
            JobQueueBackend::Local(queue) => queue.shutdown().await,
            JobQueueBackend::Postgres(queue) => queue.shutdown().await,
        }
    }
}

/// Background job machinery. The router is only held weakly by the queue's
/// workers, so it lives here for as long as the service runs.
pub struct JobState {
    pub queue: JobQueueBackend,
    pub router: Arc<JobRouter>,
    pub refresh: Arc<RefreshResultsScheduler>,
}

pub struct AppState {
    pub config: Config,
    /// Set when running against Postgres; the in-memory store has no pool.
    pub pool: Option<PgPool>,
    pub coordinator: Arc<AnalysisCoordinator>,
    pub webhooks: WebhookReceiver,
    pub throttle: ThrottleGuard,
    pub limiter: SlidingLogLimiter,
    pub jobs: Option<JobState>,
}

impl AppState {
    pub fn rate_limit(&self, action: &str) -> Option<RateLimitRule> {
        self.config.rate_limit(action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use verita_core::models::Priority;
    use verita_core::JobQueueSettings;
    use verita_worker::JobMessage;

    #[tokio::test]
    async fn local_backend_counts_through_handle() {
        let backend = JobQueueBackend::Local(LocalJobQueue::new(JobQueueSettings::default()));
        assert_eq!(backend.kind(), "local");

        backend
            .handle()
            .enqueue(
                JobMessage {
                    job_type: "refresh_results".to_string(),
                    schema_version: 1,
                    payload: json!({}),
                },
                Priority::Normal,
                None,
            )
            .await
            .unwrap();

        assert_eq!(backend.pending().await.unwrap(), 1);
    }
}
