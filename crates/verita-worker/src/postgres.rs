//! Durable job queue over the `scheduled_jobs` table.
//!
//! Jobs survive restarts and several instances can share one table: claims use
//! `FOR UPDATE SKIP LOCKED`, workers wake on `LISTEN` and also poll, and a
//! reaper requeues jobs whose worker died mid-run. Redelivery after a reap is
//! at-least-once, so handlers must tolerate running twice.
//!
//! Shutdown: [`PgJobQueue::shutdown`] stops claiming; in-flight jobs finish on
//! their own or are reaped by another instance.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::time::sleep;

use verita_core::models::Priority;
use verita_core::JobQueueSettings;
use verita_db::{JobRecord, JobRepository, JOB_NOTIFY_CHANNEL};

use crate::job::{JobDirective, JobMessage, JobMetadata, JobQueue, JobRouter};
use crate::retry::{settle, Settlement};

const LISTEN_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Finished jobs are kept this long for inspection before the reaper deletes them.
const FINISHED_JOB_RETENTION_HOURS: i64 = 24 * 7;

#[derive(Clone)]
pub struct PgJobQueue {
    repository: JobRepository,
    pool: PgPool,
    settings: JobQueueSettings,
    shutdown_tx: mpsc::Sender<()>,
    shutdown_rx: Arc<Mutex<Option<mpsc::Receiver<()>>>>,
}

impl PgJobQueue {
    pub fn new(pool: PgPool, settings: JobQueueSettings) -> Self {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        Self {
            repository: JobRepository::new(pool.clone()),
            pool,
            settings,
            shutdown_tx,
            shutdown_rx: Arc::new(Mutex::new(Some(shutdown_rx))),
        }
    }

    /// Spawn the listener, the stale-job reaper and the worker pool.
    pub async fn start(&self, router: Weak<JobRouter>) -> Result<()> {
        let shutdown_rx = self
            .shutdown_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| anyhow::anyhow!("Job queue worker pool already started"))?;

        let repository = self.repository.clone();
        let pool = self.pool.clone();
        let settings = self.settings.clone();
        tokio::spawn(async move {
            Self::worker_pool(repository, pool, settings, router, shutdown_rx).await;
        });
        Ok(())
    }

    /// Jobs waiting to run, including delayed ones.
    pub async fn pending(&self) -> Result<usize> {
        let count = self.repository.count_pending().await?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    async fn worker_pool(
        repository: JobRepository,
        pool: PgPool,
        settings: JobQueueSettings,
        router: Weak<JobRouter>,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) {
        tracing::info!(
            max_workers = settings.max_workers,
            poll_interval_ms = settings.poll_interval_ms,
            stale_job_reap_interval_secs = settings.stale_job_reap_interval_secs,
            "Durable job queue worker pool started"
        );

        let semaphore = Arc::new(Semaphore::new(settings.max_workers.max(1)));
        let poll_interval = settings.poll_interval();

        let (notify_tx, mut notify_rx) = mpsc::channel::<()>(16);
        let listener = tokio::spawn(async move {
            loop {
                match sqlx::postgres::PgListener::connect_with(&pool).await {
                    Ok(mut listener) => {
                        if let Err(e) = listener.listen(JOB_NOTIFY_CHANNEL).await {
                            tracing::warn!(error = %e, "LISTEN failed, will retry");
                            sleep(LISTEN_RETRY_DELAY).await;
                            continue;
                        }
                        while listener.recv().await.is_ok() {
                            let _ = notify_tx.send(()).await;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "PgListener connect failed, will retry");
                        sleep(LISTEN_RETRY_DELAY).await;
                    }
                }
            }
        });

        let (reaper_shutdown_tx, mut reaper_shutdown_rx) = mpsc::channel::<()>(1);
        if settings.stale_job_reap_interval_secs > 0 {
            let repository = repository.clone();
            let reap_interval = Duration::from_secs(settings.stale_job_reap_interval_secs);
            let grace_secs = settings.stale_job_grace_secs;
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(reap_interval);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = interval.tick() => Self::reap(&repository, grace_secs).await,
                        _ = reaper_shutdown_rx.recv() => break,
                    }
                }
            });
        }

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    tracing::info!("Durable job queue worker pool shutting down");
                    let _ = reaper_shutdown_tx.send(()).await;
                    listener.abort();
                    break;
                }
                _ = notify_rx.recv() => {
                    Self::claim_and_dispatch(&repository, &settings, &semaphore, &router).await;
                }
                _ = sleep(poll_interval) => {
                    Self::claim_and_dispatch(&repository, &settings, &semaphore, &router).await;
                }
            }
        }

        tracing::info!("Durable job queue worker pool stopped");
    }

    async fn reap(repository: &JobRepository, grace_secs: u64) {
        let cutoff = i64::try_from(grace_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .and_then(|grace| Utc::now().checked_sub_signed(grace));
        if let Some(cutoff) = cutoff {
            match repository.requeue_stale(cutoff).await {
                Ok(0) => {}
                Ok(requeued) => tracing::warn!(requeued, "Requeued jobs abandoned by their worker"),
                Err(e) => tracing::error!(error = %e, "Stale job reaper failed"),
            }
        }

        let cutoff = Utc::now() - chrono::Duration::hours(FINISHED_JOB_RETENTION_HOURS);
        match repository.purge_finished(cutoff).await {
            Ok(0) => {}
            Ok(purged) => tracing::debug!(purged, "Purged finished jobs"),
            Err(e) => tracing::error!(error = %e, "Finished job purge failed"),
        }
    }

    /// Claim as many due jobs as there are free workers.
    async fn claim_and_dispatch(
        repository: &JobRepository,
        settings: &JobQueueSettings,
        semaphore: &Arc<Semaphore>,
        router: &Weak<JobRouter>,
    ) {
        loop {
            let permit = match semaphore.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    tracing::debug!("No workers available, skipping claim");
                    return;
                }
            };

            let record = match repository.claim_next_job().await {
                Ok(Some(record)) => record,
                Ok(None) => {
                    tracing::trace!("No jobs ready in queue");
                    return;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to claim job");
                    return;
                }
            };

            let repository = repository.clone();
            let max_retries = settings.max_retries;
            let router = router.clone();
            tokio::spawn(async move {
                let _permit = permit;
                Self::process_job(repository, max_retries, router, record).await;
            });
        }
    }

    #[tracing::instrument(skip(repository, router, record), fields(job.id = %record.id, job.type = %record.job_type, job.attempt = record.attempt))]
    async fn process_job(
        repository: JobRepository,
        max_retries: u32,
        router: Weak<JobRouter>,
        record: JobRecord,
    ) {
        let (message, meta) = match delivery_from_record(record.clone()) {
            Ok(delivery) => delivery,
            Err(reason) => {
                tracing::error!(reason = %reason, "Unreadable job row");
                if let Err(e) = repository.mark_failed(record.id, &reason).await {
                    tracing::error!(error = %e, "Failed to mark job as failed");
                }
                return;
            }
        };

        let directive = match router.upgrade() {
            Some(router) => router.dispatch(&message, &meta).await,
            None => {
                tracing::warn!("Job router was dropped, cannot process job");
                JobDirective::Retry { delay: None }
            }
        };

        let settled = match settle(directive, meta.attempt, max_retries) {
            Settlement::Completed => {
                tracing::info!("Job completed successfully");
                repository.mark_completed(record.id).await
            }
            Settlement::Failed(reason) => {
                tracing::error!(reason = %reason, "Job failed, will not retry");
                repository.mark_failed(record.id, &reason).await
            }
            Settlement::RetryAfter(delay) => {
                tracing::info!(
                    retry_count = meta.attempt + 1,
                    backoff_ms = delay.as_millis() as u64,
                    "Scheduling job retry"
                );
                let run_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
                repository.reschedule(record.id, run_at).await
            }
        };

        // The row stays running; the reaper will hand it out again
        if let Err(e) = settled {
            tracing::error!(error = %e, "Failed to record job outcome");
        }
    }

    /// Signals the worker pool to stop claiming new jobs. Does not wait for in-flight jobs.
    pub async fn shutdown(&self) {
        tracing::info!("Initiating durable job queue shutdown");
        let _ = self.shutdown_tx.send(()).await;
    }
}

/// Rebuild the queued envelope and its delivery metadata from a claimed row.
fn delivery_from_record(record: JobRecord) -> Result<(JobMessage, JobMetadata), String> {
    let schema_version = u32::try_from(record.schema_version)
        .map_err(|_| format!("invalid schema version {}", record.schema_version))?;
    let attempt = u32::try_from(record.attempt)
        .map_err(|_| format!("invalid attempt counter {}", record.attempt))?;

    let meta = JobMetadata {
        job_id: record.id.to_string(),
        job_type: record.job_type.clone(),
        attempt,
        priority: Priority::from_i32(record.priority),
        enqueued_at: record.created_at,
    };
    let message = JobMessage {
        job_type: record.job_type,
        schema_version,
        payload: record.payload,
    };
    Ok((message, meta))
}

#[async_trait]
impl JobQueue for PgJobQueue {
    #[tracing::instrument(skip(self, message), fields(job.type = %message.job_type))]
    async fn enqueue(
        &self,
        message: JobMessage,
        priority: Priority,
        delay: Option<Duration>,
    ) -> Result<String> {
        let run_at = match delay {
            Some(delay) => Utc::now() + chrono::Duration::from_std(delay)?,
            None => Utc::now(),
        };
        let schema_version = i32::try_from(message.schema_version)?;

        let id = self
            .repository
            .create_job(
                &message.job_type,
                schema_version,
                &message.payload,
                priority.as_i32(),
                run_at,
            )
            .await?;

        tracing::info!(job_id = %id, priority = priority.as_i32(), "Job submitted to queue");
        Ok(id.to_string())
    }
}
