//! In-process job queue: priority ordering, delayed delivery, worker pool and retry.
//!
//! Shutdown: [`LocalJobQueue::shutdown`] signals the pool to stop; it does not wait for
//! in-flight jobs.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Notify, Semaphore};
use tokio::time::sleep;
use uuid::Uuid;

use verita_core::models::Priority;
use verita_core::JobQueueSettings;

use crate::job::{JobDirective, JobMessage, JobMetadata, JobQueue, JobRouter};
use crate::retry::{settle, Settlement};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Scheduled,
    Running,
    Completed,
    Failed(String),
}

impl JobStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed(_))
    }
}

#[derive(Debug, Clone)]
struct QueuedJob {
    job_id: String,
    message: JobMessage,
    priority: Priority,
    run_at: DateTime<Utc>,
    enqueued_at: DateTime<Utc>,
    attempt: u32,
    seq: u64,
}

impl QueuedJob {
    fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.run_at <= now
    }
}

impl PartialEq for QueuedJob {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for QueuedJob {}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedJob {
    /// Max-heap order: higher priority first, then FIFO.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct QueueState {
    ready: BinaryHeap<QueuedJob>,
    delayed: Vec<QueuedJob>,
    statuses: HashMap<String, JobStatus>,
    seq: u64,
}

impl QueueState {
    fn push(&mut self, mut job: QueuedJob, now: DateTime<Utc>) {
        self.seq += 1;
        job.seq = self.seq;
        self.statuses.insert(job.job_id.clone(), JobStatus::Scheduled);
        if job.is_ready(now) {
            self.ready.push(job);
        } else {
            self.delayed.push(job);
        }
    }

    fn pop_ready(&mut self, now: DateTime<Utc>) -> Option<QueuedJob> {
        let (due, waiting): (Vec<_>, Vec<_>) =
            self.delayed.drain(..).partition(|j| j.is_ready(now));
        self.delayed = waiting;
        self.ready.extend(due);
        self.ready.pop()
    }
}

struct Shared {
    state: Mutex<QueueState>,
    wake: Notify,
    settings: JobQueueSettings,
}

#[derive(Clone)]
pub struct LocalJobQueue {
    shared: Arc<Shared>,
    shutdown_tx: mpsc::Sender<()>,
    shutdown_rx: Arc<Mutex<Option<mpsc::Receiver<()>>>>,
}

impl LocalJobQueue {
    /// Create the queue. Jobs can be enqueued right away; nothing runs until [`start`](Self::start).
    pub fn new(settings: JobQueueSettings) -> Self {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState::default()),
                wake: Notify::new(),
                settings,
            }),
            shutdown_tx,
            shutdown_rx: Arc::new(Mutex::new(Some(shutdown_rx))),
        }
    }

    /// Spawn the worker pool. The router is held weakly; once it is dropped,
    /// claimed jobs fail and are retried.
    pub async fn start(&self, router: Weak<JobRouter>) -> Result<()> {
        let shutdown_rx = self
            .shutdown_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| anyhow::anyhow!("Job queue worker pool already started"))?;

        let shared = self.shared.clone();
        tokio::spawn(async move {
            Self::worker_pool(shared, router, shutdown_rx).await;
        });
        Ok(())
    }

    pub async fn status(&self, job_id: &str) -> Option<JobStatus> {
        self.shared.state.lock().await.statuses.get(job_id).cloned()
    }

    /// Jobs waiting to run, including delayed ones.
    pub async fn pending(&self) -> usize {
        let state = self.shared.state.lock().await;
        state.ready.len() + state.delayed.len()
    }

    async fn worker_pool(
        shared: Arc<Shared>,
        router: Weak<JobRouter>,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) {
        tracing::info!(
            max_workers = shared.settings.max_workers,
            poll_interval_ms = shared.settings.poll_interval_ms,
            "Job queue worker pool started"
        );

        let semaphore = Arc::new(Semaphore::new(shared.settings.max_workers.max(1)));
        let poll_interval = shared.settings.poll_interval();

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    tracing::info!("Job queue worker pool shutting down");
                    break;
                }
                _ = shared.wake.notified() => {
                    Self::claim_and_dispatch(&shared, &semaphore, &router).await;
                }
                _ = sleep(poll_interval) => {
                    Self::claim_and_dispatch(&shared, &semaphore, &router).await;
                }
            }
        }

        tracing::info!("Job queue worker pool stopped");
    }

    /// Claim as many ready jobs as there are free workers.
    async fn claim_and_dispatch(
        shared: &Arc<Shared>,
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

            let job = {
                let mut state = shared.state.lock().await;
                let job = state.pop_ready(Utc::now());
                if let Some(job) = &job {
                    state.statuses.insert(job.job_id.clone(), JobStatus::Running);
                }
                job
            };

            let Some(job) = job else {
                drop(permit);
                tracing::trace!("No jobs ready in queue");
                return;
            };

            let shared = shared.clone();
            let router = router.clone();
            tokio::spawn(async move {
                let _permit = permit;
                Self::process_job(shared, router, job).await;
            });
        }
    }

    #[tracing::instrument(skip(shared, router, job), fields(job.id = %job.job_id, job.type = %job.message.job_type, job.attempt = job.attempt))]
    async fn process_job(shared: Arc<Shared>, router: Weak<JobRouter>, job: QueuedJob) {
        let meta = JobMetadata {
            job_id: job.job_id.clone(),
            job_type: job.message.job_type.clone(),
            attempt: job.attempt,
            priority: job.priority,
            enqueued_at: job.enqueued_at,
        };

        let directive = match router.upgrade() {
            Some(router) => router.dispatch(&job.message, &meta).await,
            None => {
                tracing::warn!("Job router was dropped, cannot process job");
                JobDirective::Retry { delay: None }
            }
        };

        let mut state = shared.state.lock().await;
        match settle(directive, job.attempt, shared.settings.max_retries) {
            Settlement::Completed => {
                state.statuses.insert(job.job_id.clone(), JobStatus::Completed);
                tracing::info!("Job completed successfully");
            }
            Settlement::Failed(reason) => {
                tracing::error!(reason = %reason, "Job failed, will not retry");
                state.statuses.insert(job.job_id.clone(), JobStatus::Failed(reason));
            }
            Settlement::RetryAfter(delay) => {
                tracing::info!(
                    retry_count = job.attempt + 1,
                    backoff_ms = delay.as_millis() as u64,
                    "Scheduling job retry"
                );
                let now = Utc::now();
                let retry = QueuedJob {
                    run_at: now + chrono::Duration::from_std(delay).unwrap_or_default(),
                    attempt: job.attempt + 1,
                    ..job
                };
                state.push(retry, now);
                drop(state);
                shared.wake.notify_one();
            }
        }
    }

    /// Signals the worker pool to stop claiming new jobs. Does not wait for in-flight jobs.
    pub async fn shutdown(&self) {
        tracing::info!("Initiating job queue shutdown");
        let _ = self.shutdown_tx.send(()).await;
    }
}

#[async_trait]
impl JobQueue for LocalJobQueue {
    #[tracing::instrument(skip(self, message), fields(job.type = %message.job_type))]
    async fn enqueue(
        &self,
        message: JobMessage,
        priority: Priority,
        delay: Option<Duration>,
    ) -> Result<String> {
        let now = Utc::now();
        let run_at = match delay {
            Some(delay) => now + chrono::Duration::from_std(delay)?,
            None => now,
        };
        let job_id = Uuid::new_v4().to_string();

        self.shared.state.lock().await.push(
            QueuedJob {
                job_id: job_id.clone(),
                message,
                priority,
                run_at,
                enqueued_at: now,
                attempt: 0,
                seq: 0,
            },
            now,
        );
        self.shared.wake.notify_one();

        tracing::info!(job_id = %job_id, priority = priority.as_i32(), "Job submitted to queue");
        Ok(job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message(tag: &str) -> JobMessage {
        JobMessage {
            job_type: "test".to_string(),
            schema_version: 1,
            payload: json!({ "tag": tag }),
        }
    }

    #[tokio::test]
    async fn ready_jobs_pop_by_priority_then_fifo() {
        let queue = LocalJobQueue::new(JobQueueSettings::default());
        queue.enqueue(message("low"), Priority::Low, None).await.unwrap();
        queue.enqueue(message("first"), Priority::High, None).await.unwrap();
        queue.enqueue(message("second"), Priority::High, None).await.unwrap();
        queue
            .enqueue(message("later"), Priority::Critical, Some(Duration::from_secs(60)))
            .await
            .unwrap();

        let mut state = queue.shared.state.lock().await;
        let now = Utc::now();
        let order: Vec<_> = std::iter::from_fn(|| state.pop_ready(now))
            .map(|j| j.message.payload["tag"].as_str().unwrap_or_default().to_string())
            .collect();
        assert_eq!(order, vec!["first", "second", "low"]);
        assert_eq!(state.delayed.len(), 1);
    }
}
