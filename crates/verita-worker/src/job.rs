//! Scheduled jobs
//!
//! [`ScheduledJob`] pairs a versioned payload type with its handler. Scheduling
//! serializes the payload onto a [`JobQueue`]; running validates the raw payload
//! against the current schema, deserializes it and turns the handler's result
//! into a [`JobDirective`] for the queue. Delivery is at-least-once and may be
//! out of order, so handlers re-read persisted state before mutating it.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use verita_core::models::Priority;
use verita_core::JobError;

use crate::schema::{check_additive, PayloadSchema, SchemaEvolutionError};

/// What the queue should do with a job after a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobDirective {
    Complete,
    /// Run again later. `None` lets the queue pick its backoff.
    Retry { delay: Option<Duration> },
    Failed { reason: String },
}

/// Delivery details handed to the handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobMetadata {
    pub job_id: String,
    pub job_type: String,
    /// 0 on first delivery.
    pub attempt: u32,
    pub priority: Priority,
    pub enqueued_at: DateTime<Utc>,
}

/// Envelope stored on the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMessage {
    pub job_type: String,
    pub schema_version: u32,
    pub payload: JsonValue,
}

/// An external priority queue.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue a message; returns the job id.
    async fn enqueue(
        &self,
        message: JobMessage,
        priority: Priority,
        delay: Option<Duration>,
    ) -> Result<String>;
}

/// A payload type with a versioned, additive-only schema.
pub trait JobPayload: Serialize + DeserializeOwned + Send + Sync + 'static {
    const JOB_TYPE: &'static str;

    /// Every schema version ever shipped, oldest first. The last one is current.
    fn schema_history() -> Vec<PayloadSchema>;

    /// At least one payload per shipped version, as that version wrote it.
    fn schema_samples() -> Vec<(u32, JsonValue)>;
}

/// Check that `P`'s history is additive and that every version's samples
/// still validate and deserialize into `P`. Returns the current schema.
pub fn check_history<P: JobPayload>() -> Result<PayloadSchema, SchemaEvolutionError> {
    let history = P::schema_history();
    check_additive(P::JOB_TYPE, &history)?;
    let current = history
        .last()
        .cloned()
        .ok_or_else(|| SchemaEvolutionError::Empty {
            payload: P::JOB_TYPE.to_string(),
        })?;

    let samples = P::schema_samples();
    for schema in &history {
        let mut found = false;
        for (_, sample) in samples.iter().filter(|(v, _)| *v == schema.version) {
            found = true;
            let rejected = |reason: String| SchemaEvolutionError::RejectedSample {
                payload: P::JOB_TYPE.to_string(),
                version: schema.version,
                reason,
            };
            schema.validate(sample).map_err(rejected)?;
            current.validate(sample).map_err(rejected)?;
            serde_json::from_value::<P>(sample.clone()).map_err(|e| rejected(e.to_string()))?;
        }
        if !found {
            return Err(SchemaEvolutionError::MissingSample {
                payload: P::JOB_TYPE.to_string(),
                version: schema.version,
            });
        }
    }

    Ok(current)
}

#[async_trait]
pub trait JobHandler<P: JobPayload>: Send + Sync {
    async fn handle(&self, payload: P, meta: &JobMetadata) -> Result<JobDirective, JobError>;
}

pub struct ScheduledJob<P: JobPayload, H: JobHandler<P>> {
    queue: Arc<dyn JobQueue>,
    handler: H,
    schema: PayloadSchema,
    _payload: PhantomData<fn() -> P>,
}

impl<P: JobPayload, H: JobHandler<P>> ScheduledJob<P, H> {
    /// Fails when the payload's schema history does not pass [`check_history`].
    pub fn new(queue: Arc<dyn JobQueue>, handler: H) -> Result<Self, SchemaEvolutionError> {
        let schema = check_history::<P>()?;

        Ok(Self {
            queue,
            handler,
            schema,
            _payload: PhantomData,
        })
    }

    #[tracing::instrument(skip(self, payload), fields(job.type = P::JOB_TYPE))]
    pub async fn schedule(
        &self,
        priority: Priority,
        payload: &P,
        delay: Option<Duration>,
    ) -> Result<String> {
        let message = JobMessage {
            job_type: P::JOB_TYPE.to_string(),
            schema_version: self.schema.version,
            payload: serde_json::to_value(payload).context("Failed to serialize job payload")?,
        };
        let job_id = self.queue.enqueue(message, priority, delay).await?;
        tracing::debug!(job_id = %job_id, "Job scheduled");
        Ok(job_id)
    }

    #[tracing::instrument(skip(self, raw, meta), fields(job.id = %meta.job_id, job.type = P::JOB_TYPE, job.attempt = meta.attempt))]
    pub async fn run(&self, raw: &JsonValue, meta: &JobMetadata) -> JobDirective {
        if let Err(reason) = self.schema.validate(raw) {
            tracing::error!(reason = %reason, "Rejecting malformed job payload");
            return JobDirective::Failed { reason };
        }
        let payload: P = match serde_json::from_value(raw.clone()) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(error = %e, "Failed to deserialize job payload");
                return JobDirective::Failed {
                    reason: e.to_string(),
                };
            }
        };

        match self.handler.handle(payload, meta).await {
            Ok(directive) => directive,
            Err(e) if e.is_recoverable() => {
                tracing::warn!(error = %e, "Job failed, will retry");
                JobDirective::Retry { delay: None }
            }
            Err(e) => {
                tracing::error!(error = %e, "Job failed with unrecoverable error");
                JobDirective::Failed {
                    reason: e.to_string(),
                }
            }
        }
    }
}

/// Type-erased job, so one router can dispatch every payload type.
#[async_trait]
pub trait RunnableJob: Send + Sync {
    fn job_type(&self) -> &'static str;

    async fn run_raw(&self, raw: &JsonValue, meta: &JobMetadata) -> JobDirective;
}

#[async_trait]
impl<P: JobPayload, H: JobHandler<P>> RunnableJob for ScheduledJob<P, H> {
    fn job_type(&self) -> &'static str {
        P::JOB_TYPE
    }

    async fn run_raw(&self, raw: &JsonValue, meta: &JobMetadata) -> JobDirective {
        self.run(raw, meta).await
    }
}

/// Routes queued messages to their job by type.
#[derive(Default)]
pub struct JobRouter {
    jobs: HashMap<&'static str, Arc<dyn RunnableJob>>,
}

impl JobRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, job: Arc<dyn RunnableJob>) -> &mut Self {
        self.jobs.insert(job.job_type(), job);
        self
    }

    pub fn job_types(&self) -> impl Iterator<Item = &&'static str> {
        self.jobs.keys()
    }

    pub async fn dispatch(&self, message: &JobMessage, meta: &JobMetadata) -> JobDirective {
        match self.jobs.get(message.job_type.as_str()) {
            Some(job) => job.run_raw(&message.payload, meta).await,
            None => JobDirective::Failed {
                reason: format!("no handler registered for job type '{}'", message.job_type),
            },
        }
    }
}
