//! Verita Worker
//!
//! Scheduled jobs over a priority queue, the additive-only payload schema check,
//! an in-process queue and a durable Postgres queue.

pub mod job;
pub mod local;
pub mod postgres;
pub mod retry;
pub mod schema;

pub use job::{
    check_history, JobDirective, JobHandler, JobMessage, JobMetadata, JobPayload, JobQueue,
    JobRouter, RunnableJob, ScheduledJob,
};
pub use local::{JobStatus, LocalJobQueue};
pub use postgres::PgJobQueue;
pub use retry::MAX_RETRY_BACKOFF_SECS;
pub use schema::{check_additive, FieldKind, FieldSpec, PayloadSchema, SchemaEvolutionError};
