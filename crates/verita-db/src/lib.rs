//! Verita Database Layer
//!
//! Repositories for analysis job records, media summaries and throttle state,
//! behind storage traits with a Postgres and an in-memory implementation, plus
//! the table backing the durable scheduled-job queue.

pub mod db;
pub mod memory;
pub mod traits;

pub use db::{
    setup_database, AnalysisResultRepository, JobRecord, JobRepository, MediaRepository,
    ThrottleRepository, JOB_NOTIFY_CHANNEL,
};
pub use memory::MemoryStore;
pub use traits::{AnalysisResultStore, MediaStore, ThrottleStore};
