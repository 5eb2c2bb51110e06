//! Verita Core Library
//!
//! This crate provides the domain models, error types and configuration shared by
//! every Verita component: processors, analysis results, model results, cached
//! summaries and the throttling vocabulary.

pub mod config;
pub mod error;
pub mod job_error;
pub mod models;

// Re-export commonly used types
pub use config::{Config, JobQueueSettings, ThrottleConfig};
pub use error::{AppError, ErrorMetadata, LogLevel};
pub use job_error::{JobError, JobResultExt};
