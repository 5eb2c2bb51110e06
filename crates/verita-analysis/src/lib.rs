//! Verita Analysis
//!
//! The coordination engine: which processors still need to run for a media
//! item, dispatching them once, folding completions back in from Starters,
//! Checkers and webhooks, and deciding when the cached summary must be rewritten.

pub mod admin;
pub mod cache;
pub mod coordinator;
pub mod error;
pub mod jobs;
pub mod resolver;
pub mod webhook;

pub use admin::{ResetReport, TimeoutSweeper};
pub use cache::{should_update_results, CacheDecision, Reconciliation};
pub use coordinator::{
    AnalysisCoordinator, AnalysisFailure, BulkReport, CheckOptions, CheckOutcome,
    PendingAnalysis, ToStart,
};
pub use error::CoordinatorError;
pub use jobs::{
    RefreshResultsHandler, RefreshResultsJob, RefreshResultsScheduler, StartProcessorHandler,
    StartProcessorJob, StartProcessorScheduler, REFRESH_RETRY_DELAY,
};
pub use resolver::{MediaResolver, Resolution, TemplateResolver};
pub use webhook::{request_id_of, WebhookOutcome, WebhookReceiver};
