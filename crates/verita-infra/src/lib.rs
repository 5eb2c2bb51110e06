//! Verita Infrastructure Library
//!
//! Shared infrastructure for Verita services:
//! - Telemetry initialization
//! - Global admission throttling and the exemption gate
//! - Per-action sliding-log rate limiting

pub mod rate_limit;
pub mod telemetry;

pub use rate_limit::{
    Admission, ExemptionGate, RateDecision, SlidingLogLimiter, ThrottleGuard,
};
pub use telemetry::{init_telemetry, shutdown_telemetry};
