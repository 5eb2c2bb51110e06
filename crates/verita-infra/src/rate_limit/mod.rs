//! Admission control and rate limiting

mod sliding_log;
mod throttle;

pub use sliding_log::{allow, RateDecision, SlidingLogLimiter};
pub use throttle::{hour_window_start, Admission, ExemptionGate, ThrottleGuard};
