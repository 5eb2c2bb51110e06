//! How a handler's [`JobDirective`] settles a delivery, shared by every queue.

use std::time::Duration;

use crate::job::JobDirective;

/// Maximum delay in seconds before retrying a failed job.
pub const MAX_RETRY_BACKOFF_SECS: u64 = 300;

/// Backoff in seconds for a given attempt (exponential with cap).
#[inline]
pub(crate) fn compute_retry_backoff_seconds(attempt: u32) -> u64 {
    2_u64.saturating_pow(attempt).min(MAX_RETRY_BACKOFF_SECS)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Settlement {
    Completed,
    Failed(String),
    RetryAfter(Duration),
}

/// `attempt` is the one that just ran, 0 on first delivery.
pub(crate) fn settle(directive: JobDirective, attempt: u32, max_retries: u32) -> Settlement {
    match directive {
        JobDirective::Complete => Settlement::Completed,
        JobDirective::Failed { reason } => Settlement::Failed(reason),
        JobDirective::Retry { .. } if attempt >= max_retries => {
            Settlement::Failed("exceeded max retries".to_string())
        }
        JobDirective::Retry { delay } => Settlement::RetryAfter(
            delay.unwrap_or_else(|| Duration::from_secs(compute_retry_backoff_seconds(attempt))),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_backoff_exponential_then_capped() {
        assert_eq!(compute_retry_backoff_seconds(0), 1);
        assert_eq!(compute_retry_backoff_seconds(1), 2);
        assert_eq!(compute_retry_backoff_seconds(8), 256);
        assert_eq!(compute_retry_backoff_seconds(9), MAX_RETRY_BACKOFF_SECS);
        assert_eq!(compute_retry_backoff_seconds(64), MAX_RETRY_BACKOFF_SECS);
    }

    #[test]
    fn retry_uses_handler_delay_or_backoff() {
        let explicit = JobDirective::Retry {
            delay: Some(Duration::from_millis(250)),
        };
        assert_eq!(
            settle(explicit, 0, 3),
            Settlement::RetryAfter(Duration::from_millis(250))
        );
        assert_eq!(
            settle(JobDirective::Retry { delay: None }, 2, 3),
            Settlement::RetryAfter(Duration::from_secs(4))
        );
    }

    #[test]
    fn retry_past_budget_fails() {
        assert_eq!(
            settle(JobDirective::Retry { delay: None }, 3, 3),
            Settlement::Failed("exceeded max retries".to_string())
        );
        assert_eq!(
            settle(JobDirective::Retry { delay: None }, 0, 0),
            Settlement::Failed("exceeded max retries".to_string())
        );
    }

    #[test]
    fn terminal_directives_pass_through() {
        assert_eq!(settle(JobDirective::Complete, 9, 0), Settlement::Completed);
        assert_eq!(
            settle(
                JobDirective::Failed {
                    reason: "bad payload".to_string()
                },
                0,
                5
            ),
            Settlement::Failed("bad payload".to_string())
        );
    }
}
