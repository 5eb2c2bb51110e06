//! Per-(subject, action) sliding-log rate limiting.
//!
//! A log holds at most `requests` timestamps, most recent first. A new request
//! is allowed when the log is not full yet, or when its oldest kept entry has
//! left the window.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::Mutex;

use verita_core::models::RateLimitRule;
use verita_db::ThrottleStore;

const DEFAULT_SHARDS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    Limited { retry_after_secs: i64 },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed)
    }
}

/// Evaluate one request against a log. Returns the updated log when allowed.
///
/// An entry exactly `duration_seconds` old is outside the window.
pub fn allow(
    now: DateTime<Utc>,
    entries: &[DateTime<Utc>],
    rule: RateLimitRule,
) -> Option<Vec<DateTime<Utc>>> {
    if rule.requests == 0 {
        return None;
    }

    if let Some(nth) = entries.get(rule.requests - 1) {
        if now - *nth < Duration::seconds(rule.duration_seconds) {
            return None;
        }
    }

    let mut updated = Vec::with_capacity(rule.requests);
    updated.push(now);
    updated.extend(entries.iter().take(rule.requests - 1).copied());
    Some(updated)
}

fn retry_after(now: DateTime<Utc>, entries: &[DateTime<Utc>], rule: RateLimitRule) -> i64 {
    entries
        .get(rule.requests.saturating_sub(1))
        .map(|nth| (*nth + Duration::seconds(rule.duration_seconds) - now).num_seconds().max(1))
        .unwrap_or(rule.duration_seconds)
}

/// Sliding-log limiter over a [`ThrottleStore`].
///
/// The load/evaluate/save cycle for a key runs under a shard lock, so callers
/// in one process never lose each other's entries.
#[derive(Clone)]
pub struct SlidingLogLimiter {
    store: Arc<dyn ThrottleStore>,
    shards: Arc<Vec<Mutex<()>>>,
}

impl SlidingLogLimiter {
    pub fn new(store: Arc<dyn ThrottleStore>) -> Self {
        Self::with_shards(store, DEFAULT_SHARDS)
    }

    pub fn with_shards(store: Arc<dyn ThrottleStore>, shard_count: usize) -> Self {
        let shards = (0..shard_count.max(1)).map(|_| Mutex::new(())).collect();
        Self {
            store,
            shards: Arc::new(shards),
        }
    }

    fn shard_index(&self, subject: &str, action: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        (subject, action).hash(&mut hasher);
        (hasher.finish() as usize) % self.shards.len()
    }

    #[tracing::instrument(skip(self), fields(rate_limit.requests = rule.requests, rate_limit.window = rule.duration_seconds))]
    pub async fn check(
        &self,
        subject: &str,
        action: &str,
        rule: RateLimitRule,
    ) -> Result<RateDecision> {
        let _guard = self.shards[self.shard_index(subject, action)].lock().await;

        let now = Utc::now();
        let entries = self.store.load_log(subject, action).await?;
        match allow(now, &entries, rule) {
            Some(updated) => {
                self.store.save_log(subject, action, &updated).await?;
                Ok(RateDecision::Allowed)
            }
            None => {
                let retry_after_secs = retry_after(now, &entries, rule);
                tracing::warn!(retry_after_secs, "Rate limit exceeded");
                Ok(RateDecision::Limited { retry_after_secs })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use verita_db::MemoryStore;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn log(secs: &[i64]) -> Vec<DateTime<Utc>> {
        secs.iter().map(|s| at(*s)).collect()
    }

    #[test]
    fn test_full_log_inside_window_is_denied() {
        let entries = log(&[100, 90, 80, 70, 60]);
        assert_eq!(allow(at(110), &entries, RateLimitRule::new(5, 60)), None);
    }

    #[test]
    fn test_full_log_with_expired_tail_is_allowed() {
        let entries = log(&[100, 90, 80, 70, 60]);
        assert_eq!(
            allow(at(110), &entries, RateLimitRule::new(5, 30)),
            Some(log(&[110, 100, 90, 80, 70]))
        );

        let old = log(&[50, 40, 30, 20, 10]);
        assert_eq!(
            allow(at(110), &old, RateLimitRule::new(5, 30)),
            Some(log(&[110, 50, 40, 30, 20]))
        );
    }

    #[test]
    fn test_empty_and_short_logs() {
        assert_eq!(allow(at(110), &[], RateLimitRule::new(5, 60)), Some(log(&[110])));
        assert_eq!(
            allow(at(110), &log(&[105, 100]), RateLimitRule::new(5, 60)),
            Some(log(&[110, 105, 100]))
        );
        assert_eq!(allow(at(110), &[], RateLimitRule::new(0, 60)), None);
    }

    #[test]
    fn test_window_boundary() {
        let entries = log(&[100]);
        assert_eq!(allow(at(109), &entries, RateLimitRule::new(1, 10)), None);
        assert_eq!(
            allow(at(110), &entries, RateLimitRule::new(1, 10)),
            Some(log(&[110]))
        );
    }

    #[tokio::test]
    async fn test_limiter_persists_log() {
        let store = MemoryStore::new();
        let limiter = SlidingLogLimiter::new(Arc::new(store.clone()));
        let rule = RateLimitRule::new(2, 3600);

        assert!(limiter.check("user-1", "start_analysis", rule).await.unwrap().is_allowed());
        assert!(limiter.check("user-1", "start_analysis", rule).await.unwrap().is_allowed());
        match limiter.check("user-1", "start_analysis", rule).await.unwrap() {
            RateDecision::Limited { retry_after_secs } => assert!(retry_after_secs > 0),
            RateDecision::Allowed => panic!("third request should be limited"),
        }

        // Other subjects and actions have their own logs
        assert!(limiter.check("user-2", "start_analysis", rule).await.unwrap().is_allowed());
        assert!(limiter.check("user-1", "reset_analysis", rule).await.unwrap().is_allowed());
        assert_eq!(store.load_log("user-1", "start_analysis").await.unwrap().len(), 2);
    }
}
