//! Configuration module
//!
//! Settings for the API service, the job queue and the throttling layer, read
//! from the process environment (and a `.env` file when present).

use std::collections::HashMap;
use std::env;
use std::time::Duration;

use uuid::Uuid;

use crate::models::{RateLimitRule, UserCategory};

const SERVER_PORT: u16 = 4000;
const MAX_CONNECTIONS: u32 = 20;
const JOB_QUEUE_MAX_WORKERS: usize = 4;
const JOB_QUEUE_MAX_RETRIES: u32 = 5;
const JOB_QUEUE_POLL_INTERVAL_MS: u64 = 1000;
const JOB_QUEUE_STALE_REAP_INTERVAL_SECS: u64 = 60;
const JOB_QUEUE_STALE_GRACE_SECS: u64 = 900;
const PROCESSOR_TIMEOUT_SWEEP_SECS: u64 = 60;
const THROTTLE_ANONYMOUS_PER_HOUR: u32 = 50;
const THROTTLE_REGISTERED_PER_HOUR: u32 = 500;
const THROTTLE_API_PER_HOUR: u32 = 2000;

const MEDIA_URL_TEMPLATE: &str = "http://localhost:4000/media/{id}";

const RATE_LIMIT_PREFIX: &str = "RATE_LIMIT_";

/// Actions that are rate limited unless overridden by `RATE_LIMIT_<ACTION>`.
const DEFAULT_RATE_LIMITS: &[(&str, usize, i64)] =
    &[("start_analysis", 10, 60), ("reset_analysis", 5, 300)];

/// Worker pool settings for the scheduled-job queue
#[derive(Clone, Debug, PartialEq)]
pub struct JobQueueSettings {
    pub max_workers: usize,
    pub max_retries: u32,
    pub poll_interval_ms: u64,
    /// How often the Postgres queue looks for abandoned running jobs. 0 = never.
    pub stale_job_reap_interval_secs: u64,
    /// A job running longer than this is assumed lost with its worker and is requeued.
    pub stale_job_grace_secs: u64,
}

impl Default for JobQueueSettings {
    fn default() -> Self {
        Self {
            max_workers: JOB_QUEUE_MAX_WORKERS,
            max_retries: JOB_QUEUE_MAX_RETRIES,
            poll_interval_ms: JOB_QUEUE_POLL_INTERVAL_MS,
            stale_job_reap_interval_secs: JOB_QUEUE_STALE_REAP_INTERVAL_SECS,
            stale_job_grace_secs: JOB_QUEUE_STALE_GRACE_SECS,
        }
    }
}

impl JobQueueSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Hourly per-category admission ceilings and the exemption gate.
#[derive(Clone, Debug, PartialEq)]
pub struct ThrottleConfig {
    pub anonymous_per_hour: u32,
    pub registered_per_hour: u32,
    pub api_per_hour: u32,
    pub exempt_user_ids: Vec<Uuid>,
    pub exempt_emails: Vec<String>,
    pub exempt_domains: Vec<String>,
    pub exempt_min_role_level: Option<i32>,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            anonymous_per_hour: THROTTLE_ANONYMOUS_PER_HOUR,
            registered_per_hour: THROTTLE_REGISTERED_PER_HOUR,
            api_per_hour: THROTTLE_API_PER_HOUR,
            exempt_user_ids: Vec::new(),
            exempt_emails: Vec::new(),
            exempt_domains: Vec::new(),
            exempt_min_role_level: None,
        }
    }
}

impl ThrottleConfig {
    pub fn ceiling(&self, category: UserCategory) -> u32 {
        match category {
            UserCategory::Anonymous => self.anonymous_per_hour,
            UserCategory::Registered => self.registered_per_hour,
            UserCategory::Api => self.api_per_hour,
        }
    }
}

/// Application configuration
#[derive(Clone, Debug)]
pub struct Config {
    pub server_port: u16,
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub environment: String,
    /// Path of the JSON processor catalog.
    pub processors_config: Option<String>,
    pub job_queue: JobQueueSettings,
    /// Interval between timeout sweeps. 0 = disabled.
    pub processor_timeout_sweep_secs: u64,
    pub throttle: ThrottleConfig,
    /// Per-action sliding-log rules, keyed by lowercase action name.
    pub rate_limits: HashMap<String, RateLimitRule>,
    /// Public base URL providers call back on, e.g. `https://verita.example/webhooks`.
    pub webhook_base_url: Option<String>,
    /// Where providers fetch a track from; `{id}` is replaced by the track id.
    pub media_url_template: String,
}

impl Config {
    pub fn from_env() -> Result<Self, anyhow::Error> {
        dotenvy::dotenv().ok();
        Self::from_vars(env::vars())
    }

    /// Build the configuration from an explicit set of variables.
    pub fn from_vars(vars: impl IntoIterator<Item = (String, String)>) -> Result<Self, anyhow::Error> {
        let vars: HashMap<String, String> = vars.into_iter().collect();
        let get = |key: &str| vars.get(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let server_port = match get("PORT") {
            Some(port) => port
                .parse()
                .map_err(|_| anyhow::anyhow!("PORT must be a valid number"))?,
            None => SERVER_PORT,
        };

        let environment = get("ENVIRONMENT")
            .or_else(|| get("APP_ENV"))
            .unwrap_or_else(|| "development".to_string());

        let job_queue = JobQueueSettings {
            max_workers: parse_or(get("JOB_QUEUE_MAX_WORKERS"), JOB_QUEUE_MAX_WORKERS),
            max_retries: parse_or(get("JOB_QUEUE_MAX_RETRIES"), JOB_QUEUE_MAX_RETRIES),
            poll_interval_ms: parse_or(get("JOB_QUEUE_POLL_INTERVAL_MS"), JOB_QUEUE_POLL_INTERVAL_MS),
            stale_job_reap_interval_secs: parse_or(
                get("JOB_QUEUE_STALE_REAP_INTERVAL_SECS"),
                JOB_QUEUE_STALE_REAP_INTERVAL_SECS,
            ),
            stale_job_grace_secs: parse_or(get("JOB_QUEUE_STALE_GRACE_SECS"), JOB_QUEUE_STALE_GRACE_SECS),
        };

        let exempt_user_ids = split_list(get("THROTTLE_EXEMPT_USER_IDS"))
            .iter()
            .map(|id| {
                Uuid::parse_str(id).map_err(|_| {
                    anyhow::anyhow!("THROTTLE_EXEMPT_USER_IDS contains an invalid UUID: {}", id)
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let exempt_min_role_level = match get("THROTTLE_EXEMPT_MIN_ROLE_LEVEL") {
            Some(level) => Some(level.parse().map_err(|_| {
                anyhow::anyhow!("THROTTLE_EXEMPT_MIN_ROLE_LEVEL must be a valid number")
            })?),
            None => None,
        };

        let throttle = ThrottleConfig {
            anonymous_per_hour: parse_or(get("THROTTLE_ANONYMOUS_PER_HOUR"), THROTTLE_ANONYMOUS_PER_HOUR),
            registered_per_hour: parse_or(
                get("THROTTLE_REGISTERED_PER_HOUR"),
                THROTTLE_REGISTERED_PER_HOUR,
            ),
            api_per_hour: parse_or(get("THROTTLE_API_PER_HOUR"), THROTTLE_API_PER_HOUR),
            exempt_user_ids,
            exempt_emails: split_list(get("THROTTLE_EXEMPT_EMAILS"))
                .into_iter()
                .map(|e| e.to_lowercase())
                .collect(),
            exempt_domains: split_list(get("THROTTLE_EXEMPT_DOMAINS"))
                .into_iter()
                .map(|d| d.trim_start_matches('@').to_lowercase())
                .collect(),
            exempt_min_role_level,
        };

        let mut rate_limits: HashMap<String, RateLimitRule> = DEFAULT_RATE_LIMITS
            .iter()
            .map(|(action, requests, secs)| (action.to_string(), RateLimitRule::new(*requests, *secs)))
            .collect();
        for (key, value) in &vars {
            if let Some(action) = key.strip_prefix(RATE_LIMIT_PREFIX) {
                let rule: RateLimitRule = value
                    .parse()
                    .map_err(|e| anyhow::anyhow!("{} is invalid: {}", key, e))?;
                rate_limits.insert(action.to_lowercase(), rule);
            }
        }

        Ok(Self {
            server_port,
            database_url: get("DATABASE_URL"),
            db_max_connections: parse_or(get("DB_MAX_CONNECTIONS"), MAX_CONNECTIONS),
            environment,
            processors_config: get("PROCESSORS_CONFIG"),
            job_queue,
            processor_timeout_sweep_secs: parse_or(
                get("PROCESSOR_TIMEOUT_SWEEP_SECS"),
                PROCESSOR_TIMEOUT_SWEEP_SECS,
            ),
            throttle,
            rate_limits,
            webhook_base_url: get("WEBHOOK_BASE_URL").map(|u| u.trim_end_matches('/').to_string()),
            media_url_template: get("MEDIA_URL_TEMPLATE")
                .unwrap_or_else(|| MEDIA_URL_TEMPLATE.to_string()),
        })
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if let Some(url) = &self.database_url {
            if !url.starts_with("postgres://") && !url.starts_with("postgresql://") {
                return Err(anyhow::anyhow!(
                    "DATABASE_URL must be a valid PostgreSQL connection string"
                ));
            }
        } else if self.is_production() {
            return Err(anyhow::anyhow!("DATABASE_URL is required in production"));
        }

        if !self.media_url_template.contains("{id}") {
            return Err(anyhow::anyhow!("MEDIA_URL_TEMPLATE must contain an {{id}} placeholder"));
        }

        if self.job_queue.max_workers == 0 {
            return Err(anyhow::anyhow!("JOB_QUEUE_MAX_WORKERS must be at least 1"));
        }

        // A zero grace period would requeue jobs that are still running
        if self.job_queue.stale_job_reap_interval_secs > 0 && self.job_queue.stale_job_grace_secs == 0 {
            return Err(anyhow::anyhow!(
                "JOB_QUEUE_STALE_GRACE_SECS must be positive while stale job reaping is enabled"
            ));
        }

        for (action, rule) in &self.rate_limits {
            if rule.requests == 0 || rule.duration_seconds <= 0 {
                return Err(anyhow::anyhow!(
                    "RATE_LIMIT_{} must allow at least one request over a positive duration",
                    action.to_uppercase()
                ));
            }
        }

        Ok(())
    }

    /// Check if the application is running in production mode
    pub fn is_production(&self) -> bool {
        let env = self.environment.to_lowercase();
        env == "production" || env == "prod"
    }

    pub fn rate_limit(&self, action: &str) -> Option<RateLimitRule> {
        self.rate_limits.get(action).copied()
    }

    pub fn processor_timeout_sweep_interval(&self) -> Option<Duration> {
        (self.processor_timeout_sweep_secs > 0)
            .then(|| Duration::from_secs(self.processor_timeout_sweep_secs))
    }
}

fn parse_or<T: std::str::FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn split_list(value: Option<String>) -> Vec<String> {
    value
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}
