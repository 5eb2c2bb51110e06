//! Global admission throttle.
//!
//! Each user category has an hourly ceiling on the number of distinct media
//! entering analysis. Windows are aligned to the hour. A media item admitted
//! once in a window can be re-analyzed in that window without counting again.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use verita_core::models::{Caller, UserCategory};
use verita_core::ThrottleConfig;
use verita_db::ThrottleStore;

pub fn hour_window_start(now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let ts = now.timestamp();
    DateTime::from_timestamp(ts - ts.rem_euclid(3600), 0)
        .with_context(|| format!("Timestamp out of range: {}", ts))
}

/// Callers that bypass the global throttle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExemptionGate {
    user_ids: Vec<Uuid>,
    emails: Vec<String>,
    domains: Vec<String>,
    min_role_level: Option<i32>,
}

impl ExemptionGate {
    pub fn from_config(config: &ThrottleConfig) -> Self {
        Self {
            user_ids: config.exempt_user_ids.clone(),
            emails: config.exempt_emails.clone(),
            domains: config.exempt_domains.clone(),
            min_role_level: config.exempt_min_role_level,
        }
    }

    pub fn is_exempt(&self, caller: &Caller) -> bool {
        if caller.user_id.is_some_and(|id| self.user_ids.contains(&id)) {
            return true;
        }
        if let Some(email) = caller.email.as_deref() {
            if self.emails.iter().any(|e| e.eq_ignore_ascii_case(email)) {
                return true;
            }
        }
        if let Some(domain) = caller.email_domain() {
            if self.domains.iter().any(|d| d.eq_ignore_ascii_case(domain)) {
                return true;
            }
        }
        self.min_role_level
            .is_some_and(|min| caller.is_authenticated() && caller.role_level >= min)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    /// Not counted against the category ceiling.
    Exempt,
    Throttled {
        category: UserCategory,
        ceiling: u32,
        resets_at: DateTime<Utc>,
    },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        !matches!(self, Admission::Throttled { .. })
    }
}

#[derive(Clone)]
pub struct ThrottleGuard {
    store: Arc<dyn ThrottleStore>,
    config: ThrottleConfig,
    gate: ExemptionGate,
    // Count-then-record must not interleave within a process
    lock: Arc<Mutex<()>>,
}

impl ThrottleGuard {
    pub fn new(store: Arc<dyn ThrottleStore>, config: ThrottleConfig) -> Self {
        let gate = ExemptionGate::from_config(&config);
        Self {
            store,
            config,
            gate,
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn gate(&self) -> &ExemptionGate {
        &self.gate
    }

    pub async fn admit(&self, caller: &Caller, media_id: Uuid) -> Result<Admission> {
        self.admit_at(caller, media_id, Utc::now()).await
    }

    #[tracing::instrument(skip(self, caller), fields(user.category = %caller.category, media_id = %media_id))]
    pub async fn admit_at(
        &self,
        caller: &Caller,
        media_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Admission> {
        if self.gate.is_exempt(caller) {
            tracing::debug!("Caller exempt from throttle");
            return Ok(Admission::Exempt);
        }

        let category = caller.category;
        let window_start = hour_window_start(now)?;
        let _guard = self.lock.lock().await;

        if self
            .store
            .has_admission(category, media_id, window_start)
            .await?
        {
            return Ok(Admission::Admitted);
        }

        let ceiling = self.config.ceiling(category);
        let admitted = self.store.count_admissions(category, window_start).await?;
        if admitted >= i64::from(ceiling) {
            tracing::warn!(admitted, ceiling, "Analysis throttled for category");
            return Ok(Admission::Throttled {
                category,
                ceiling,
                resets_at: window_start + Duration::hours(1),
            });
        }

        self.store.record_admission(category, media_id, now).await?;
        Ok(Admission::Admitted)
    }
}
