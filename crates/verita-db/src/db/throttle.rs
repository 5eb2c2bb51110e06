use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use verita_core::models::UserCategory;

use crate::traits::ThrottleStore;

#[derive(Clone)]
pub struct ThrottleRepository {
    pool: PgPool,
}

impl ThrottleRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ThrottleStore for ThrottleRepository {
    #[tracing::instrument(skip(self), fields(db.table = "analysis_admissions", db.operation = "insert"))]
    async fn record_admission(
        &self,
        category: UserCategory,
        media_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO analysis_admissions (user_category, media_id, admitted_at) VALUES ($1, $2, $3)",
        )
        .bind(category.to_string())
        .bind(media_id)
        .bind(at)
        .execute(&self.pool)
        .await
        .context("Failed to record analysis admission")?;

        Ok(())
    }

    #[tracing::instrument(skip(self), fields(db.table = "analysis_admissions", db.operation = "count"))]
    async fn count_admissions(&self, category: UserCategory, since: DateTime<Utc>) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(DISTINCT media_id)
            FROM analysis_admissions
            WHERE user_category = $1 AND admitted_at >= $2
            "#,
        )
        .bind(category.to_string())
        .bind(since)
        .fetch_one(&self.pool)
        .await
        .context("Failed to count analysis admissions")?;

        Ok(count)
    }

    #[tracing::instrument(skip(self), fields(db.table = "analysis_admissions", db.operation = "select"))]
    async fn has_admission(
        &self,
        category: UserCategory,
        media_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM analysis_admissions
                WHERE user_category = $1 AND media_id = $2 AND admitted_at >= $3
            )
            "#,
        )
        .bind(category.to_string())
        .bind(media_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await
        .context("Failed to check analysis admission")?;

        Ok(exists)
    }

    #[tracing::instrument(skip(self), fields(db.table = "throttle_logs", db.operation = "select"))]
    async fn load_log(&self, subject: &str, action: &str) -> Result<Vec<DateTime<Utc>>> {
        let entries: Option<Vec<DateTime<Utc>>> = sqlx::query_scalar(
            "SELECT entries FROM throttle_logs WHERE subject = $1 AND action = $2",
        )
        .bind(subject)
        .bind(action)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to load throttle log")?;

        Ok(entries.unwrap_or_default())
    }

    #[tracing::instrument(skip(self, entries), fields(db.table = "throttle_logs", db.operation = "upsert"))]
    async fn save_log(&self, subject: &str, action: &str, entries: &[DateTime<Utc>]) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO throttle_logs (subject, action, entries)
            VALUES ($1, $2, $3)
            ON CONFLICT (subject, action) DO UPDATE SET entries = EXCLUDED.entries
            "#,
        )
        .bind(subject)
        .bind(action)
        .bind(entries)
        .execute(&self.pool)
        .await
        .context("Failed to save throttle log")?;

        Ok(())
    }
}
