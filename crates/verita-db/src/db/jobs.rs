use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::PgPool;
use uuid::Uuid;

/// Channel a NOTIFY is sent on whenever a job is enqueued.
pub const JOB_NOTIFY_CHANNEL: &str = "verita_new_job";

/// A claimed row of `scheduled_jobs`.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct JobRecord {
    pub id: Uuid,
    pub job_type: String,
    pub schema_version: i32,
    pub payload: JsonValue,
    pub priority: i32,
    /// 0 on first delivery.
    pub attempt: i32,
    pub run_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct JobRepository {
    pool: PgPool,
}

impl JobRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert a pending job and wake listening workers.
    #[tracing::instrument(skip(self, payload), fields(db.table = "scheduled_jobs", db.operation = "insert"))]
    pub async fn create_job(
        &self,
        job_type: &str,
        schema_version: i32,
        payload: &JsonValue,
        priority: i32,
        run_at: DateTime<Utc>,
    ) -> Result<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO scheduled_jobs (id, job_type, schema_version, payload, priority, run_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(id)
        .bind(job_type)
        .bind(schema_version)
        .bind(payload)
        .bind(priority)
        .bind(run_at)
        .execute(&self.pool)
        .await
        .context("Failed to insert scheduled job")?;

        // Workers also poll, so a lost notification only delays the job
        if let Err(e) = sqlx::query("SELECT pg_notify($1, '')")
            .bind(JOB_NOTIFY_CHANNEL)
            .execute(&self.pool)
            .await
        {
            tracing::warn!(error = %e, job_id = %id, "Failed to notify workers of new job");
        }

        Ok(id)
    }

    /// Claim the highest-priority due job, oldest first.
    ///
    /// Concurrent workers never claim the same row.
    #[tracing::instrument(skip(self), fields(db.table = "scheduled_jobs", db.operation = "update"))]
    pub async fn claim_next_job(&self) -> Result<Option<JobRecord>> {
        let job = sqlx::query_as::<_, JobRecord>(
            r#"
            UPDATE scheduled_jobs
            SET status = 'running',
                started_at = NOW(),
                updated_at = NOW()
            WHERE id = (
                SELECT id FROM scheduled_jobs
                WHERE status = 'pending' AND run_at <= NOW()
                ORDER BY priority DESC, run_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, job_type, schema_version, payload, priority, attempt, run_at, created_at
            "#,
        )
        .fetch_optional(&self.pool)
        .await
        .context("Failed to claim next scheduled job")?;

        Ok(job)
    }

    #[tracing::instrument(skip(self), fields(db.table = "scheduled_jobs", db.operation = "update"))]
    pub async fn mark_completed(&self, id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE scheduled_jobs
            SET status = 'completed', completed_at = NOW(), updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .context("Failed to mark job as completed")?;

        Ok(())
    }

    #[tracing::instrument(skip(self), fields(db.table = "scheduled_jobs", db.operation = "update"))]
    pub async fn mark_failed(&self, id: Uuid, reason: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE scheduled_jobs
            SET status = 'failed', last_error = $2, completed_at = NOW(), updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(reason)
        .execute(&self.pool)
        .await
        .context("Failed to mark job as failed")?;

        Ok(())
    }

    /// Put a job back as pending for its next attempt.
    #[tracing::instrument(skip(self), fields(db.table = "scheduled_jobs", db.operation = "update"))]
    pub async fn reschedule(&self, id: Uuid, run_at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE scheduled_jobs
            SET status = 'pending',
                attempt = attempt + 1,
                run_at = $2,
                started_at = NULL,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(run_at)
        .execute(&self.pool)
        .await
        .context("Failed to reschedule job")?;

        Ok(())
    }

    /// Requeue jobs claimed before `cutoff` that never finished. The attempt
    /// counter is left alone: the job did not fail, its worker went away.
    #[tracing::instrument(skip(self), fields(db.table = "scheduled_jobs", db.operation = "update"))]
    pub async fn requeue_stale(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_jobs
            SET status = 'pending', started_at = NULL, run_at = NOW(), updated_at = NOW()
            WHERE status = 'running' AND started_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .context("Failed to requeue stale jobs")?;

        Ok(result.rows_affected())
    }

    /// Delete completed and failed jobs that finished before `cutoff`.
    #[tracing::instrument(skip(self), fields(db.table = "scheduled_jobs", db.operation = "delete"))]
    pub async fn purge_finished(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM scheduled_jobs
            WHERE status IN ('completed', 'failed') AND completed_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .context("Failed to purge finished jobs")?;

        Ok(result.rows_affected())
    }

    /// Jobs waiting to run, including delayed ones.
    #[tracing::instrument(skip(self), fields(db.table = "scheduled_jobs", db.operation = "count"))]
    pub async fn count_pending(&self) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM scheduled_jobs WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await
                .context("Failed to count pending jobs")?;

        Ok(count)
    }
}
