use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{PgPool, Postgres};
use uuid::Uuid;

use verita_core::models::{AnalysisKey, AnalysisResult, Attribution, RequestState};

use crate::traits::AnalysisResultStore;

const COLUMNS: &str = r#"
    media_id,
    processor_id,
    request_id,
    request_state,
    raw,
    created_at,
    completed_at,
    user_id,
    api_key_id,
    user_category
"#;

#[derive(Clone)]
pub struct AnalysisResultRepository {
    pool: PgPool,
}

impl AnalysisResultRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AnalysisResultStore for AnalysisResultRepository {
    #[tracing::instrument(skip(self), fields(db.table = "analysis_results", db.operation = "select"))]
    async fn get(&self, key: &AnalysisKey) -> Result<Option<AnalysisResult>> {
        let sql = format!(
            "SELECT {} FROM analysis_results WHERE media_id = $1 AND processor_id = $2",
            COLUMNS
        );
        let row = sqlx::query_as::<Postgres, AnalysisResult>(&sql)
            .bind(key.media_id)
            .bind(&key.processor_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch analysis result")?;

        Ok(row)
    }

    #[tracing::instrument(skip(self), fields(db.table = "analysis_results", db.operation = "select"))]
    async fn list_for_tracks(&self, track_ids: &[Uuid]) -> Result<Vec<AnalysisResult>> {
        let sql = format!(
            "SELECT {} FROM analysis_results WHERE media_id = ANY($1) ORDER BY created_at",
            COLUMNS
        );
        let rows = sqlx::query_as::<Postgres, AnalysisResult>(&sql)
            .bind(track_ids)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list analysis results")?;

        Ok(rows)
    }

    #[tracing::instrument(skip(self), fields(db.table = "analysis_results", db.operation = "select"))]
    async fn find_by_request_id(
        &self,
        processor_id: &str,
        request_id: &str,
    ) -> Result<Option<AnalysisResult>> {
        let sql = format!(
            "SELECT {} FROM analysis_results WHERE processor_id = $1 AND request_id = $2",
            COLUMNS
        );
        let row = sqlx::query_as::<Postgres, AnalysisResult>(&sql)
            .bind(processor_id)
            .bind(request_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch analysis result by request id")?;

        Ok(row)
    }

    #[tracing::instrument(skip(self, attribution), fields(db.table = "analysis_results", db.operation = "upsert"))]
    async fn upsert_pending(
        &self,
        key: &AnalysisKey,
        request_id: &str,
        state: RequestState,
        attribution: &Attribution,
    ) -> Result<AnalysisResult> {
        if state.is_terminal() {
            anyhow::bail!("upsert_pending called with terminal state {}", state);
        }

        // The WHERE clause keeps terminal rows untouched and never moves PROCESSING back.
        let sql = format!(
            r#"
            INSERT INTO analysis_results (
                media_id, processor_id, request_id, request_state,
                user_id, api_key_id, user_category
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (media_id, processor_id) DO UPDATE SET
                request_id = EXCLUDED.request_id,
                request_state = EXCLUDED.request_state,
                user_id = EXCLUDED.user_id,
                api_key_id = EXCLUDED.api_key_id,
                user_category = EXCLUDED.user_category
            WHERE analysis_results.request_state = 'UPLOADING'
               OR (analysis_results.request_state = 'PROCESSING'
                   AND EXCLUDED.request_state = 'PROCESSING')
            RETURNING {}
            "#,
            COLUMNS
        );
        let written = sqlx::query_as::<Postgres, AnalysisResult>(&sql)
            .bind(key.media_id)
            .bind(&key.processor_id)
            .bind(request_id)
            .bind(state.to_string())
            .bind(attribution.user_id)
            .bind(attribution.api_key_id)
            .bind(attribution.category.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to upsert analysis result")?;

        match written {
            Some(row) => Ok(row),
            None => self
                .get(key)
                .await?
                .ok_or_else(|| anyhow::anyhow!("Analysis result {} vanished during upsert", key)),
        }
    }

    #[tracing::instrument(skip(self), fields(db.table = "analysis_results", db.operation = "update"))]
    async fn swap_request_id(&self, key: &AnalysisKey, from: &str, to: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE analysis_results
            SET request_id = $4
            WHERE media_id = $1 AND processor_id = $2 AND request_id = $3
              AND request_state IN ('UPLOADING', 'PROCESSING')
            "#,
        )
        .bind(key.media_id)
        .bind(&key.processor_id)
        .bind(from)
        .bind(to)
        .execute(&self.pool)
        .await
        .context("Failed to update analysis request id")?;

        Ok(result.rows_affected() > 0)
    }

    #[tracing::instrument(skip(self, raw), fields(db.table = "analysis_results", db.operation = "update"))]
    async fn finish(
        &self,
        key: &AnalysisKey,
        request_id: &str,
        state: RequestState,
        raw: JsonValue,
    ) -> Result<Option<AnalysisResult>> {
        if !state.is_terminal() {
            anyhow::bail!("finish called with non-terminal state {}", state);
        }

        let sql = format!(
            r#"
            UPDATE analysis_results
            SET request_state = $4, raw = $5, completed_at = NOW()
            WHERE media_id = $1 AND processor_id = $2 AND request_id = $3
              AND request_state IN ('UPLOADING', 'PROCESSING')
            RETURNING {}
            "#,
            COLUMNS
        );
        let row = sqlx::query_as::<Postgres, AnalysisResult>(&sql)
            .bind(key.media_id)
            .bind(&key.processor_id)
            .bind(request_id)
            .bind(state.to_string())
            .bind(raw)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to finish analysis result")?;

        if row.is_none() {
            tracing::debug!(key = %key, request_id = %request_id, "Completion did not match a pending row");
        }

        Ok(row)
    }

    #[tracing::instrument(skip(self), fields(db.table = "analysis_results", db.operation = "delete"))]
    async fn delete(&self, key: &AnalysisKey) -> Result<bool> {
        let result =
            sqlx::query("DELETE FROM analysis_results WHERE media_id = $1 AND processor_id = $2")
                .bind(key.media_id)
                .bind(&key.processor_id)
                .execute(&self.pool)
                .await
                .context("Failed to delete analysis result")?;

        Ok(result.rows_affected() > 0)
    }

    #[tracing::instrument(skip(self), fields(db.table = "analysis_results", db.operation = "count"))]
    async fn count_in_state(&self, processor_id: &str, state: RequestState) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM analysis_results WHERE processor_id = $1 AND request_state = $2",
        )
        .bind(processor_id)
        .bind(state.to_string())
        .fetch_one(&self.pool)
        .await
        .context("Failed to count analysis results")?;

        Ok(count)
    }

    #[tracing::instrument(skip(self), fields(db.table = "analysis_results", db.operation = "select"))]
    async fn list_stuck(
        &self,
        processor_id: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<AnalysisResult>> {
        let sql = format!(
            r#"
            SELECT {} FROM analysis_results
            WHERE processor_id = $1 AND request_state = 'PROCESSING' AND created_at < $2
            ORDER BY created_at
            "#,
            COLUMNS
        );
        let rows = sqlx::query_as::<Postgres, AnalysisResult>(&sql)
            .bind(processor_id)
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list stuck analysis results")?;

        Ok(rows)
    }
}
