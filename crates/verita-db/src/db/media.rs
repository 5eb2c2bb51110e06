use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{PgPool, Postgres};
use uuid::Uuid;

use verita_core::models::{CachedResults, Media};

use crate::traits::MediaStore;

#[derive(Clone)]
pub struct MediaRepository {
    pool: PgPool,
}

impl MediaRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MediaStore for MediaRepository {
    #[tracing::instrument(skip(self), fields(db.table = "media", db.operation = "select"))]
    async fn get(&self, media_id: Uuid) -> Result<Option<Media>> {
        let media = sqlx::query_as::<Postgres, Media>(
            r#"
            SELECT id, media_type, filename, mime_type, audio_id, audio_mime_type,
                   cached_results, created_at, updated_at
            FROM media
            WHERE id = $1
            "#,
        )
        .bind(media_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch media")?;

        Ok(media)
    }

    #[tracing::instrument(skip(self), fields(db.table = "media", db.operation = "select"))]
    async fn find_by_track(&self, track_id: Uuid) -> Result<Option<Media>> {
        let media = sqlx::query_as::<Postgres, Media>(
            r#"
            SELECT id, media_type, filename, mime_type, audio_id, audio_mime_type,
                   cached_results, created_at, updated_at
            FROM media
            WHERE id = $1 OR audio_id = $1
            LIMIT 1
            "#,
        )
        .bind(track_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch media by track")?;

        Ok(media)
    }

    #[tracing::instrument(skip(self, media), fields(db.table = "media", db.operation = "insert", media_id = %media.id))]
    async fn insert(&self, media: &Media) -> Result<()> {
        let cached = media
            .cached_results
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .context("Failed to serialize cached results")?;

        sqlx::query(
            r#"
            INSERT INTO media (
                id, media_type, filename, mime_type, audio_id, audio_mime_type,
                cached_results, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(media.id)
        .bind(media.media_type.to_string())
        .bind(&media.filename)
        .bind(&media.mime_type)
        .bind(media.audio_id)
        .bind(&media.audio_mime_type)
        .bind(cached)
        .bind(media.created_at)
        .bind(media.updated_at)
        .execute(&self.pool)
        .await
        .context("Failed to insert media")?;

        Ok(())
    }

    #[tracing::instrument(skip(self, cached), fields(db.table = "media", db.operation = "update"))]
    async fn update_cached_results(
        &self,
        media_id: Uuid,
        cached: Option<&CachedResults>,
    ) -> Result<()> {
        let value = cached
            .map(serde_json::to_value)
            .transpose()
            .context("Failed to serialize cached results")?;

        sqlx::query("UPDATE media SET cached_results = $2, updated_at = NOW() WHERE id = $1")
            .bind(media_id)
            .bind(value)
            .execute(&self.pool)
            .await
            .context("Failed to update cached results")?;

        Ok(())
    }

    #[tracing::instrument(skip(self), fields(db.table = "media", db.operation = "update"))]
    async fn clear_audio_track(&self, media_id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE media SET audio_id = NULL, audio_mime_type = NULL, updated_at = NOW() WHERE id = $1",
        )
        .bind(media_id)
        .execute(&self.pool)
        .await
        .context("Failed to clear audio track")?;

        Ok(())
    }
}
