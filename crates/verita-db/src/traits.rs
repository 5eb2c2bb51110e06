//! Repository trait abstractions
//!
//! The analysis layer only talks to storage through these traits, so the
//! Postgres repositories and the in-memory store are interchangeable.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use verita_core::models::{
    AnalysisKey, AnalysisResult, Attribution, CachedResults, Media, RequestState, UserCategory,
};

#[async_trait]
pub trait AnalysisResultStore: Send + Sync {
    async fn get(&self, key: &AnalysisKey) -> Result<Option<AnalysisResult>>;

    /// Every row stored under any of the given track ids.
    async fn list_for_tracks(&self, track_ids: &[Uuid]) -> Result<Vec<AnalysisResult>>;

    async fn find_by_request_id(
        &self,
        processor_id: &str,
        request_id: &str,
    ) -> Result<Option<AnalysisResult>>;

    /// Insert or overwrite the non-terminal row for `key`.
    ///
    /// A terminal row is never overwritten and is returned unchanged; a PROCESSING
    /// row is never moved back to UPLOADING. Concurrent callers end up with a single
    /// row carrying the request id of the last write.
    async fn upsert_pending(
        &self,
        key: &AnalysisKey,
        request_id: &str,
        state: RequestState,
        attribution: &Attribution,
    ) -> Result<AnalysisResult>;

    /// Replace a placeholder request id with the provider handle.
    ///
    /// No-op (returns false) unless the row still holds `from` and is not terminal.
    async fn swap_request_id(&self, key: &AnalysisKey, from: &str, to: &str) -> Result<bool>;

    /// Move the row to a terminal state and store the payload.
    ///
    /// Keyed by request id: returns `None` without writing when the row is gone,
    /// already terminal, or now belongs to a different request.
    async fn finish(
        &self,
        key: &AnalysisKey,
        request_id: &str,
        state: RequestState,
        raw: JsonValue,
    ) -> Result<Option<AnalysisResult>>;

    async fn delete(&self, key: &AnalysisKey) -> Result<bool>;

    async fn count_in_state(&self, processor_id: &str, state: RequestState) -> Result<i64>;

    /// PROCESSING rows of `processor_id` created before `cutoff`.
    async fn list_stuck(
        &self,
        processor_id: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<AnalysisResult>>;
}

#[async_trait]
pub trait MediaStore: Send + Sync {
    async fn get(&self, media_id: Uuid) -> Result<Option<Media>>;

    /// The media item owning a track: its primary id or its extracted audio id.
    async fn find_by_track(&self, track_id: Uuid) -> Result<Option<Media>>;

    async fn insert(&self, media: &Media) -> Result<()>;

    async fn update_cached_results(
        &self,
        media_id: Uuid,
        cached: Option<&CachedResults>,
    ) -> Result<()>;

    /// Forget the extracted audio stream of a media item.
    async fn clear_audio_track(&self, media_id: Uuid) -> Result<()>;
}

#[async_trait]
pub trait ThrottleStore: Send + Sync {
    async fn record_admission(
        &self,
        category: UserCategory,
        media_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<()>;

    /// Distinct media admitted for `category` at or after `since`.
    async fn count_admissions(&self, category: UserCategory, since: DateTime<Utc>) -> Result<i64>;

    async fn has_admission(
        &self,
        category: UserCategory,
        media_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<bool>;

    /// Sliding log for (subject, action), most recent first.
    async fn load_log(&self, subject: &str, action: &str) -> Result<Vec<DateTime<Utc>>>;

    async fn save_log(&self, subject: &str, action: &str, entries: &[DateTime<Utc>]) -> Result<()>;
}
