//! In-memory store
//!
//! Implements every storage trait over process-local maps. Used by tests and by
//! local runs without `DATABASE_URL`. Writes follow the same matching rules as
//! the Postgres queries.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use verita_core::models::{
    AnalysisKey, AnalysisResult, Attribution, CachedResults, Media, RequestState, UserCategory,
};

use crate::traits::{AnalysisResultStore, MediaStore, ThrottleStore};

#[derive(Default)]
struct Inner {
    results: HashMap<AnalysisKey, AnalysisResult>,
    media: HashMap<Uuid, Media>,
    admissions: Vec<(UserCategory, Uuid, DateTime<Utc>)>,
    logs: HashMap<(String, String), Vec<DateTime<Utc>>>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a row as-is, bypassing the state machine.
    pub async fn put_result(&self, row: AnalysisResult) {
        self.inner.lock().await.results.insert(row.key(), row);
    }

    pub async fn result(&self, key: &AnalysisKey) -> Option<AnalysisResult> {
        self.inner.lock().await.results.get(key).cloned()
    }

    pub async fn results(&self) -> Vec<AnalysisResult> {
        self.inner.lock().await.results.values().cloned().collect()
    }

    pub async fn media(&self, media_id: Uuid) -> Option<Media> {
        self.inner.lock().await.media.get(&media_id).cloned()
    }
}

#[async_trait]
impl AnalysisResultStore for MemoryStore {
    async fn get(&self, key: &AnalysisKey) -> Result<Option<AnalysisResult>> {
        Ok(self.result(key).await)
    }

    async fn list_for_tracks(&self, track_ids: &[Uuid]) -> Result<Vec<AnalysisResult>> {
        let inner = self.inner.lock().await;
        let mut rows: Vec<AnalysisResult> = inner
            .results
            .values()
            .filter(|r| track_ids.contains(&r.media_id))
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.created_at);
        Ok(rows)
    }

    async fn find_by_request_id(
        &self,
        processor_id: &str,
        request_id: &str,
    ) -> Result<Option<AnalysisResult>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .results
            .values()
            .find(|r| r.processor_id == processor_id && r.request_id == request_id)
            .cloned())
    }

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

        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner.results.get_mut(key) {
            if existing.request_state.can_transition_to(state) {
                existing.request_id = request_id.to_string();
                existing.request_state = state;
                existing.user_id = attribution.user_id;
                existing.api_key_id = attribution.api_key_id;
                existing.user_category = attribution.category;
            }
            return Ok(existing.clone());
        }

        let row = AnalysisResult {
            media_id: key.media_id,
            processor_id: key.processor_id.clone(),
            request_id: request_id.to_string(),
            request_state: state,
            raw: None,
            created_at: Utc::now(),
            completed_at: None,
            user_id: attribution.user_id,
            api_key_id: attribution.api_key_id,
            user_category: attribution.category,
        };
        inner.results.insert(key.clone(), row.clone());
        Ok(row)
    }

    async fn swap_request_id(&self, key: &AnalysisKey, from: &str, to: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        match inner.results.get_mut(key) {
            Some(row) if row.request_id == from && !row.request_state.is_terminal() => {
                row.request_id = to.to_string();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

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

        let mut inner = self.inner.lock().await;
        match inner.results.get_mut(key) {
            Some(row) if row.request_id == request_id && !row.request_state.is_terminal() => {
                row.request_state = state;
                row.raw = Some(raw);
                row.completed_at = Some(Utc::now());
                Ok(Some(row.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn delete(&self, key: &AnalysisKey) -> Result<bool> {
        Ok(self.inner.lock().await.results.remove(key).is_some())
    }

    async fn count_in_state(&self, processor_id: &str, state: RequestState) -> Result<i64> {
        let inner = self.inner.lock().await;
        Ok(inner
            .results
            .values()
            .filter(|r| r.processor_id == processor_id && r.request_state == state)
            .count() as i64)
    }

    async fn list_stuck(
        &self,
        processor_id: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<AnalysisResult>> {
        let inner = self.inner.lock().await;
        let mut rows: Vec<AnalysisResult> = inner
            .results
            .values()
            .filter(|r| {
                r.processor_id == processor_id
                    && r.request_state == RequestState::Processing
                    && r.created_at < cutoff
            })
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.created_at);
        Ok(rows)
    }
}

#[async_trait]
impl MediaStore for MemoryStore {
    async fn get(&self, media_id: Uuid) -> Result<Option<Media>> {
        Ok(self.media(media_id).await)
    }

    async fn find_by_track(&self, track_id: Uuid) -> Result<Option<Media>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .media
            .values()
            .find(|m| m.id == track_id || m.audio_id == Some(track_id))
            .cloned())
    }

    async fn insert(&self, media: &Media) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.media.contains_key(&media.id) {
            anyhow::bail!("Media {} already exists", media.id);
        }
        inner.media.insert(media.id, media.clone());
        Ok(())
    }

    async fn update_cached_results(
        &self,
        media_id: Uuid,
        cached: Option<&CachedResults>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(media) = inner.media.get_mut(&media_id) {
            media.cached_results = cached.cloned();
            media.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn clear_audio_track(&self, media_id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(media) = inner.media.get_mut(&media_id) {
            media.audio_id = None;
            media.audio_mime_type = None;
            media.updated_at = Utc::now();
        }
        Ok(())
    }
}

#[async_trait]
impl ThrottleStore for MemoryStore {
    async fn record_admission(
        &self,
        category: UserCategory,
        media_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        // Throttle windows are at most an hour long
        let horizon = at - chrono::Duration::hours(1);
        inner.admissions.retain(|(_, _, t)| *t >= horizon);
        inner.admissions.push((category, media_id, at));
        Ok(())
    }

    async fn count_admissions(&self, category: UserCategory, since: DateTime<Utc>) -> Result<i64> {
        let inner = self.inner.lock().await;
        let mut media: Vec<Uuid> = inner
            .admissions
            .iter()
            .filter(|(c, _, at)| *c == category && *at >= since)
            .map(|(_, id, _)| *id)
            .collect();
        media.sort();
        media.dedup();
        Ok(media.len() as i64)
    }

    async fn has_admission(
        &self,
        category: UserCategory,
        media_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<bool> {
        let inner = self.inner.lock().await;
        Ok(inner
            .admissions
            .iter()
            .any(|(c, id, at)| *c == category && *id == media_id && *at >= since))
    }

    async fn load_log(&self, subject: &str, action: &str) -> Result<Vec<DateTime<Utc>>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .logs
            .get(&(subject.to_string(), action.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn save_log(&self, subject: &str, action: &str, entries: &[DateTime<Utc>]) -> Result<()> {
        self.inner
            .lock()
            .await
            .logs
            .insert((subject.to_string(), action.to_string()), entries.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn key() -> AnalysisKey {
        AnalysisKey::new(Uuid::new_v4(), "hive")
    }

    #[tokio::test]
    async fn test_upsert_keeps_single_row_and_last_request_id() {
        let store = MemoryStore::new();
        let key = key();
        let attribution = Attribution::system();

        store
            .upsert_pending(&key, "job-1", RequestState::Processing, &attribution)
            .await
            .unwrap();
        let row = store
            .upsert_pending(&key, "job-2", RequestState::Processing, &attribution)
            .await
            .unwrap();

        assert_eq!(row.request_id, "job-2");
        assert_eq!(store.results().await.len(), 1);
    }

    #[tokio::test]
    async fn test_upsert_never_overwrites_terminal_row() {
        let store = MemoryStore::new();
        let key = key();
        let attribution = Attribution::system();

        store
            .upsert_pending(&key, "job-1", RequestState::Processing, &attribution)
            .await
            .unwrap();
        store
            .finish(&key, "job-1", RequestState::Complete, json!({"score": 0.4}))
            .await
            .unwrap()
            .unwrap();

        let row = store
            .upsert_pending(&key, "job-2", RequestState::Processing, &attribution)
            .await
            .unwrap();
        assert_eq!(row.request_state, RequestState::Complete);
        assert_eq!(row.request_id, "job-1");
    }

    #[tokio::test]
    async fn test_upsert_does_not_move_backwards() {
        let store = MemoryStore::new();
        let key = key();
        let attribution = Attribution::system();

        store
            .upsert_pending(&key, "job-1", RequestState::Processing, &attribution)
            .await
            .unwrap();
        let row = store
            .upsert_pending(&key, "job-2", RequestState::Uploading, &attribution)
            .await
            .unwrap();
        assert_eq!(row.request_state, RequestState::Processing);
        assert_eq!(row.request_id, "job-1");
    }

    #[tokio::test]
    async fn test_finish_is_noop_for_foreign_request_id() {
        let store = MemoryStore::new();
        let key = key();
        store
            .upsert_pending(&key, "job-1", RequestState::Processing, &Attribution::system())
            .await
            .unwrap();

        let stale = store
            .finish(&key, "other", RequestState::Complete, json!({}))
            .await
            .unwrap();
        assert!(stale.is_none());
        assert_eq!(
            store.result(&key).await.unwrap().request_state,
            RequestState::Processing
        );
    }

    #[tokio::test]
    async fn test_swap_request_id() {
        let store = MemoryStore::new();
        let key = key();
        store
            .upsert_pending(&key, "job-1", RequestState::Processing, &Attribution::system())
            .await
            .unwrap();

        assert!(store.swap_request_id(&key, "job-1", "provider-9").await.unwrap());
        assert!(!store.swap_request_id(&key, "job-1", "provider-10").await.unwrap());
        let found = store.find_by_request_id("hive", "provider-9").await.unwrap();
        assert!(found.is_some());
    }

    #[tokio::test]
    async fn test_list_stuck_only_old_processing_rows() {
        let store = MemoryStore::new();
        let old = AnalysisResult {
            media_id: Uuid::new_v4(),
            processor_id: "hive".to_string(),
            request_id: "old".to_string(),
            request_state: RequestState::Processing,
            raw: None,
            created_at: Utc::now() - Duration::minutes(30),
            completed_at: None,
            user_id: None,
            api_key_id: None,
            user_category: UserCategory::Registered,
        };
        let mut fresh = old.clone();
        fresh.media_id = Uuid::new_v4();
        fresh.request_id = "fresh".to_string();
        fresh.created_at = Utc::now();
        store.put_result(old).await;
        store.put_result(fresh).await;

        let stuck = store
            .list_stuck("hive", Utc::now() - Duration::minutes(10))
            .await
            .unwrap();
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].request_id, "old");
        assert_eq!(
            store.count_in_state("hive", RequestState::Processing).await.unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn test_admissions_count_distinct_media() {
        let store = MemoryStore::new();
        let media = Uuid::new_v4();
        let now = Utc::now();
        store.record_admission(UserCategory::Anonymous, media, now).await.unwrap();
        store.record_admission(UserCategory::Anonymous, media, now).await.unwrap();
        store
            .record_admission(UserCategory::Anonymous, Uuid::new_v4(), now - Duration::hours(2))
            .await
            .unwrap();

        let since = now - Duration::hours(1);
        assert_eq!(store.count_admissions(UserCategory::Anonymous, since).await.unwrap(), 1);
        assert!(store.has_admission(UserCategory::Anonymous, media, since).await.unwrap());
        assert_eq!(store.count_admissions(UserCategory::Api, since).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_admissions_outside_the_hour_are_pruned() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store
            .record_admission(UserCategory::Registered, Uuid::new_v4(), now - Duration::hours(3))
            .await
            .unwrap();
        store
            .record_admission(UserCategory::Registered, Uuid::new_v4(), now - Duration::minutes(30))
            .await
            .unwrap();
        store
            .record_admission(UserCategory::Registered, Uuid::new_v4(), now)
            .await
            .unwrap();

        assert_eq!(store.inner.lock().await.admissions.len(), 2);
        assert_eq!(
            store
                .count_admissions(UserCategory::Registered, now - Duration::hours(1))
                .await
                .unwrap(),
            2
        );
    }
}
