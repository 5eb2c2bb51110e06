//! Placeholder rows reserved before dispatch
//!
//! A Starter whose provider may report completion asynchronously (poll or
//! webhook) reserves a [`DispatchSlot`] first: the row is upserted to
//! PROCESSING under an idempotency key before the outbound call is made, so a
//! webhook arriving before the call returns always finds its row.

use anyhow::Result;
use serde_json::Value as JsonValue;
use std::sync::Arc;

use verita_core::models::{
    error_payload, AnalysisKey, AnalysisResult, Attribution, RequestState,
};
use verita_db::AnalysisResultStore;

pub struct DispatchSlot {
    store: Arc<dyn AnalysisResultStore>,
    key: AnalysisKey,
    request_id: String,
}

/// Result of trying to reserve a slot.
pub enum Reservation {
    Reserved(DispatchSlot),
    /// The key already holds a terminal row; nothing may be dispatched.
    Settled(AnalysisResult),
}

impl DispatchSlot {
    /// Upsert the row to PROCESSING under `request_id`.
    ///
    /// Two concurrent reservations for the same key leave one row holding the
    /// later request id; the earlier holder's keyed writes then become no-ops.
    #[tracing::instrument(skip(store, request_id, attribution), fields(key = %key))]
    pub async fn reserve(
        store: Arc<dyn AnalysisResultStore>,
        key: AnalysisKey,
        request_id: impl Into<String>,
        attribution: &Attribution,
    ) -> Result<Reservation> {
        let request_id = request_id.into();
        let row = store
            .upsert_pending(&key, &request_id, RequestState::Processing, attribution)
            .await?;

        if row.request_state.is_terminal() {
            tracing::debug!(request_id = %row.request_id, "Key already settled, not dispatching");
            return Ok(Reservation::Settled(row));
        }

        Ok(Reservation::Reserved(Self {
            store,
            key,
            request_id,
        }))
    }

    pub fn key(&self) -> &AnalysisKey {
        &self.key
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Swap the placeholder for the provider's handle.
    ///
    /// Returns false when another dispatch has since taken the row.
    pub async fn record_request_id(&mut self, provider_id: &str) -> Result<bool> {
        if provider_id == self.request_id {
            return Ok(true);
        }
        let swapped = self
            .store
            .swap_request_id(&self.key, &self.request_id, provider_id)
            .await?;
        if swapped {
            self.request_id = provider_id.to_string();
        } else {
            tracing::debug!(key = %self.key, provider_id = %provider_id, "Slot lost before recording provider id");
        }
        Ok(swapped)
    }

    /// Store a completed payload. If the slot was lost, returns whatever the row holds now.
    pub async fn complete(self, raw: JsonValue) -> Result<Option<AnalysisResult>> {
        self.settle(RequestState::Complete, raw).await
    }

    /// Store an `{error, detail}` payload.
    pub async fn fail(
        self,
        error: impl Into<String>,
        detail: Option<JsonValue>,
    ) -> Result<Option<AnalysisResult>> {
        self.settle(RequestState::Error, error_payload(error, detail))
            .await
    }

    async fn settle(self, state: RequestState, raw: JsonValue) -> Result<Option<AnalysisResult>> {
        match self
            .store
            .finish(&self.key, &self.request_id, state, raw)
            .await?
        {
            Some(row) => Ok(Some(row)),
            None => self.store.get(&self.key).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;
    use verita_db::MemoryStore;

    fn store() -> (MemoryStore, Arc<dyn AnalysisResultStore>) {
        let memory = MemoryStore::new();
        let store: Arc<dyn AnalysisResultStore> = Arc::new(memory.clone());
        (memory, store)
    }

    #[tokio::test]
    async fn test_reserve_then_complete() {
        let (memory, store) = store();
        let key = AnalysisKey::new(Uuid::new_v4(), "hive");

        let Reservation::Reserved(mut slot) =
            DispatchSlot::reserve(store, key.clone(), "job-1", &Attribution::system())
                .await
                .unwrap()
        else {
            panic!("expected a fresh slot");
        };
        assert!(slot.record_request_id("hive-42").await.unwrap());

        let row = slot.complete(json!({"scores": {}})).await.unwrap().unwrap();
        assert_eq!(row.request_state, RequestState::Complete);
        assert_eq!(row.request_id, "hive-42");
        assert_eq!(memory.results().await.len(), 1);
    }

    #[tokio::test]
    async fn test_reserve_on_settled_key() {
        let (_memory, store) = store();
        let key = AnalysisKey::new(Uuid::new_v4(), "hive");

        let Reservation::Reserved(slot) =
            DispatchSlot::reserve(store.clone(), key.clone(), "job-1", &Attribution::system())
                .await
                .unwrap()
        else {
            panic!("expected a fresh slot");
        };
        slot.fail("quota exceeded", None).await.unwrap();

        let again = DispatchSlot::reserve(store, key, "job-2", &Attribution::system())
            .await
            .unwrap();
        assert!(matches!(again, Reservation::Settled(row) if row.request_state == RequestState::Error));
    }

    #[tokio::test]
    async fn test_lost_slot_does_not_overwrite() {
        let (_memory, store) = store();
        let key = AnalysisKey::new(Uuid::new_v4(), "hive");
        let attribution = Attribution::system();

        let Reservation::Reserved(first) =
            DispatchSlot::reserve(store.clone(), key.clone(), "job-1", &attribution)
                .await
                .unwrap()
        else {
            panic!("expected a fresh slot");
        };
        let Reservation::Reserved(second) =
            DispatchSlot::reserve(store.clone(), key.clone(), "job-2", &attribution)
                .await
                .unwrap()
        else {
            panic!("expected a fresh slot");
        };

        let row = first.complete(json!({"scores": {}})).await.unwrap().unwrap();
        assert_eq!(row.request_state, RequestState::Processing);
        assert_eq!(row.request_id, "job-2");

        let row = second.complete(json!({"scores": {}})).await.unwrap().unwrap();
        assert_eq!(row.request_state, RequestState::Complete);
    }
}
