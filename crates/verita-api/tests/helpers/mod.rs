//! Test helpers: build the app over the in-memory store with fake processors.

#![allow(dead_code)]

use async_trait::async_trait;
use axum_test::TestServer;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use verita_api::constants;
use verita_api::setup::{initialize_services, routes, Stores};
use verita_api::AppState;
use verita_core::models::{AnalysisKey, Media, MediaType, ModelSpec, ProcessorSpec};
use verita_core::Config;
use verita_db::{MediaStore, MemoryStore};
use verita_processors::{
    DispatchSlot, Integration, ProcessorEntry, ProcessorError, ProcessorRegistry, Reservation,
    ScoreAdapter, StartOutcome, StartRequest, Starter,
};

/// API path prefix for tests (e.g. `/api/v0`).
pub fn api_path(path: &str) -> String {
    format!("{}{}", constants::API_PREFIX, path)
}

pub fn analysis_path(media_id: Uuid) -> String {
    api_path(&format!("/media/{}/analysis", media_id))
}

/// Starter that either answers inline or leaves the row for a webhook.
pub struct FakeStarter {
    inline: bool,
    pub calls: AtomicUsize,
}

impl FakeStarter {
    pub fn new(inline: bool) -> Arc<Self> {
        Arc::new(Self {
            inline,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Starter for FakeStarter {
    async fn start(&self, request: StartRequest) -> Result<StartOutcome, ProcessorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let key = AnalysisKey::new(request.track.id, request.processor.id.clone());
        let mut slot = match DispatchSlot::reserve(
            request.store.clone(),
            key,
            request.placeholder_request_id(),
            &request.attribution,
        )
        .await?
        {
            Reservation::Reserved(slot) => slot,
            Reservation::Settled(row) => return Ok(StartOutcome::Complete(row)),
        };

        if self.inline {
            let row = slot.complete(json!({ "scores": { "sync-model": 0.9 } })).await?;
            Ok(row.map_or(StartOutcome::Processing, StartOutcome::Complete))
        } else {
            let provider_id = format!("{}-provider", slot.request_id());
            slot.record_request_id(&provider_id).await?;
            Ok(StartOutcome::Processing)
        }
    }
}

fn entry(id: &str, integration: Integration) -> ProcessorEntry {
    let spec = ProcessorSpec::new(id, MediaType::Image).with_model(ModelSpec::new(format!("{}-model", id)));
    let adapter = Arc::new(ScoreAdapter::for_spec(&spec));
    ProcessorEntry::new(spec).adapter(adapter).integration(integration)
}

pub struct TestApp {
    pub server: TestServer,
    pub state: Arc<AppState>,
    pub store: MemoryStore,
    /// Answers inline.
    pub sync: Arc<FakeStarter>,
    /// Completes by webhook.
    pub hook: Arc<FakeStarter>,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_vars(&[]).await
    }

    pub async fn with_vars(vars: &[(&str, &str)]) -> Self {
        let config = Config::from_vars(
            vars.iter()
                .map(|(k, v)| (k.to_string(), v.to_string())),
        )
        .expect("valid config");

        let sync = FakeStarter::new(true);
        let hook = FakeStarter::new(false);
        let registry = Arc::new(
            ProcessorRegistry::builder()
                .register(entry("sync", Integration::Sync(sync.clone())))
                .register(entry("hook", Integration::Webhook(hook.clone())))
                .build()
                .expect("valid registry"),
        );

        let store = MemoryStore::new();
        let state = initialize_services(config, Stores::memory(store.clone()), registry)
            .await
            .expect("services start");
        let server = TestServer::new(routes::setup_routes(state.clone())).expect("test server");

        Self {
            server,
            state,
            store,
            sync,
            hook,
        }
    }

    pub async fn image(&self) -> Media {
        let media = Media::new(MediaType::Image, "photo.jpg", "image/jpeg");
        self.store.insert(&media).await.expect("insert media");
        media
    }
}
