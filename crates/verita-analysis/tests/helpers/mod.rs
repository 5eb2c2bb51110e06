//! Shared fixtures: fake processors over the in-memory store.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use verita_analysis::{AnalysisCoordinator, TemplateResolver, WebhookReceiver};
use verita_core::models::{
    AnalysisKey, AnalysisResult, Availability, MediaType, ModelSpec, ProcessorSpec, RequestState,
};
use verita_db::MemoryStore;
use verita_processors::{
    CheckRequest, Checker, DispatchSlot, Integration, ProcessorEntry, ProcessorError,
    ProcessorRegistry, Reservation, ScoreAdapter, StartOutcome, StartRequest, Starter,
};

pub const CDN: &str = "https://cdn.example/{id}";

#[derive(Clone, Copy)]
pub enum Behavior {
    /// Answer within the call with a score of 0.9 for the first model.
    Complete,
    /// Reserve, record `<request id>-provider` and leave the row running.
    Accept,
    /// Reserve, then report the provider as overloaded.
    Unavailable,
}

/// Starter that records how often it ran.
pub struct FakeStarter {
    behavior: Behavior,
    pub calls: AtomicUsize,
}

impl FakeStarter {
    pub fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
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

        match self.behavior {
            Behavior::Complete => {
                let model = request
                    .processor
                    .models
                    .first()
                    .map(|m| m.id.clone())
                    .unwrap_or_default();
                let row = slot.complete(json!({ "scores": { model: 0.9 } })).await?;
                Ok(row.map_or(StartOutcome::Processing, StartOutcome::Complete))
            }
            Behavior::Accept => {
                // Give concurrent reservations a chance to interleave
                tokio::task::yield_now().await;
                let provider_id = format!("{}-provider", slot.request_id());
                slot.record_request_id(&provider_id).await?;
                Ok(StartOutcome::Processing)
            }
            Behavior::Unavailable => Err(ProcessorError::Unavailable {
                status: 503,
                body: "overloaded".to_string(),
            }),
        }
    }
}

#[derive(Clone, Copy)]
pub enum PollAnswer {
    /// Finish the row with a score of 0.05 for the first model.
    Finished,
    Running,
    /// Report the provider as unreachable.
    Broken,
}

/// Checker that answers every poll the same way.
pub struct FakeChecker {
    answer: PollAnswer,
    pub calls: AtomicUsize,
}

impl FakeChecker {
    pub fn new(answer: PollAnswer) -> Arc<Self> {
        Arc::new(Self {
            answer,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Checker for FakeChecker {
    async fn check(&self, request: CheckRequest) -> Result<Option<AnalysisResult>, ProcessorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        match self.answer {
            PollAnswer::Finished => {
                let model = request
                    .processor
                    .models
                    .first()
                    .map(|m| m.id.clone())
                    .unwrap_or_default();
                let row = request
                    .store
                    .finish(
                        &request.row.key(),
                        request.request_id(),
                        RequestState::Complete,
                        json!({ "scores": { model: 0.05 } }),
                    )
                    .await?;
                Ok(row)
            }
            PollAnswer::Running => Ok(None),
            PollAnswer::Broken => Err(ProcessorError::Unavailable {
                status: 502,
                body: "bad gateway".to_string(),
            }),
        }
    }
}

pub fn spec(id: &str, media_type: MediaType) -> ProcessorSpec {
    ProcessorSpec::new(id, media_type).with_model(ModelSpec::new(format!("{}-model", id)))
}

pub fn entry(spec: ProcessorSpec, integration: Integration) -> ProcessorEntry {
    let adapter = Arc::new(ScoreAdapter::for_spec(&spec));
    ProcessorEntry::new(spec).adapter(adapter).integration(integration)
}

pub struct Fixture {
    pub store: MemoryStore,
    pub registry: Arc<ProcessorRegistry>,
    pub coordinator: AnalysisCoordinator,
    pub webhook: WebhookReceiver,
    /// Image, answers synchronously. Also declares the ignored `sync-extra` model.
    pub sync: Arc<FakeStarter>,
    /// Image, completes by webhook. Capped at one in flight.
    pub hook: Arc<FakeStarter>,
    /// Audio, answers synchronously.
    pub voice: Arc<FakeStarter>,
    /// Video, completes by webhook.
    pub frames: Arc<FakeStarter>,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_resolver(TemplateResolver::new(CDN))
    }

    pub fn with_resolver(resolver: TemplateResolver) -> Self {
        let sync = FakeStarter::new(Behavior::Complete);
        let hook = FakeStarter::new(Behavior::Accept);
        let voice = FakeStarter::new(Behavior::Complete);
        let frames = FakeStarter::new(Behavior::Accept);
        let retired = FakeStarter::new(Behavior::Complete);

        let mut hook_spec = spec("hook", MediaType::Image);
        hook_spec.max_pending = 1;

        let registry = Arc::new(
            ProcessorRegistry::builder()
                .register(entry(
                    spec("sync", MediaType::Image).with_model(ModelSpec::new("sync-extra").ignored()),
                    Integration::Sync(sync.clone()),
                ))
                .register(entry(hook_spec, Integration::Webhook(hook.clone())))
                .register(entry(
                    spec("retired", MediaType::Image).with_availability(Availability::Disabled),
                    Integration::Sync(retired),
                ))
                .register(entry(spec("voice", MediaType::Audio), Integration::Sync(voice.clone())))
                .register(entry(spec("frames", MediaType::Video), Integration::Webhook(frames.clone())))
                .build()
                .expect("valid registry"),
        );

        let store = MemoryStore::new();
        let coordinator = AnalysisCoordinator::new(
            registry.clone(),
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            Arc::new(resolver),
        );
        let webhook = WebhookReceiver::new(registry.clone(), Arc::new(store.clone()));

        Self {
            store,
            registry,
            coordinator,
            webhook,
            sync,
            hook,
            voice,
            frames,
        }
    }
}
