mod helpers;

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

use helpers::{entry, spec, Behavior, FakeStarter, CDN};
use verita_analysis::{
    AnalysisCoordinator, CheckOptions, RefreshResultsHandler, RefreshResultsJob,
    StartProcessorHandler, StartProcessorJob, TemplateResolver, REFRESH_RETRY_DELAY,
};
use verita_core::models::{AnalysisKey, Caller, Media, MediaType, Priority, RequestState};
use verita_db::{MediaStore, MemoryStore};
use verita_processors::{new_placeholder_request_id, Integration, ProcessorRegistry};
use verita_worker::{
    JobDirective, JobMessage, JobMetadata, JobPayload, JobQueue, ScheduledJob,
};

/// Queue that only records what was enqueued.
#[derive(Default)]
struct RecordingQueue {
    messages: Mutex<Vec<(String, JobMessage, Option<Duration>)>>,
}

impl RecordingQueue {
    async fn take(&self) -> Vec<(String, JobMessage, Option<Duration>)> {
        std::mem::take(&mut *self.messages.lock().await)
    }
}

#[async_trait]
impl JobQueue for RecordingQueue {
    async fn enqueue(
        &self,
        message: JobMessage,
        _priority: Priority,
        delay: Option<Duration>,
    ) -> anyhow::Result<String> {
        let mut messages = self.messages.lock().await;
        let job_id = format!("job-{}", messages.len() + 1);
        messages.push((job_id.clone(), message, delay));
        Ok(job_id)
    }
}

fn meta(job_id: &str, job_type: &str, attempt: u32) -> JobMetadata {
    JobMetadata {
        job_id: job_id.to_string(),
        job_type: job_type.to_string(),
        attempt,
        priority: Priority::Normal,
        enqueued_at: Utc::now(),
    }
}

struct QueuedSetup {
    store: MemoryStore,
    queue: Arc<RecordingQueue>,
    starter: Arc<FakeStarter>,
    jobs: Arc<ScheduledJob<StartProcessorJob, StartProcessorHandler>>,
    coordinator: AnalysisCoordinator,
}

fn queued(behavior: Behavior, max_retries: u32) -> QueuedSetup {
    let starter = FakeStarter::new(behavior);
    let mut queued_spec = spec("queued", MediaType::Image);
    queued_spec.managed_by_queue = true;
    let registry = Arc::new(
        ProcessorRegistry::builder()
            .register(entry(queued_spec, Integration::Webhook(starter.clone())))
            .build()
            .unwrap(),
    );

    let store = MemoryStore::new();
    let queue = Arc::new(RecordingQueue::default());
    let handler = StartProcessorHandler::new(registry.clone(), Arc::new(store.clone()), max_retries);
    let jobs = Arc::new(ScheduledJob::new(queue.clone() as Arc<dyn JobQueue>, handler).unwrap());
    let coordinator = AnalysisCoordinator::new(
        registry,
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        Arc::new(TemplateResolver::new(CDN)),
    )
    .with_start_jobs(jobs.clone());

    QueuedSetup {
        store,
        queue,
        starter,
        jobs,
        coordinator,
    }
}

async fn start(setup: &QueuedSetup) -> Media {
    let media = Media::new(MediaType::Image, "photo.jpg", "image/jpeg");
    setup.store.insert(&media).await.unwrap();
    let mut outcome = setup
        .coordinator
        .check_results(&media, &[], CheckOptions::default())
        .await;
    let processing = setup
        .coordinator
        .start_analyses(
            &media,
            &mut outcome,
            &Caller::registered(Uuid::new_v4()),
            Priority::Normal,
        )
        .await;
    assert_eq!(processing, 1);
    media
}

#[tokio::test]
async fn test_queued_start_dispatches_once() {
    let setup = queued(Behavior::Accept, 3);
    let media = start(&setup).await;
    let key = AnalysisKey::new(media.id, "queued");

    // Nothing reaches the provider until the job runs
    assert_eq!(setup.starter.calls(), 0);
    let row = setup.store.result(&key).await.unwrap();
    assert_eq!(row.request_state, RequestState::Processing);
    assert_eq!(row.request_id, "job-1");

    let mut messages = setup.queue.take().await;
    assert_eq!(messages.len(), 1);
    let (job_id, message, _) = messages.remove(0);
    assert_eq!(message.job_type, StartProcessorJob::JOB_TYPE);
    assert_eq!(message.schema_version, 2);

    let directive = setup
        .jobs
        .run(&message.payload, &meta(&job_id, &message.job_type, 0))
        .await;
    assert_eq!(directive, JobDirective::Complete);
    assert_eq!(setup.starter.calls(), 1);
    assert_eq!(
        setup.store.result(&key).await.unwrap().request_id,
        "job-1-provider"
    );

    // Redelivery after the provider took the job
    let directive = setup
        .jobs
        .run(&message.payload, &meta(&job_id, &message.job_type, 1))
        .await;
    assert_eq!(directive, JobDirective::Complete);
    assert_eq!(setup.starter.calls(), 1);
}

#[tokio::test]
async fn test_duplicate_first_delivery_dispatches_once() {
    let setup = queued(Behavior::Accept, 3);
    let media = start(&setup).await;
    let key = AnalysisKey::new(media.id, "queued");
    let (job_id, message, _) = setup.queue.take().await.remove(0);

    for _ in 0..2 {
        let directive = setup
            .jobs
            .run(&message.payload, &meta(&job_id, &message.job_type, 0))
            .await;
        assert_eq!(directive, JobDirective::Complete);
    }

    assert_eq!(setup.starter.calls(), 1);
    assert_eq!(
        setup.store.result(&key).await.unwrap().request_id,
        "job-1-provider"
    );
}

#[tokio::test]
async fn test_job_ahead_of_recorded_id_still_dispatches() {
    let setup = queued(Behavior::Accept, 3);
    let media = start(&setup).await;
    let key = AnalysisKey::new(media.id, "queued");
    let (job_id, message, _) = setup.queue.take().await.remove(0);

    // The job runs before the coordinator swapped its placeholder for the job id
    let mut row = setup.store.result(&key).await.unwrap();
    row.request_id = new_placeholder_request_id();
    setup.store.put_result(row).await;

    let directive = setup
        .jobs
        .run(&message.payload, &meta(&job_id, &message.job_type, 0))
        .await;
    assert_eq!(directive, JobDirective::Complete);
    assert_eq!(setup.starter.calls(), 1);
    assert_eq!(
        setup.store.result(&key).await.unwrap().request_id,
        "job-1-provider"
    );
}

#[tokio::test]
async fn test_queued_start_retries_then_fails_row() {
    let setup = queued(Behavior::Unavailable, 2);
    let media = start(&setup).await;
    let key = AnalysisKey::new(media.id, "queued");
    let (job_id, message, _) = setup.queue.take().await.remove(0);

    for attempt in 0..2 {
        let directive = setup
            .jobs
            .run(&message.payload, &meta(&job_id, &message.job_type, attempt))
            .await;
        assert_eq!(directive, JobDirective::Retry { delay: None });
        assert_eq!(
            setup.store.result(&key).await.unwrap().request_state,
            RequestState::Processing
        );
    }

    let directive = setup
        .jobs
        .run(&message.payload, &meta(&job_id, &message.job_type, 2))
        .await;
    assert!(matches!(directive, JobDirective::Failed { .. }));
    assert_eq!(setup.starter.calls(), 3);

    let row = setup.store.result(&key).await.unwrap();
    assert_eq!(row.request_state, RequestState::Error);
    let raw = row.raw.unwrap();
    assert_eq!(raw["detail"]["code"], "unavailable");
    assert_eq!(raw["detail"]["attempts"], 3);
}

#[tokio::test]
async fn test_start_job_for_settled_row_is_a_noop() {
    let setup = queued(Behavior::Accept, 3);
    let media = start(&setup).await;
    let key = AnalysisKey::new(media.id, "queued");
    let (job_id, message, _) = setup.queue.take().await.remove(0);

    let mut row = setup.store.result(&key).await.unwrap();
    row.request_state = RequestState::Complete;
    row.raw = Some(serde_json::json!({"scores": {}}));
    setup.store.put_result(row).await;

    let directive = setup
        .jobs
        .run(&message.payload, &meta(&job_id, &message.job_type, 0))
        .await;
    assert_eq!(directive, JobDirective::Complete);
    assert_eq!(setup.starter.calls(), 0);
}

#[tokio::test]
async fn test_refresh_job_waits_for_penders() {
    let fixture = helpers::Fixture::new();
    let media = Media::new(MediaType::Image, "photo.jpg", "image/jpeg");
    fixture.store.insert(&media).await.unwrap();

    let mut outcome = fixture
        .coordinator
        .check_results(&media, &[], CheckOptions::default())
        .await;
    fixture
        .coordinator
        .start_analyses(
            &media,
            &mut outcome,
            &Caller::registered(Uuid::new_v4()),
            Priority::Normal,
        )
        .await;

    let store = fixture.store.clone();
    let registry = fixture.registry.clone();
    let coordinator = Arc::new(fixture.coordinator);
    let refresh = ScheduledJob::new(
        Arc::new(RecordingQueue::default()) as Arc<dyn JobQueue>,
        RefreshResultsHandler::new(coordinator),
    )
    .unwrap();
    let payload = serde_json::to_value(RefreshResultsJob {
        media_id: media.id,
        include_audio: false,
    })
    .unwrap();

    let directive = refresh
        .run(&payload, &meta("r-1", RefreshResultsJob::JOB_TYPE, 0))
        .await;
    assert_eq!(
        directive,
        JobDirective::Retry {
            delay: Some(REFRESH_RETRY_DELAY)
        }
    );
    assert!(store.media(media.id).await.unwrap().cached_results.is_none());

    // The webhook processor finishes
    let row = store.result(&AnalysisKey::new(media.id, "hook")).await.unwrap();
    verita_analysis::WebhookReceiver::new(registry, Arc::new(store.clone()))
        .receive(
            "hook",
            serde_json::json!({"requestId": row.request_id, "scores": {"hook-model": 0.5}}),
        )
        .await
        .unwrap();

    let directive = refresh
        .run(&payload, &meta("r-1", RefreshResultsJob::JOB_TYPE, 1))
        .await;
    assert_eq!(directive, JobDirective::Complete);
    let cached = store.media(media.id).await.unwrap().cached_results.unwrap();
    assert_eq!(cached.len(), 2);

    // A media item deleted in the meantime completes the job
    let gone = serde_json::to_value(RefreshResultsJob {
        media_id: Uuid::new_v4(),
        include_audio: false,
    })
    .unwrap();
    assert_eq!(
        refresh
            .run(&gone, &meta("r-2", RefreshResultsJob::JOB_TYPE, 0))
            .await,
        JobDirective::Complete
    );
}
