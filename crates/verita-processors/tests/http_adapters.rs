use std::sync::Arc;

use serde_json::json;
use uuid::Uuid;

use verita_core::models::{
    AnalysisKey, Attribution, Media, MediaType, ModelSpec, Priority, ProcessorSpec, RequestState,
};
use verita_db::{AnalysisResultStore, MemoryStore};
use verita_processors::{
    CheckRequest, Checker, HttpChecker, HttpProcessorConfig, HttpStarter, StartOutcome,
    StartRequest, Starter,
};

fn spec() -> Arc<ProcessorSpec> {
    Arc::new(ProcessorSpec::new("hive", MediaType::Image).with_model(ModelSpec::new("hive-ai")))
}

fn request(store: &MemoryStore, job_id: Option<&str>) -> StartRequest {
    let media = Media::new(MediaType::Image, "photo.jpg", "image/jpeg");
    let mut track = media.primary_track();
    track.url = Some("https://cdn.example/photo.jpg".to_string());
    StartRequest {
        processor: spec(),
        track,
        attribution: Attribution::system(),
        priority: Priority::Normal,
        job_id: job_id.map(str::to_string),
        store: Arc::new(store.clone()),
    }
}

#[tokio::test]
async fn test_poll_dispatch_records_provider_id() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/analyses")
        .match_header("authorization", "Bearer secret")
        .with_status(202)
        .with_header("content-type", "application/json")
        .with_body(r#"{"request_id": "hive-123", "status": "processing"}"#)
        .create_async()
        .await;

    let store = MemoryStore::new();
    let starter = HttpStarter::new(
        "hive",
        HttpProcessorConfig::new(server.url(), Some("secret".to_string())),
    )
    .unwrap();

    let request = request(&store, None);
    let key = AnalysisKey::new(request.track.id, "hive");
    let outcome = starter.start(request).await.unwrap();

    mock.assert_async().await;
    assert_eq!(outcome, StartOutcome::Processing);
    let row = store.result(&key).await.unwrap();
    assert_eq!(row.request_state, RequestState::Processing);
    assert_eq!(row.request_id, "hive-123");
}

#[tokio::test]
async fn test_sync_answer_completes_row() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/analyses")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"status": "complete", "result": {"scores": {"hive-ai": 0.82}}}"#)
        .create_async()
        .await;

    let store = MemoryStore::new();
    let starter = HttpStarter::new(
        "hive",
        HttpProcessorConfig::new(server.url(), Some("secret".to_string())),
    )
    .unwrap();

    match starter.start(request(&store, None)).await.unwrap() {
        StartOutcome::Complete(row) => {
            assert_eq!(row.request_state, RequestState::Complete);
            assert_eq!(row.raw, Some(json!({"scores": {"hive-ai": 0.82}})));
        }
        other => panic!("expected completion, got {:?}", other),
    }
}

#[tokio::test]
async fn test_missing_credentials_fail_without_network() {
    let store = MemoryStore::new();
    let starter =
        HttpStarter::new("hive", HttpProcessorConfig::new("http://127.0.0.1:9", None)).unwrap();

    let request = request(&store, Some("job-7"));
    let key = AnalysisKey::new(request.track.id, "hive");
    let outcome = starter.start(request).await.unwrap();

    assert!(matches!(outcome, StartOutcome::Error(ref msg) if msg.contains("Missing credentials")));
    let row = store.result(&key).await.unwrap();
    assert_eq!(row.request_state, RequestState::Error);
    assert_eq!(row.request_id, "job-7");
}

#[tokio::test]
async fn test_unavailable_provider_is_retryable_for_jobs() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/analyses")
        .with_status(503)
        .with_body("overloaded")
        .expect(2)
        .create_async()
        .await;

    let store = MemoryStore::new();
    let starter = HttpStarter::new(
        "hive",
        HttpProcessorConfig::new(server.url(), Some("secret".to_string())),
    )
    .unwrap();

    // Queued: error handed back, row left PROCESSING
    let queued = request(&store, Some("job-1"));
    let key = AnalysisKey::new(queued.track.id, "hive");
    let err = starter.start(queued).await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(
        store.result(&key).await.unwrap().request_state,
        RequestState::Processing
    );

    // Direct: nobody retries, so the row fails
    let direct = request(&store, None);
    let key = AnalysisKey::new(direct.track.id, "hive");
    let outcome = starter.start(direct).await.unwrap();
    assert!(matches!(outcome, StartOutcome::Error(_)));
    assert_eq!(
        store.result(&key).await.unwrap().request_state,
        RequestState::Error
    );
}

#[tokio::test]
async fn test_unauthorized_is_fatal_even_for_jobs() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/analyses")
        .with_status(401)
        .with_body("bad key")
        .create_async()
        .await;

    let store = MemoryStore::new();
    let starter = HttpStarter::new(
        "hive",
        HttpProcessorConfig::new(server.url(), Some("wrong".to_string())),
    )
    .unwrap();

    let outcome = starter.start(request(&store, Some("job-2"))).await.unwrap();
    assert!(matches!(outcome, StartOutcome::Error(_)));
}

#[tokio::test]
async fn test_checker_persists_completion() {
    let mut server = mockito::Server::new_async().await;
    let poll = server
        .mock("GET", "/analyses/hive-9")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"status": "complete", "result": {"scores": {"hive-ai": 0.1}}}"#)
        .create_async()
        .await;

    let store = MemoryStore::new();
    let key = AnalysisKey::new(Uuid::new_v4(), "hive");
    let row = store
        .upsert_pending(&key, "hive-9", RequestState::Processing, &Attribution::system())
        .await
        .unwrap();

    let checker = HttpChecker::new(
        "hive",
        HttpProcessorConfig::new(server.url(), Some("secret".to_string())),
    )
    .unwrap();
    let done = checker
        .check(CheckRequest {
            processor: spec(),
            row,
            media_type: MediaType::Image,
            store: Arc::new(store.clone()),
        })
        .await
        .unwrap()
        .unwrap();

    poll.assert_async().await;
    assert_eq!(done.request_state, RequestState::Complete);
    assert_eq!(
        store.result(&key).await.unwrap().request_state,
        RequestState::Complete
    );
}

#[tokio::test]
async fn test_checker_still_running() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/analyses/hive-10")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"status": "processing"}"#)
        .create_async()
        .await;

    let store = MemoryStore::new();
    let key = AnalysisKey::new(Uuid::new_v4(), "hive");
    let row = store
        .upsert_pending(&key, "hive-10", RequestState::Processing, &Attribution::system())
        .await
        .unwrap();

    let checker = HttpChecker::new(
        "hive",
        HttpProcessorConfig::new(server.url(), Some("secret".to_string())),
    )
    .unwrap();
    let result = checker
        .check(CheckRequest {
            processor: spec(),
            row,
            media_type: MediaType::Image,
            store: Arc::new(store.clone()),
        })
        .await
        .unwrap();
    assert!(result.is_none());
}
