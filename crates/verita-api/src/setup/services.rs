//! Store, coordinator and job queue wiring

use anyhow::{Context, Result};
use sqlx::PgPool;
use std::sync::Arc;

use verita_analysis::{
    AnalysisCoordinator, RefreshResultsHandler, RefreshResultsScheduler, StartProcessorHandler,
    StartProcessorScheduler, TemplateResolver, TimeoutSweeper, WebhookReceiver,
};
use verita_core::Config;
use verita_db::{
    AnalysisResultRepository, AnalysisResultStore, MediaRepository, MediaStore, MemoryStore,
    ThrottleRepository, ThrottleStore,
};
use verita_infra::{SlidingLogLimiter, ThrottleGuard};
use verita_processors::ProcessorRegistry;
use verita_worker::{JobRouter, LocalJobQueue, PgJobQueue};

use crate::state::{AppState, JobQueueBackend, JobState};

/// Persistence backends, either all Postgres or all in-memory.
#[derive(Clone)]
pub struct Stores {
    pub results: Arc<dyn AnalysisResultStore>,
    pub media: Arc<dyn MediaStore>,
    pub throttle: Arc<dyn ThrottleStore>,
    pub pool: Option<PgPool>,
}

impl Stores {
    pub fn memory(store: MemoryStore) -> Self {
        Self {
            results: Arc::new(store.clone()),
            media: Arc::new(store.clone()),
            throttle: Arc::new(store),
            pool: None,
        }
    }

    pub fn postgres(pool: PgPool) -> Self {
        Self {
            results: Arc::new(AnalysisResultRepository::new(pool.clone())),
            media: Arc::new(MediaRepository::new(pool.clone())),
            throttle: Arc::new(ThrottleRepository::new(pool.clone())),
            pool: Some(pool),
        }
    }
}

/// Initialize all services and start the background workers.
pub async fn initialize_services(
    config: Config,
    stores: Stores,
    registry: Arc<ProcessorRegistry>,
) -> Result<Arc<AppState>> {
    // Jobs outlive the process only when there is a database to keep them in
    let queue = match &stores.pool {
        Some(pool) => {
            JobQueueBackend::Postgres(PgJobQueue::new(pool.clone(), config.job_queue.clone()))
        }
        None => JobQueueBackend::Local(LocalJobQueue::new(config.job_queue.clone())),
    };
    let queue_handle = queue.handle();

    let start_jobs: Arc<StartProcessorScheduler> = Arc::new(
        StartProcessorScheduler::new(
            queue_handle.clone(),
            StartProcessorHandler::new(
                registry.clone(),
                stores.results.clone(),
                config.job_queue.max_retries,
            ),
        )
        .context("Start processor job schema is not additive")?,
    );

    let resolver = Arc::new(TemplateResolver::new(config.media_url_template.clone()));
    let coordinator = Arc::new(
        AnalysisCoordinator::new(
            registry.clone(),
            stores.results.clone(),
            stores.media.clone(),
            resolver,
        )
        .with_start_jobs(start_jobs.clone()),
    );

    let refresh: Arc<RefreshResultsScheduler> = Arc::new(
        RefreshResultsScheduler::new(queue_handle, RefreshResultsHandler::new(coordinator.clone()))
            .context("Refresh results job schema is not additive")?,
    );

    let mut router = JobRouter::new();
    router.register(start_jobs).register(refresh.clone());
    let router = Arc::new(router);
    queue.start(Arc::downgrade(&router)).await?;
    tracing::info!(
        backend = queue.kind(),
        max_workers = config.job_queue.max_workers,
        max_retries = config.job_queue.max_retries,
        job_types = router.job_types().count(),
        "Job queue started"
    );

    if let Some(every) = config.processor_timeout_sweep_interval() {
        let sweeper = Arc::new(TimeoutSweeper::new(registry.clone(), stores.results.clone()));
        sweeper.start(every);
        tracing::info!(interval_secs = every.as_secs(), "Processor timeout sweeper started");
    }

    let throttle = ThrottleGuard::new(stores.throttle.clone(), config.throttle.clone());
    let limiter = SlidingLogLimiter::new(stores.throttle.clone());
    let webhooks = WebhookReceiver::new(registry, stores.results.clone());

    Ok(Arc::new(AppState {
        config,
        pool: stores.pool,
        coordinator,
        webhooks,
        throttle,
        limiter,
        jobs: Some(JobState {
            queue,
            router,
            refresh,
        }),
    }))
}
