//! Administrative operations: forced re-analysis and the processing timeout sweep.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use uuid::Uuid;

use verita_core::models::{error_payload, AnalysisKey, Caller, Priority, RequestState};
use verita_db::AnalysisResultStore;
use verita_processors::ProcessorRegistry;

use crate::coordinator::{AnalysisCoordinator, AnalysisFailure, CheckOptions};
use crate::error::CoordinatorError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResetReport {
    /// Rows deleted across the media's tracks.
    pub deleted: usize,
    pub processing: usize,
    pub errors: Vec<AnalysisFailure>,
}

impl AnalysisCoordinator {
    /// Forget one processor's results for a media item and dispatch it again.
    #[tracing::instrument(skip(self, caller), fields(media_id = %media_id, processor_id = %processor_id))]
    pub async fn reset_processor(
        &self,
        media_id: Uuid,
        processor_id: &str,
        caller: &Caller,
        priority: Priority,
    ) -> Result<ResetReport, CoordinatorError> {
        let processor = self
            .registry
            .get(processor_id)
            .cloned()
            .ok_or_else(|| CoordinatorError::UnknownProcessor(processor_id.to_string()))?;
        let mut media = self
            .media
            .get(media_id)
            .await?
            .ok_or(CoordinatorError::MediaNotFound(media_id))?;

        let mut deleted = 0;
        for track in media.tracks(true) {
            if !processor.spec.applies_to(track.media_type) {
                continue;
            }
            if self
                .results
                .delete(&AnalysisKey::new(track.id, processor_id))
                .await?
            {
                deleted += 1;
            }
        }

        if let Some(mut cached) = media.cached_results.take() {
            cached.remove_models(processor.spec.model_ids());
            let cached = (!cached.is_empty()).then_some(cached);
            self.media
                .update_cached_results(media.id, cached.as_ref())
                .await?;
            media.cached_results = cached;
        }

        let rows = self.results.list_for_tracks(&media.track_ids()).await?;
        let opts = CheckOptions {
            include_audio: true,
            include_ignored: true,
        };
        let mut outcome = self.check_results(&media, &rows, opts).await;
        outcome.to_start.retain(|entry| entry.processor_id == processor_id);
        let processing = self
            .start_analyses(&media, &mut outcome, caller, priority)
            .await;
        // A synchronous restart may already have settled everything
        let decision = self.should_update_results(&media, &outcome);
        self.persist(media.id, &decision).await?;

        let errors = outcome
            .errors
            .into_iter()
            .filter(|e| e.processor_id == processor_id)
            .collect();

        tracing::info!(deleted, processing, "Processor reset");
        Ok(ResetReport {
            deleted,
            processing,
            errors,
        })
    }
}

/// Force-fails PROCESSING rows that outlived their processor's timeout.
///
/// Processors managed by the job queue are skipped; the queue's retry limit
/// closes their rows instead.
pub struct TimeoutSweeper {
    registry: Arc<ProcessorRegistry>,
    results: Arc<dyn AnalysisResultStore>,
}

impl TimeoutSweeper {
    pub fn new(registry: Arc<ProcessorRegistry>, results: Arc<dyn AnalysisResultStore>) -> Self {
        Self { registry, results }
    }

    /// Run the sweep every `every` until the task is aborted.
    pub fn start(self: Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(every);

            loop {
                ticker.tick().await;

                match self.sweep_timeouts(Utc::now()).await {
                    Ok(0) => tracing::trace!("No timed out analyses"),
                    Ok(failed) => tracing::info!(failed, "Timed out analyses failed"),
                    Err(e) => tracing::error!(error = %e, "Timeout sweep failed"),
                }
            }
        })
    }

    #[tracing::instrument(skip(self))]
    pub async fn sweep_timeouts(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut failed = 0;

        for processor in self.registry.iter() {
            if processor.spec.managed_by_queue {
                continue;
            }
            let timeout = chrono::Duration::from_std(processor.spec.timeout())?;
            let stuck = self.results.list_stuck(processor.id(), now - timeout).await?;

            for row in stuck {
                let payload = error_payload(
                    "analysis timed out",
                    Some(json!({ "timeout_ms": processor.spec.timeout_ms })),
                );
                let finished = self
                    .results
                    .finish(&row.key(), &row.request_id, RequestState::Error, payload)
                    .await?;
                if finished.is_some() {
                    tracing::warn!(
                        processor_id = %processor.id(),
                        track_id = %row.media_id,
                        request_id = %row.request_id,
                        "Analysis timed out"
                    );
                    failed += 1;
                }
            }
        }

        Ok(failed)
    }
}
