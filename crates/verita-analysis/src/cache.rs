//! Cache invalidation
//!
//! The summary stored on a media item is recomputed from the analysis rows on
//! every pass and only written back when it materially changed.

use anyhow::Result;
use uuid::Uuid;

use verita_core::models::{CachedResults, Media};
use verita_processors::ProcessorRegistry;

use crate::coordinator::{AnalysisCoordinator, CheckOptions, CheckOutcome};
use crate::error::CoordinatorError;

#[derive(Debug, Clone, PartialEq)]
pub enum CacheDecision {
    /// Persist this summary.
    Update(CachedResults),
    /// This many enabled processors are still running.
    BlockingPenders(usize),
    NoResults,
    NoChange,
}

/// Decide whether `info.summary` should replace the summary stored on `media`.
///
/// Only the option-independent summary is considered, so the caller's view
/// never leaks into what is stored. Pending analyses of processors that are no longer enabled never block.
/// Equality is structural over the model results, so key order and a changed
/// aggregate timing alone do not count as a change.
pub fn should_update_results(
    registry: &ProcessorRegistry,
    media: &Media,
    info: &CheckOutcome,
) -> CacheDecision {
    let blocking = info
        .summary_pending
        .iter()
        .filter(|p| {
            registry
                .get(&p.processor_id)
                .is_some_and(|processor| processor.spec.is_enabled())
        })
        .count();
    if blocking > 0 {
        return CacheDecision::BlockingPenders(blocking);
    }

    if info.summary.is_empty() {
        return CacheDecision::NoResults;
    }

    if media
        .cached_results
        .as_ref()
        .is_some_and(|stored| stored.results == info.summary.results)
    {
        return CacheDecision::NoChange;
    }

    CacheDecision::Update(info.summary.clone())
}

/// A full re-evaluation of one media item.
#[derive(Debug, Clone)]
pub struct Reconciliation {
    pub media: Media,
    pub outcome: CheckOutcome,
    pub decision: CacheDecision,
    pub persisted: bool,
}

impl AnalysisCoordinator {
    pub fn should_update_results(&self, media: &Media, info: &CheckOutcome) -> CacheDecision {
        should_update_results(&self.registry, media, info)
    }

    /// Write the summary when the decision calls for it. Returns whether anything was written.
    #[tracing::instrument(skip(self, decision), fields(media_id = %media_id))]
    pub async fn persist(&self, media_id: Uuid, decision: &CacheDecision) -> Result<bool> {
        match decision {
            CacheDecision::Update(cached) => {
                self.media.update_cached_results(media_id, Some(cached)).await?;
                tracing::info!(models = cached.len(), "Cached analysis results updated");
                Ok(true)
            }
            other => {
                tracing::debug!(decision = ?other, "Cached analysis results left as is");
                Ok(false)
            }
        }
    }

    /// Load, check, decide and persist in one pass.
    #[tracing::instrument(skip(self), fields(media_id = %media_id))]
    pub async fn reconcile(
        &self,
        media_id: Uuid,
        opts: CheckOptions,
    ) -> Result<Reconciliation, CoordinatorError> {
        let (mut media, rows) = self.load(media_id).await?;
        let outcome = self.check_results(&media, &rows, opts).await;
        let decision = self.should_update_results(&media, &outcome);
        let persisted = self.persist(media.id, &decision).await?;
        if let CacheDecision::Update(cached) = &decision {
            media.cached_results = Some(cached.clone());
        }

        Ok(Reconciliation {
            media,
            outcome,
            decision,
            persisted,
        })
    }

    /// Reconcile the media item owning `track_id`.
    #[tracing::instrument(skip(self), fields(track_id = %track_id))]
    pub async fn reconcile_track(
        &self,
        track_id: Uuid,
    ) -> Result<Option<Reconciliation>, CoordinatorError> {
        let Some(media) = self.media.find_by_track(track_id).await? else {
            tracing::debug!("No media owns this track");
            return Ok(None);
        };
        self.reconcile(media.id, CheckOptions::default())
            .await
            .map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Arc;
    use verita_core::models::{
        Availability, MediaType, ModelResult, ModelSpec, ProcessorSpec, Rank,
    };
    use verita_processors::{
        Integration, ProcessorEntry, ProcessorError, ScoreAdapter, StartOutcome, StartRequest,
        Starter,
    };

    use crate::coordinator::PendingAnalysis;

    struct NoopStarter;

    #[async_trait]
    impl Starter for NoopStarter {
        async fn start(&self, _request: StartRequest) -> Result<StartOutcome, ProcessorError> {
            Ok(StartOutcome::Processing)
        }
    }

    fn registry() -> ProcessorRegistry {
        let entry = |spec: ProcessorSpec| {
            let adapter = Arc::new(ScoreAdapter::for_spec(&spec));
            ProcessorEntry::new(spec)
                .adapter(adapter)
                .integration(Integration::Webhook(Arc::new(NoopStarter)))
        };
        ProcessorRegistry::builder()
            .register(entry(
                ProcessorSpec::new("live", MediaType::Image).with_model(ModelSpec::new("live-m")),
            ))
            .register(entry(
                ProcessorSpec::new("retired", MediaType::Image)
                    .with_model(ModelSpec::new("retired-m"))
                    .with_availability(Availability::Disabled),
            ))
            .build()
            .unwrap()
    }

    fn outcome(models: &[(&str, f64)], pending: &[&str], track_id: Uuid) -> CheckOutcome {
        let mut info = CheckOutcome::default();
        info.summary.merge(
            models
                .iter()
                .map(|(id, score)| ModelResult::new(*id, Rank::Low, Some(*score))),
        );
        info.summary_pending = pending
            .iter()
            .map(|p| PendingAnalysis {
                processor_id: p.to_string(),
                track_id,
            })
            .collect();
        info
    }

    #[test]
    fn test_only_enabled_penders_block() {
        let registry = registry();
        let media = Media::new(MediaType::Image, "a.jpg", "image/jpeg");

        let info = outcome(&[("live-m", 0.1)], &["live", "retired"], media.id);
        assert_eq!(
            should_update_results(&registry, &media, &info),
            CacheDecision::BlockingPenders(1)
        );

        let info = outcome(&[("live-m", 0.1)], &["retired"], media.id);
        assert!(matches!(
            should_update_results(&registry, &media, &info),
            CacheDecision::Update(_)
        ));
    }

    #[test]
    fn test_no_results_and_no_change() {
        let registry = registry();
        let mut media = Media::new(MediaType::Image, "a.jpg", "image/jpeg");

        let empty = outcome(&[], &[], media.id);
        assert_eq!(
            should_update_results(&registry, &media, &empty),
            CacheDecision::NoResults
        );

        let first = outcome(&[("a", 0.1), ("b", 0.2)], &[], media.id);
        media.cached_results = Some(first.summary.clone());

        // Same results merged in the other order
        let mut second = outcome(&[("b", 0.2), ("a", 0.1)], &[], media.id);
        second.summary.record_analysis_time(900);
        assert_eq!(
            should_update_results(&registry, &media, &second),
            CacheDecision::NoChange
        );

        let changed = outcome(&[("a", 0.1), ("b", 0.9)], &[], media.id);
        assert!(matches!(
            should_update_results(&registry, &media, &changed),
            CacheDecision::Update(_)
        ));
    }

    #[test]
    fn test_view_does_not_drive_decision() {
        let registry = registry();
        let media = Media::new(MediaType::Image, "a.jpg", "image/jpeg");

        // Pending outside the view still blocks
        let mut info = outcome(&[("live-m", 0.1)], &["live"], media.id);
        info.cached = info.summary.clone();
        info.pending.clear();
        assert_eq!(
            should_update_results(&registry, &media, &info),
            CacheDecision::BlockingPenders(1)
        );

        // An empty view does not hide the summary
        let mut info = outcome(&[("live-m", 0.1)], &[], media.id);
        info.cached = CachedResults::default();
        assert_eq!(
            should_update_results(&registry, &media, &info),
            CacheDecision::Update(info.summary.clone())
        );
    }
}
