//! Analysis coordinator
//!
//! Decides, for one media item, which processors have results, which are still
//! running and which have never been started, and dispatches the latter.
//! Neither [`AnalysisCoordinator::check_results`] nor
//! [`AnalysisCoordinator::start_analyses`] fails: provider, resolver and
//! queue failures end up in the outcome's `errors` instead.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use verita_core::models::{
    error_payload, AnalysisKey, AnalysisResult, Attribution, CachedResults, Caller, Media, MediaTrack,
    Priority, ProcessorSpec, RequestState,
};
use verita_db::{AnalysisResultStore, MediaStore};
use verita_processors::{
    new_placeholder_request_id, CheckRequest, DispatchSlot, ProcessorRegistry,
    RegisteredProcessor, Reservation, StartOutcome, StartRequest,
};

use crate::error::CoordinatorError;
use crate::jobs::{StartProcessorJob, StartProcessorScheduler};
use crate::resolver::{MediaResolver, Resolution};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckOptions {
    /// Also analyze the extracted audio stream of a video.
    #[serde(default)]
    pub include_audio: bool,
    /// Start processors whose models are all ignored, and keep ignored models in the summary.
    #[serde(default)]
    pub include_ignored: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToStart {
    pub processor_id: String,
    pub track: MediaTrack,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingAnalysis {
    pub processor_id: String,
    pub track_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AnalysisFailure {
    pub processor_id: String,
    pub track_id: Uuid,
    pub message: String,
}

/// State of every (track, processor) pair of a media item.
///
/// `cached`, `pending`, `errors` and `to_start` are the caller's view, shaped
/// by `options`. `summary` and `summary_pending` always cover every track and
/// leave ignored models out; they are what gets stored on the media item.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CheckOutcome {
    pub cached: CachedResults,
    pub pending: Vec<PendingAnalysis>,
    pub errors: Vec<AnalysisFailure>,
    pub to_start: Vec<ToStart>,
    #[serde(skip)]
    pub options: CheckOptions,
    #[serde(skip)]
    pub summary: CachedResults,
    #[serde(skip)]
    pub summary_pending: Vec<PendingAnalysis>,
}

impl CheckOutcome {
    /// Longest analysis among the merged results.
    pub fn analysis_time_ms(&self) -> Option<i64> {
        self.cached.analysis_time_ms
    }

    fn add_pending(&mut self, processor_id: &str, track_id: Uuid, in_view: bool) {
        let pending = PendingAnalysis {
            processor_id: processor_id.to_string(),
            track_id,
        };
        if in_view {
            self.pending.push(pending.clone());
        }
        self.summary_pending.push(pending);
    }

    fn add_error(&mut self, processor_id: &str, track_id: Uuid, message: impl Into<String>) {
        self.errors.push(AnalysisFailure {
            processor_id: processor_id.to_string(),
            track_id,
            message: message.into(),
        });
    }

    /// Fold a row into the summary, and into the view when `in_view`.
    fn absorb(&mut self, processor: &RegisteredProcessor, row: &AnalysisResult, in_view: bool) {
        match row.request_state {
            RequestState::Error => {
                if in_view {
                    let message = row
                        .error_message()
                        .unwrap_or_else(|| "analysis failed".to_string());
                    self.add_error(processor.id(), row.media_id, message);
                }
            }
            RequestState::Complete => {
                let raw = row.raw.clone().unwrap_or(JsonValue::Null);
                if let Some(error) = processor.adapter.check(&raw) {
                    if in_view {
                        self.add_error(processor.id(), row.media_id, error);
                    }
                    return;
                }
                let results = match processor.adapter.adapt(&raw) {
                    Ok(results) => results,
                    Err(e) => {
                        tracing::warn!(
                            processor_id = %processor.id(),
                            track_id = %row.media_id,
                            error = %e,
                            "Failed to adapt processor result, omitting it"
                        );
                        if in_view {
                            self.add_error(
                                processor.id(),
                                row.media_id,
                                format!("unreadable result: {}", e),
                            );
                        }
                        return;
                    }
                };
                let is_ignored =
                    |model_id: &str| processor.spec.model(model_id).is_some_and(|m| m.ignored);
                let duration = row.duration_ms();

                self.summary
                    .merge(results.iter().filter(|r| !is_ignored(r.model_id.as_str())).cloned());
                if let Some(duration) = duration {
                    self.summary.record_analysis_time(duration);
                }
                if in_view {
                    let include_ignored = self.options.include_ignored;
                    self.cached.merge(
                        results
                            .into_iter()
                            .filter(|r| include_ignored || !is_ignored(r.model_id.as_str())),
                    );
                    if let Some(duration) = duration {
                        self.cached.record_analysis_time(duration);
                    }
                }
            }
            RequestState::Uploading | RequestState::Processing => {
                self.add_pending(processor.id(), row.media_id, in_view);
            }
        }
    }
}

/// Totals of a bulk start across many media items.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BulkReport {
    pub media: usize,
    pub processing: usize,
    /// Starts held back because the processor had no capacity left.
    pub deferred: usize,
}

enum TrackReadiness {
    Ready(MediaTrack),
    Downloading,
    Dead,
}

pub struct AnalysisCoordinator {
    pub(crate) registry: Arc<ProcessorRegistry>,
    pub(crate) results: Arc<dyn AnalysisResultStore>,
    pub(crate) media: Arc<dyn MediaStore>,
    resolver: Arc<dyn MediaResolver>,
    start_jobs: Option<Arc<StartProcessorScheduler>>,
}

impl AnalysisCoordinator {
    pub fn new(
        registry: Arc<ProcessorRegistry>,
        results: Arc<dyn AnalysisResultStore>,
        media: Arc<dyn MediaStore>,
        resolver: Arc<dyn MediaResolver>,
    ) -> Self {
        Self {
            registry,
            results,
            media,
            resolver,
            start_jobs: None,
        }
    }

    /// Route queue-managed processors through the scheduled start job.
    pub fn with_start_jobs(mut self, jobs: Arc<StartProcessorScheduler>) -> Self {
        self.start_jobs = Some(jobs);
        self
    }

    pub fn registry(&self) -> &Arc<ProcessorRegistry> {
        &self.registry
    }

    /// Fetch a media item and every analysis row of its tracks.
    pub async fn load(
        &self,
        media_id: Uuid,
    ) -> Result<(Media, Vec<AnalysisResult>), CoordinatorError> {
        let media = self
            .media
            .get(media_id)
            .await?
            .ok_or(CoordinatorError::MediaNotFound(media_id))?;
        let rows = self.results.list_for_tracks(&media.track_ids()).await?;
        Ok((media, rows))
    }

    #[tracing::instrument(skip(self, media, existing), fields(media_id = %media.id))]
    pub async fn check_results(
        &self,
        media: &Media,
        existing: &[AnalysisResult],
        opts: CheckOptions,
    ) -> CheckOutcome {
        let rows: HashMap<AnalysisKey, &AnalysisResult> =
            existing.iter().map(|row| (row.key(), row)).collect();
        let mut outcome = CheckOutcome {
            options: opts,
            ..CheckOutcome::default()
        };
        let mut polls = Vec::new();

        // Every track feeds the stored summary; the options only shape the view.
        for track in media.tracks(true) {
            let in_view = opts.include_audio || track.is_primary();
            for processor in self.registry.for_media_type(track.media_type) {
                let key = AnalysisKey::new(track.id, processor.id());
                let Some(row) = rows.get(&key) else {
                    if in_view && processor.spec.passes_enablement(opts.include_ignored) {
                        outcome.to_start.push(ToStart {
                            processor_id: processor.id().to_string(),
                            track: track.clone(),
                        });
                    }
                    continue;
                };

                match row.request_state {
                    RequestState::Complete | RequestState::Error => {
                        outcome.absorb(processor, row, in_view)
                    }
                    RequestState::Processing => match processor.checker() {
                        Some(checker) => polls.push((
                            processor.clone(),
                            checker.clone(),
                            (*row).clone(),
                            track.media_type,
                            in_view,
                        )),
                        None => outcome.add_pending(processor.id(), track.id, in_view),
                    },
                    RequestState::Uploading => {}
                }
            }
        }

        let checks = join_all(polls.into_iter().map(
            |(processor, checker, row, media_type, in_view)| async move {
                let request = CheckRequest {
                    processor: processor.spec.clone(),
                    row: row.clone(),
                    media_type,
                    store: self.results.clone(),
                };
                let result = checker.check(request).await;
                (processor, row, in_view, result)
            },
        ))
        .await;

        for (processor, row, in_view, result) in checks {
            match result {
                Ok(Some(done)) if done.request_state.is_terminal() => {
                    outcome.absorb(&processor, &done, in_view)
                }
                Ok(_) => outcome.add_pending(processor.id(), row.media_id, in_view),
                Err(e) => {
                    tracing::warn!(
                        processor_id = %processor.id(),
                        request_id = %row.request_id,
                        error = %e,
                        "Checker failed, leaving analysis pending"
                    );
                    outcome.add_pending(processor.id(), row.media_id, in_view);
                }
            }
        }

        tracing::debug!(
            cached = outcome.cached.len(),
            pending = outcome.pending.len(),
            errors = outcome.errors.len(),
            to_start = outcome.to_start.len(),
            "Checked analysis results"
        );
        outcome
    }

    /// Dispatch every `to_start` entry of `outcome` and fold the answers back in.
    ///
    /// Returns the number of analyses left running.
    #[tracing::instrument(skip(self, media, outcome, caller), fields(media_id = %media.id, to_start = outcome.to_start.len()))]
    pub async fn start_analyses(
        &self,
        media: &Media,
        outcome: &mut CheckOutcome,
        caller: &Caller,
        priority: Priority,
    ) -> usize {
        let to_start = std::mem::take(&mut outcome.to_start);
        if to_start.is_empty() {
            return 0;
        }

        let mut readiness: HashMap<Uuid, TrackReadiness> = HashMap::new();
        let mut failure = None;
        for entry in &to_start {
            if readiness.contains_key(&entry.track.id) {
                continue;
            }
            let state = match self.resolver.resolve(&entry.track).await {
                Ok(Resolution::Ready {
                    url,
                    size,
                    duration,
                }) => TrackReadiness::Ready(MediaTrack {
                    url: Some(url),
                    size,
                    duration,
                    ..entry.track.clone()
                }),
                Ok(Resolution::StillDownloading) => self.downloading_state(&entry.track).await,
                Ok(Resolution::Failed { reason }) => {
                    failure = Some(reason);
                    break;
                }
                Err(e) => {
                    failure = Some(format!("Failed to resolve media: {}", e));
                    break;
                }
            };
            readiness.insert(entry.track.id, state);
        }
        if let Some(reason) = failure {
            return fail_all(outcome, to_start, &reason);
        }

        if !caller.is_authenticated() {
            tracing::debug!("No authenticated caller, leaving analyses pending");
            for entry in &to_start {
                outcome.add_pending(&entry.processor_id, entry.track.id, true);
            }
            return 0;
        }

        let mut dispatches = Vec::new();
        let mut audio_cleared = false;
        for entry in to_start {
            let Some(processor) = self.registry.get(&entry.processor_id).cloned() else {
                outcome.add_error(&entry.processor_id, entry.track.id, "unknown processor");
                continue;
            };
            match readiness.get(&entry.track.id) {
                Some(TrackReadiness::Ready(track)) => {
                    if let Some(reason) = exceeds_limits(&processor.spec, track) {
                        outcome.add_error(processor.id(), track.id, reason);
                        continue;
                    }
                    dispatches.push((processor, track.clone()));
                }
                Some(TrackReadiness::Dead) => {
                    if !audio_cleared {
                        audio_cleared = true;
                        tracing::info!(track_id = %entry.track.id, "Audio track will never be available, dropping it");
                        if let Err(e) = self.media.clear_audio_track(media.id).await {
                            tracing::error!(error = %e, "Failed to clear audio track");
                        }
                    }
                }
                Some(TrackReadiness::Downloading) | None => {
                    outcome.add_pending(processor.id(), entry.track.id, true)
                }
            }
        }

        let attribution = Attribution::from(caller);
        let attribution = &attribution;
        let answers = join_all(dispatches.into_iter().map(|(processor, track)| async move {
            let answer = self.dispatch(&processor, track.clone(), attribution, priority).await;
            (processor, track, answer)
        }))
        .await;

        let mut processing = 0;
        for (processor, track, answer) in answers {
            match answer {
                StartOutcome::Complete(row) => outcome.absorb(&processor, &row, true),
                StartOutcome::Error(message) => outcome.add_error(processor.id(), track.id, message),
                StartOutcome::Processing => {
                    outcome.add_pending(processor.id(), track.id, true);
                    processing += 1;
                }
            }
        }

        tracing::info!(processing, "Analyses dispatched");
        processing
    }

    async fn downloading_state(&self, track: &MediaTrack) -> TrackReadiness {
        if track.is_primary() {
            return TrackReadiness::Downloading;
        }
        match self.resolver.is_dead_on_arrival(track).await {
            Ok(true) => TrackReadiness::Dead,
            Ok(false) => TrackReadiness::Downloading,
            Err(e) => {
                tracing::warn!(track_id = %track.id, error = %e, "Dead-on-arrival check failed");
                TrackReadiness::Downloading
            }
        }
    }

    #[tracing::instrument(skip(self, processor, track, attribution), fields(processor_id = %processor.id(), track_id = %track.id))]
    async fn dispatch(
        &self,
        processor: &Arc<RegisteredProcessor>,
        track: MediaTrack,
        attribution: &Attribution,
        priority: Priority,
    ) -> StartOutcome {
        if processor.spec.managed_by_queue {
            match &self.start_jobs {
                Some(jobs) => {
                    return self
                        .enqueue_start(jobs, processor, track, attribution, priority)
                        .await
                }
                None => tracing::warn!("No job queue configured, dispatching directly"),
            }
        }

        let key = AnalysisKey::new(track.id, processor.id());
        let request = StartRequest {
            processor: processor.spec.clone(),
            track,
            attribution: attribution.clone(),
            priority,
            job_id: None,
            store: self.results.clone(),
        };

        match processor.starter().start(request).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(error = %e, "Starter failed");
                let message = e.to_string();
                self.fail_open_row(&key, &message, json!({ "code": e.code() }))
                    .await;
                StartOutcome::Error(message)
            }
        }
    }

    /// Reserve the row, then hand the start to the job queue.
    ///
    /// The row holds a placeholder until the job id is known. If the job runs
    /// first and already swapped in a provider id, recording the job id is a no-op.
    async fn enqueue_start(
        &self,
        jobs: &StartProcessorScheduler,
        processor: &RegisteredProcessor,
        track: MediaTrack,
        attribution: &Attribution,
        priority: Priority,
    ) -> StartOutcome {
        let key = AnalysisKey::new(track.id, processor.id());
        let placeholder = new_placeholder_request_id();
        let mut slot =
            match DispatchSlot::reserve(self.results.clone(), key, placeholder, attribution).await {
                Ok(Reservation::Reserved(slot)) => slot,
                Ok(Reservation::Settled(row)) => return settled_outcome(row),
                Err(e) => {
                    tracing::error!(error = %e, "Failed to reserve analysis row");
                    return StartOutcome::Error(format!("Failed to reserve analysis: {}", e));
                }
            };

        let payload = StartProcessorJob::new(processor.id(), &track, attribution);
        match jobs.schedule(priority, &payload, None).await {
            Ok(job_id) => {
                if let Err(e) = slot.record_request_id(&job_id).await {
                    tracing::warn!(job_id = %job_id, error = %e, "Failed to record job id on analysis row");
                }
                StartOutcome::Processing
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to schedule start job");
                let message = format!("Failed to schedule analysis: {}", e);
                if let Err(e) = slot.fail(message.clone(), None).await {
                    tracing::error!(error = %e, "Failed to record scheduling failure");
                }
                StartOutcome::Error(message)
            }
        }
    }

    /// Terminate a row a failed Starter left open.
    async fn fail_open_row(&self, key: &AnalysisKey, message: &str, detail: JsonValue) {
        let row = match self.results.get(key).await {
            Ok(Some(row)) if !row.request_state.is_terminal() => row,
            Ok(_) => return,
            Err(e) => {
                tracing::error!(key = %key, error = %e, "Failed to load analysis row");
                return;
            }
        };
        let payload = error_payload(message, Some(detail));
        if let Err(e) = self
            .results
            .finish(key, &row.request_id, RequestState::Error, payload)
            .await
        {
            tracing::error!(key = %key, error = %e, "Failed to fail analysis row");
        }
    }

    /// Free slots for `spec`, or `None` when it is not capped.
    async fn remaining_capacity(&self, spec: &ProcessorSpec) -> Result<Option<i64>, CoordinatorError> {
        if spec.max_pending == 0 {
            return Ok(None);
        }
        let in_flight = self
            .results
            .count_in_state(&spec.id, RequestState::Processing)
            .await?;
        Ok(Some((i64::from(spec.max_pending) - in_flight).max(0)))
    }

    /// Whether another media item may be started on `processor_id` now.
    pub async fn has_capacity(&self, processor_id: &str) -> Result<bool, CoordinatorError> {
        let processor = self
            .registry
            .get(processor_id)
            .ok_or_else(|| CoordinatorError::UnknownProcessor(processor_id.to_string()))?;
        Ok(self
            .remaining_capacity(&processor.spec)
            .await?
            .map_or(true, |free| free > 0))
    }

    /// Start many media items, holding back processors that are at `max_pending`.
    #[tracing::instrument(skip(self, media_ids, caller), fields(media = media_ids.len()))]
    pub async fn start_bulk(
        &self,
        media_ids: &[Uuid],
        caller: &Caller,
        priority: Priority,
        opts: CheckOptions,
    ) -> Result<BulkReport, CoordinatorError> {
        let mut capacity: HashMap<String, Option<i64>> = HashMap::new();
        let mut report = BulkReport::default();

        for media_id in media_ids {
            let (media, rows) = match self.load(*media_id).await {
                Ok(loaded) => loaded,
                Err(CoordinatorError::MediaNotFound(id)) => {
                    tracing::warn!(media_id = %id, "Skipping missing media in bulk start");
                    continue;
                }
                Err(e) => return Err(e),
            };
            let mut outcome = self.check_results(&media, &rows, opts).await;

            let mut admitted = Vec::with_capacity(outcome.to_start.len());
            for entry in std::mem::take(&mut outcome.to_start) {
                if !capacity.contains_key(&entry.processor_id) {
                    let free = match self.registry.get(&entry.processor_id) {
                        Some(processor) => self.remaining_capacity(&processor.spec).await?,
                        None => None,
                    };
                    capacity.insert(entry.processor_id.clone(), free);
                }
                match capacity.get_mut(&entry.processor_id) {
                    Some(Some(free)) if *free > 0 => {
                        *free -= 1;
                        admitted.push(entry);
                    }
                    Some(Some(_)) => report.deferred += 1,
                    _ => admitted.push(entry),
                }
            }
            outcome.to_start = admitted;

            report.processing += self.start_analyses(&media, &mut outcome, caller, priority).await;
            report.media += 1;
        }

        tracing::info!(
            media = report.media,
            processing = report.processing,
            deferred = report.deferred,
            "Bulk start finished"
        );
        Ok(report)
    }
}

fn fail_all(outcome: &mut CheckOutcome, to_start: Vec<ToStart>, reason: &str) -> usize {
    tracing::warn!(reason = %reason, "Media resolution failed, nothing dispatched");
    for entry in to_start {
        outcome.add_error(&entry.processor_id, entry.track.id, reason);
    }
    0
}

fn exceeds_limits(spec: &ProcessorSpec, track: &MediaTrack) -> Option<String> {
    if let (Some(max), Some(size)) = (spec.max_size, track.size) {
        if size > max {
            return Some(format!("file too large for {} ({} > {} bytes)", spec.id, size, max));
        }
    }
    if let (Some(max), Some(duration)) = (spec.max_duration, track.duration) {
        if duration > max {
            return Some(format!("media too long for {} ({}s > {}s)", spec.id, duration, max));
        }
    }
    None
}

pub(crate) fn settled_outcome(row: AnalysisResult) -> StartOutcome {
    match row.request_state {
        RequestState::Error => StartOutcome::Error(
            row.error_message()
                .unwrap_or_else(|| "analysis failed".to_string()),
        ),
        RequestState::Complete => StartOutcome::Complete(row),
        RequestState::Uploading | RequestState::Processing => StartOutcome::Processing,
    }
}
