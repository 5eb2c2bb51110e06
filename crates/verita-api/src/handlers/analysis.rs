//! Analysis endpoints for one media item.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use verita_analysis::{
    AnalysisFailure, CacheDecision, CheckOptions, CheckOutcome, PendingAnalysis, RefreshResultsJob,
    ResetReport, REFRESH_RETRY_DELAY,
};
use verita_core::models::{CachedResults, Priority};
use verita_core::AppError;
use verita_infra::{Admission, RateDecision};

use crate::error::{HttpAppError, ValidatedJson};
use crate::extract::CallerIdentity;
use crate::state::AppState;

pub const START_ANALYSIS_ACTION: &str = "start_analysis";
pub const RESET_ANALYSIS_ACTION: &str = "reset_analysis";

#[derive(Debug, Serialize)]
pub struct AnalysisResponse {
    pub media_id: Uuid,
    pub results: CachedResults,
    pub pending: Vec<PendingAnalysis>,
    pub errors: Vec<AnalysisFailure>,
    /// Processors that apply but have not been started.
    pub not_started: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis_time_ms: Option<i64>,
    /// Analyses dispatched by this request and still running.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing: Option<usize>,
}

impl AnalysisResponse {
    fn new(media_id: Uuid, outcome: &CheckOutcome, processing: Option<usize>) -> Self {
        Self {
            media_id,
            results: outcome.cached.clone(),
            pending: outcome.pending.clone(),
            errors: outcome.errors.clone(),
            not_started: outcome
                .to_start
                .iter()
                .map(|entry| entry.processor_id.clone())
                .collect(),
            analysis_time_ms: outcome.analysis_time_ms(),
            processing,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct StartAnalysisQuery {
    #[serde(default)]
    pub include_audio: bool,
    #[serde(default)]
    pub include_ignored: bool,
    #[serde(default)]
    pub priority: Priority,
}

#[derive(Debug, Deserialize)]
pub struct ResetAnalysisRequest {
    pub processor_id: String,
    #[serde(default)]
    pub priority: Priority,
}

async fn enforce_rate_limit(
    state: &AppState,
    identity: &CallerIdentity,
    action: &str,
) -> Result<(), HttpAppError> {
    let Some(rule) = state.rate_limit(action) else {
        return Ok(());
    };
    match state.limiter.check(&identity.subject(), action, rule).await? {
        RateDecision::Allowed => Ok(()),
        RateDecision::Limited { retry_after_secs } => Err(AppError::RateLimited {
            action: action.to_string(),
            retry_after_secs,
        }
        .into()),
    }
}

/// Follow up later on analyses that are still running, so the summary gets
/// written even if no one asks again.
async fn schedule_refresh(state: &AppState, media_id: Uuid, include_audio: bool) {
    let Some(jobs) = &state.jobs else {
        return;
    };
    let payload = RefreshResultsJob {
        media_id,
        include_audio,
    };
    if let Err(e) = jobs
        .refresh
        .schedule(Priority::Low, &payload, Some(REFRESH_RETRY_DELAY))
        .await
    {
        tracing::warn!(media_id = %media_id, error = %e, "Failed to schedule results refresh");
    }
}

/// Current analysis state. Never dispatches anything.
#[tracing::instrument(skip(state), fields(media_id = %media_id))]
pub async fn get_analysis(
    State(state): State<Arc<AppState>>,
    Path(media_id): Path<Uuid>,
    Query(opts): Query<CheckOptions>,
) -> Result<Json<AnalysisResponse>, HttpAppError> {
    let reconciliation = state.coordinator.reconcile(media_id, opts).await?;
    Ok(Json(AnalysisResponse::new(
        media_id,
        &reconciliation.outcome,
        None,
    )))
}

/// Start every applicable processor that has not run yet.
#[tracing::instrument(skip(state, identity), fields(media_id = %media_id, user.category = %identity.0.category))]
pub async fn start_analysis(
    State(state): State<Arc<AppState>>,
    Path(media_id): Path<Uuid>,
    identity: CallerIdentity,
    Query(query): Query<StartAnalysisQuery>,
) -> Result<Response, HttpAppError> {
    enforce_rate_limit(&state, &identity, START_ANALYSIS_ACTION).await?;
    let caller = &identity.0;

    let opts = CheckOptions {
        include_audio: query.include_audio,
        include_ignored: query.include_ignored,
    };
    let (media, rows) = state.coordinator.load(media_id).await?;
    let mut outcome = state.coordinator.check_results(&media, &rows, opts).await;

    if !outcome.to_start.is_empty() && caller.is_authenticated() {
        match state.throttle.admit(caller, media.id).await? {
            Admission::Throttled {
                category,
                ceiling,
                resets_at,
            } => {
                return Err(AppError::Throttled(format!(
                    "{} callers may analyze {} media per hour; next window opens at {}",
                    category,
                    ceiling,
                    resets_at.to_rfc3339()
                ))
                .into());
            }
            admission => tracing::debug!(admission = ?admission, "Analysis admitted"),
        }
    }

    let processing = state
        .coordinator
        .start_analyses(&media, &mut outcome, caller, query.priority)
        .await;

    let decision = state.coordinator.should_update_results(&media, &outcome);
    state.coordinator.persist(media.id, &decision).await?;
    if processing > 0 && matches!(decision, CacheDecision::BlockingPenders(_)) {
        schedule_refresh(&state, media.id, opts.include_audio).await;
    }

    let status = if processing > 0 {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    };
    Ok((
        status,
        Json(AnalysisResponse::new(media.id, &outcome, Some(processing))),
    )
        .into_response())
}

/// Forget one processor's result for a media item and run it again.
#[tracing::instrument(skip(state, identity, request), fields(media_id = %media_id))]
pub async fn reset_analysis(
    State(state): State<Arc<AppState>>,
    Path(media_id): Path<Uuid>,
    identity: CallerIdentity,
    ValidatedJson(request): ValidatedJson<ResetAnalysisRequest>,
) -> Result<Json<ResetReport>, HttpAppError> {
    if !identity.0.is_authenticated() {
        return Err(AppError::Unauthorized(
            "Resetting an analysis requires a signed-in caller".to_string(),
        )
        .into());
    }
    enforce_rate_limit(&state, &identity, RESET_ANALYSIS_ACTION).await?;

    let report = state
        .coordinator
        .reset_processor(media_id, &request.processor_id, &identity.0, request.priority)
        .await?;
    Ok(Json(report))
}
