use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;
use uuid::Uuid;

use super::throttle::{Caller, UserCategory};

/// Lifecycle of an analysis job.
///
/// Moves forward only: UPLOADING -> PROCESSING -> COMPLETE | ERROR.
/// The terminal states are left only by an administrative reset, which deletes the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestState {
    Uploading,
    Processing,
    Complete,
    Error,
}

impl RequestState {
    fn ordinal(self) -> u8 {
        match self {
            RequestState::Uploading => 0,
            RequestState::Processing => 1,
            RequestState::Complete | RequestState::Error => 2,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RequestState::Complete | RequestState::Error)
    }

    /// Same-state writes are allowed for non-terminal states (idempotent upserts).
    pub fn can_transition_to(self, next: RequestState) -> bool {
        if self.is_terminal() {
            return false;
        }
        next.ordinal() >= self.ordinal()
    }
}

impl Display for RequestState {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            RequestState::Uploading => write!(f, "UPLOADING"),
            RequestState::Processing => write!(f, "PROCESSING"),
            RequestState::Complete => write!(f, "COMPLETE"),
            RequestState::Error => write!(f, "ERROR"),
        }
    }
}

impl FromStr for RequestState {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UPLOADING" => Ok(RequestState::Uploading),
            "PROCESSING" => Ok(RequestState::Processing),
            "COMPLETE" => Ok(RequestState::Complete),
            "ERROR" => Ok(RequestState::Error),
            _ => Err(anyhow::anyhow!("Invalid request state: {}", s)),
        }
    }
}

/// Who triggered an analysis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribution {
    pub user_id: Option<Uuid>,
    pub api_key_id: Option<Uuid>,
    pub category: UserCategory,
}

impl Attribution {
    pub fn system() -> Self {
        Self {
            user_id: None,
            api_key_id: None,
            category: UserCategory::Api,
        }
    }
}

impl From<&Caller> for Attribution {
    fn from(caller: &Caller) -> Self {
        Self {
            user_id: caller.user_id,
            api_key_id: caller.api_key_id,
            category: caller.category,
        }
    }
}

/// Row identity: at most one analysis result per (track, processor).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AnalysisKey {
    pub media_id: Uuid,
    pub processor_id: String,
}

impl AnalysisKey {
    pub fn new(media_id: Uuid, processor_id: impl Into<String>) -> Self {
        Self {
            media_id,
            processor_id: processor_id.into(),
        }
    }
}

impl Display for AnalysisKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}/{}", self.media_id, self.processor_id)
    }
}

/// Persisted job record for one processor run on one track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    /// Track id (the media id for the primary track).
    pub media_id: Uuid,
    pub processor_id: String,
    /// Provider handle, or an internal job id until the provider handle is known.
    pub request_id: String,
    pub request_state: RequestState,
    pub raw: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub user_id: Option<Uuid>,
    pub api_key_id: Option<Uuid>,
    pub user_category: UserCategory,
}

#[cfg(feature = "sqlx")]
impl sqlx::FromRow<'_, sqlx::postgres::PgRow> for AnalysisResult {
    fn from_row(row: &sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        Ok(AnalysisResult {
            media_id: row.get("media_id"),
            processor_id: row.get("processor_id"),
            request_id: row.get("request_id"),
            request_state: row.get::<String, _>("request_state").parse().map_err(|e| {
                sqlx::Error::Decode(format!("Failed to parse request_state: {}", e).into())
            })?,
            raw: row.get("raw"),
            created_at: row.get("created_at"),
            completed_at: row.get("completed_at"),
            user_id: row.get("user_id"),
            api_key_id: row.get("api_key_id"),
            user_category: row.get::<String, _>("user_category").parse().map_err(|e| {
                sqlx::Error::Decode(format!("Failed to parse user_category: {}", e).into())
            })?,
        })
    }
}

impl AnalysisResult {
    pub fn key(&self) -> AnalysisKey {
        AnalysisKey::new(self.media_id, self.processor_id.clone())
    }

    pub fn attribution(&self) -> Attribution {
        Attribution {
            user_id: self.user_id,
            api_key_id: self.api_key_id,
            category: self.user_category,
        }
    }

    /// Wall-clock time between creation and completion, if completed.
    pub fn duration_ms(&self) -> Option<i64> {
        self.completed_at
            .map(|done| done.signed_duration_since(self.created_at).num_milliseconds().max(0))
    }

    /// The `{error, detail}` message stored on ERROR rows.
    pub fn error_message(&self) -> Option<String> {
        if self.request_state != RequestState::Error {
            return None;
        }
        let message = self
            .raw
            .as_ref()
            .and_then(|raw| raw.get("error"))
            .and_then(|e| e.as_str())
            .unwrap_or("analysis failed");
        Some(message.to_string())
    }
}

/// Payload stored on a row that failed during dispatch.
pub fn error_payload(error: impl Into<String>, detail: Option<serde_json::Value>) -> serde_json::Value {
    json!({
        "error": error.into(),
        "detail": detail,
    })
}
