use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;
use uuid::Uuid;

use super::cache::CachedResults;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Video,
    Audio,
    Image,
}

impl Display for MediaType {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            MediaType::Video => write!(f, "video"),
            MediaType::Audio => write!(f, "audio"),
            MediaType::Image => write!(f, "image"),
        }
    }
}

impl FromStr for MediaType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "video" => Ok(MediaType::Video),
            "audio" => Ok(MediaType::Audio),
            "image" => Ok(MediaType::Image),
            _ => Err(anyhow::anyhow!("Invalid media type: {}", s)),
        }
    }
}

/// A media item submitted for analysis.
///
/// Video items may carry an extracted audio stream (`audio_id`), which is analyzed
/// as an independent track by audio processors. `cached_results` is the
/// materialized summary of every completed processor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Media {
    pub id: Uuid,
    pub media_type: MediaType,
    pub filename: String,
    pub mime_type: String,
    pub audio_id: Option<Uuid>,
    pub audio_mime_type: Option<String>,
    pub cached_results: Option<CachedResults>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(feature = "sqlx")]
impl sqlx::FromRow<'_, sqlx::postgres::PgRow> for Media {
    fn from_row(row: &sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        let cached_results: Option<serde_json::Value> = row.get("cached_results");
        Ok(Media {
            id: row.get("id"),
            media_type: row.get::<String, _>("media_type").parse().map_err(|e| {
                sqlx::Error::Decode(format!("Failed to parse media_type: {}", e).into())
            })?,
            filename: row.get("filename"),
            mime_type: row.get("mime_type"),
            audio_id: row.get("audio_id"),
            audio_mime_type: row.get("audio_mime_type"),
            cached_results: cached_results
                .map(serde_json::from_value)
                .transpose()
                .map_err(|e| {
                    sqlx::Error::Decode(format!("Failed to parse cached_results: {}", e).into())
                })?,
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }
}

impl Media {
    pub fn new(media_type: MediaType, filename: impl Into<String>, mime_type: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            media_type,
            filename: filename.into(),
            mime_type: mime_type.into(),
            audio_id: None,
            audio_mime_type: None,
            cached_results: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_audio_track(mut self, audio_id: Uuid, mime_type: impl Into<String>) -> Self {
        self.audio_id = Some(audio_id);
        self.audio_mime_type = Some(mime_type.into());
        self
    }

    pub fn primary_track(&self) -> MediaTrack {
        MediaTrack {
            id: self.id,
            media_id: self.id,
            media_type: self.media_type,
            filename: self.filename.clone(),
            mime_type: self.mime_type.clone(),
            url: None,
            size: None,
            duration: None,
        }
    }

    /// The extracted audio stream, only for video items that have one.
    pub fn audio_track(&self) -> Option<MediaTrack> {
        if self.media_type != MediaType::Video {
            return None;
        }
        let audio_id = self.audio_id?;
        Some(MediaTrack {
            id: audio_id,
            media_id: self.id,
            media_type: MediaType::Audio,
            filename: self.filename.clone(),
            mime_type: self
                .audio_mime_type
                .clone()
                .unwrap_or_else(|| "audio/mpeg".to_string()),
            url: None,
            size: None,
            duration: None,
        })
    }

    /// Tracks eligible for analysis, primary first.
    pub fn tracks(&self, include_audio: bool) -> Vec<MediaTrack> {
        let mut tracks = vec![self.primary_track()];
        if include_audio {
            if let Some(audio) = self.audio_track() {
                tracks.push(audio);
            }
        }
        tracks
    }

    /// Ids under which analysis rows for this media are stored.
    pub fn track_ids(&self) -> Vec<Uuid> {
        let mut ids = vec![self.id];
        if let Some(audio) = self.audio_track() {
            ids.push(audio.id);
        }
        ids
    }
}

/// One independently analyzed stream of a media item.
///
/// Analysis rows are keyed by the track id: the primary track shares the media
/// id, the extracted audio track uses its own id. `url`, `size` and `duration`
/// stay empty until the resolver reports the track ready.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaTrack {
    pub id: Uuid,
    pub media_id: Uuid,
    pub media_type: MediaType,
    pub filename: String,
    pub mime_type: String,
    pub url: Option<String>,
    pub size: Option<u64>,
    pub duration: Option<f64>,
}

impl MediaTrack {
    pub fn is_primary(&self) -> bool {
        self.id == self.media_id
    }
}
