//! Media URL resolution
//!
//! Downloading and hosting media is handled elsewhere; the coordinator only asks
//! whether a track can be fetched by a provider yet.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use uuid::Uuid;

use verita_core::models::MediaTrack;

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Ready {
        url: String,
        size: Option<u64>,
        duration: Option<f64>,
    },
    StillDownloading,
    Failed { reason: String },
}

#[async_trait]
pub trait MediaResolver: Send + Sync {
    async fn resolve(&self, track: &MediaTrack) -> Result<Resolution>;

    /// True when a track that isn't ready never will be, e.g. a video without
    /// an audio stream whose extraction was still pending.
    async fn is_dead_on_arrival(&self, track: &MediaTrack) -> Result<bool>;
}

/// Resolves every track to a URL built from a template with `{id}` replaced by
/// the track id. Tracks can be overridden individually.
#[derive(Debug, Clone)]
pub struct TemplateResolver {
    template: String,
    overrides: HashMap<Uuid, Resolution>,
    dead: Vec<Uuid>,
}

impl TemplateResolver {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            overrides: HashMap::new(),
            dead: Vec::new(),
        }
    }

    pub fn with_resolution(mut self, track_id: Uuid, resolution: Resolution) -> Self {
        self.overrides.insert(track_id, resolution);
        self
    }

    /// Mark a track as never becoming available.
    pub fn with_dead_track(mut self, track_id: Uuid) -> Self {
        self.overrides.insert(track_id, Resolution::StillDownloading);
        self.dead.push(track_id);
        self
    }
}

#[async_trait]
impl MediaResolver for TemplateResolver {
    async fn resolve(&self, track: &MediaTrack) -> Result<Resolution> {
        if let Some(resolution) = self.overrides.get(&track.id) {
            return Ok(resolution.clone());
        }
        Ok(Resolution::Ready {
            url: self.template.replace("{id}", &track.id.to_string()),
            size: None,
            duration: None,
        })
    }

    async fn is_dead_on_arrival(&self, track: &MediaTrack) -> Result<bool> {
        Ok(self.dead.contains(&track.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use verita_core::models::{Media, MediaType};

    #[tokio::test]
    async fn test_template_and_overrides() {
        let media = Media::new(MediaType::Image, "a.png", "image/png");
        let track = media.primary_track();
        let resolver = TemplateResolver::new("https://cdn.example/{id}");

        assert_eq!(
            resolver.resolve(&track).await.unwrap(),
            Resolution::Ready {
                url: format!("https://cdn.example/{}", track.id),
                size: None,
                duration: None,
            }
        );

        let resolver = resolver.with_dead_track(track.id);
        assert_eq!(resolver.resolve(&track).await.unwrap(), Resolution::StillDownloading);
        assert!(resolver.is_dead_on_arrival(&track).await.unwrap());
    }
}
