use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;
use std::time::Duration;

use super::media::MediaType;
use super::model_result::RankThresholds;

/// Default time after which a stuck PROCESSING row is force-failed.
pub const DEFAULT_PROCESSOR_TIMEOUT_MS: u64 = 10 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Availability {
    Enabled,
    /// Temporarily switched off (e.g. provider outage). Pending rows don't block finalization.
    Disabled,
    Archived,
    /// Runs only when explicitly requested.
    Ignore,
}

impl Display for Availability {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            Availability::Enabled => write!(f, "enabled"),
            Availability::Disabled => write!(f, "disabled"),
            Availability::Archived => write!(f, "archived"),
            Availability::Ignore => write!(f, "ignore"),
        }
    }
}

impl FromStr for Availability {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "enabled" => Ok(Availability::Enabled),
            "disabled" => Ok(Availability::Disabled),
            "archived" => Ok(Availability::Archived),
            "ignore" => Ok(Availability::Ignore),
            _ => Err(anyhow::anyhow!("Invalid availability: {}", s)),
        }
    }
}

/// A model surfaced by a processor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub id: String,
    #[serde(default)]
    pub ignored: bool,
    #[serde(default)]
    pub thresholds: RankThresholds,
}

impl ModelSpec {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ignored: false,
            thresholds: RankThresholds::default(),
        }
    }

    pub fn ignored(mut self) -> Self {
        self.ignored = true;
        self
    }
}

/// Static description of a detection backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessorSpec {
    pub id: String,
    pub media_type: MediaType,
    /// Bulk concurrency cap across all media. 0 means the job queue handles it.
    #[serde(default)]
    pub max_pending: u32,
    #[serde(default)]
    pub max_size: Option<u64>,
    /// Maximum input duration in seconds.
    #[serde(default)]
    pub max_duration: Option<f64>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    pub availability: Availability,
    #[serde(default)]
    pub models: Vec<ModelSpec>,
    /// Dispatch goes through the scheduled-job subsystem, which owns retries and timeouts.
    #[serde(default)]
    pub managed_by_queue: bool,
}

fn default_timeout_ms() -> u64 {
    DEFAULT_PROCESSOR_TIMEOUT_MS
}

impl ProcessorSpec {
    pub fn new(id: impl Into<String>, media_type: MediaType) -> Self {
        Self {
            id: id.into(),
            media_type,
            max_pending: 0,
            max_size: None,
            max_duration: None,
            timeout_ms: DEFAULT_PROCESSOR_TIMEOUT_MS,
            availability: Availability::Enabled,
            models: Vec::new(),
            managed_by_queue: false,
        }
    }

    pub fn with_model(mut self, model: ModelSpec) -> Self {
        self.models.push(model);
        self
    }

    pub fn with_availability(mut self, availability: Availability) -> Self {
        self.availability = availability;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn is_enabled(&self) -> bool {
        self.availability == Availability::Enabled
    }

    pub fn applies_to(&self, media_type: MediaType) -> bool {
        self.media_type == media_type
    }

    /// Enabled, and unless `include_ignored`, carries at least one non-ignored model.
    pub fn passes_enablement(&self, include_ignored: bool) -> bool {
        if !self.is_enabled() {
            return false;
        }
        include_ignored || self.models.iter().any(|m| !m.ignored)
    }

    pub fn model(&self, model_id: &str) -> Option<&ModelSpec> {
        self.models.iter().find(|m| m.id == model_id)
    }

    pub fn model_ids(&self) -> impl Iterator<Item = &str> {
        self.models.iter().map(|m| m.id.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enablement_policy() {
        let spec = ProcessorSpec::new("p", MediaType::Image).with_model(ModelSpec::new("m"));
        assert!(spec.passes_enablement(false));

        let only_ignored =
            ProcessorSpec::new("p", MediaType::Image).with_model(ModelSpec::new("m").ignored());
        assert!(!only_ignored.passes_enablement(false));
        assert!(only_ignored.passes_enablement(true));

        let disabled = spec.clone().with_availability(Availability::Disabled);
        assert!(!disabled.passes_enablement(true));
    }

    #[test]
    fn test_spec_defaults_from_json() {
        let spec: ProcessorSpec = serde_json::from_str(
            r#"{"id":"hive","media_type":"image","availability":"enabled"}"#,
        )
        .unwrap();
        assert_eq!(spec.timeout(), Duration::from_secs(600));
        assert_eq!(spec.max_pending, 0);
        assert!(!spec.managed_by_queue);
    }
}
