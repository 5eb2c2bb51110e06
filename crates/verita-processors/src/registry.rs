//! Processor registry
//!
//! Immutable catalog built once at startup and shared behind an `Arc`. Every
//! registered processor carries its result adapter and an [`Integration`]
//! telling the coordinator how completions arrive.

use std::collections::{HashMap, HashSet};
use std::fmt::{Debug, Formatter, Result as FmtResult};
use std::sync::Arc;

use verita_core::models::{MediaType, ProcessorSpec};

use crate::adapter::ResultAdapter;
use crate::starter::{Checker, Starter};

/// How a processor is dispatched and how its completion is observed.
#[derive(Clone)]
pub enum Integration {
    /// The Starter returns the final result.
    Sync(Arc<dyn Starter>),
    /// The Starter stores a provider handle; the Checker polls it.
    Poll {
        starter: Arc<dyn Starter>,
        checker: Arc<dyn Checker>,
    },
    /// The Starter stores a provider handle; the provider calls our webhook.
    Webhook(Arc<dyn Starter>),
}

impl Integration {
    pub fn starter(&self) -> &Arc<dyn Starter> {
        match self {
            Integration::Sync(starter) | Integration::Webhook(starter) => starter,
            Integration::Poll { starter, .. } => starter,
        }
    }

    pub fn checker(&self) -> Option<&Arc<dyn Checker>> {
        match self {
            Integration::Poll { checker, .. } => Some(checker),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Integration::Sync(_) => "sync",
            Integration::Poll { .. } => "poll",
            Integration::Webhook(_) => "webhook",
        }
    }
}

impl Debug for Integration {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "Integration::{}", self.kind())
    }
}

pub struct RegisteredProcessor {
    pub spec: Arc<ProcessorSpec>,
    pub adapter: Arc<dyn ResultAdapter>,
    pub integration: Integration,
}

impl RegisteredProcessor {
    pub fn id(&self) -> &str {
        &self.spec.id
    }

    pub fn starter(&self) -> &Arc<dyn Starter> {
        self.integration.starter()
    }

    pub fn checker(&self) -> Option<&Arc<dyn Checker>> {
        self.integration.checker()
    }

    pub fn is_webhook(&self) -> bool {
        matches!(self.integration, Integration::Webhook(_))
    }
}

impl Debug for RegisteredProcessor {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.debug_struct("RegisteredProcessor")
            .field("id", &self.spec.id)
            .field("integration", &self.integration)
            .finish()
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Processor '{0}' is registered twice")]
    Duplicate(String),

    #[error("Processor '{0}' has no starter")]
    MissingStarter(String),

    #[error("Processor '{0}' has no result adapter")]
    MissingAdapter(String),

    #[error("Processor '{processor}' declares model '{model}' twice")]
    DuplicateModel { processor: String, model: String },

    #[error("Processor '{processor}' model '{model}' has invalid thresholds")]
    InvalidThresholds { processor: String, model: String },
}

/// One processor awaiting validation.
pub struct ProcessorEntry {
    spec: ProcessorSpec,
    adapter: Option<Arc<dyn ResultAdapter>>,
    integration: Option<Integration>,
}

impl ProcessorEntry {
    pub fn new(spec: ProcessorSpec) -> Self {
        Self {
            spec,
            adapter: None,
            integration: None,
        }
    }

    pub fn adapter(mut self, adapter: Arc<dyn ResultAdapter>) -> Self {
        self.adapter = Some(adapter);
        self
    }

    pub fn integration(mut self, integration: Integration) -> Self {
        self.integration = Some(integration);
        self
    }
}

#[derive(Default)]
pub struct RegistryBuilder {
    entries: Vec<ProcessorEntry>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, entry: ProcessorEntry) -> Self {
        self.entries.push(entry);
        self
    }

    /// Validate every entry and freeze the catalog.
    pub fn build(self) -> Result<ProcessorRegistry, RegistryError> {
        let mut processors = Vec::with_capacity(self.entries.len());
        let mut by_id = HashMap::new();

        for entry in self.entries {
            let id = entry.spec.id.clone();
            if by_id.contains_key(&id) {
                return Err(RegistryError::Duplicate(id));
            }

            let integration = entry
                .integration
                .ok_or_else(|| RegistryError::MissingStarter(id.clone()))?;
            let adapter = entry
                .adapter
                .ok_or_else(|| RegistryError::MissingAdapter(id.clone()))?;

            let mut seen = HashSet::new();
            for model in &entry.spec.models {
                if !seen.insert(model.id.as_str()) {
                    return Err(RegistryError::DuplicateModel {
                        processor: id,
                        model: model.id.clone(),
                    });
                }
                let t = model.thresholds;
                if !(0.0..=1.0).contains(&t.low) || !(0.0..=1.0).contains(&t.high) || t.low > t.high {
                    return Err(RegistryError::InvalidThresholds {
                        processor: id,
                        model: model.id.clone(),
                    });
                }
            }

            by_id.insert(id, processors.len());
            processors.push(Arc::new(RegisteredProcessor {
                spec: Arc::new(entry.spec),
                adapter,
                integration,
            }));
        }

        tracing::info!(processors = processors.len(), "Processor registry built");

        Ok(ProcessorRegistry { processors, by_id })
    }
}

/// Immutable processor catalog. Iteration follows registration order.
#[derive(Debug)]
pub struct ProcessorRegistry {
    processors: Vec<Arc<RegisteredProcessor>>,
    by_id: HashMap<String, usize>,
}

impl ProcessorRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    pub fn get(&self, id: &str) -> Option<&Arc<RegisteredProcessor>> {
        self.by_id.get(id).map(|&i| &self.processors[i])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<RegisteredProcessor>> {
        self.processors.iter()
    }

    pub fn for_media_type(
        &self,
        media_type: MediaType,
    ) -> impl Iterator<Item = &Arc<RegisteredProcessor>> {
        self.processors
            .iter()
            .filter(move |p| p.spec.applies_to(media_type))
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::ScoreAdapter;
    use crate::error::ProcessorError;
    use crate::starter::{StartOutcome, StartRequest};
    use async_trait::async_trait;
    use verita_core::models::{ModelSpec, RankThresholds};

    struct NoopStarter;

    #[async_trait]
    impl Starter for NoopStarter {
        async fn start(&self, _request: StartRequest) -> Result<StartOutcome, ProcessorError> {
            Ok(StartOutcome::Processing)
        }
    }

    fn entry(id: &str, media_type: MediaType) -> ProcessorEntry {
        let spec = ProcessorSpec::new(id, media_type).with_model(ModelSpec::new(format!("{}-model", id)));
        let adapter = Arc::new(ScoreAdapter::for_spec(&spec));
        ProcessorEntry::new(spec)
            .adapter(adapter)
            .integration(Integration::Webhook(Arc::new(NoopStarter)))
    }

    #[test]
    fn test_build_and_lookup() {
        let registry = ProcessorRegistry::builder()
            .register(entry("hive", MediaType::Image))
            .register(entry("reality", MediaType::Video))
            .register(entry("voice", MediaType::Audio))
            .build()
            .unwrap();

        assert_eq!(registry.len(), 3);
        assert!(registry.get("hive").unwrap().is_webhook());
        assert!(registry.get("missing").is_none());
        let video: Vec<_> = registry.for_media_type(MediaType::Video).map(|p| p.id()).collect();
        assert_eq!(video, vec!["reality"]);
    }

    #[test]
    fn test_missing_starter_fails_fast() {
        let spec = ProcessorSpec::new("hive", MediaType::Image);
        let adapter = Arc::new(ScoreAdapter::for_spec(&spec));
        let err = ProcessorRegistry::builder()
            .register(ProcessorEntry::new(spec).adapter(adapter))
            .build()
            .unwrap_err();
        assert_eq!(err, RegistryError::MissingStarter("hive".to_string()));
    }

    #[test]
    fn test_duplicate_processor_rejected() {
        let err = ProcessorRegistry::builder()
            .register(entry("hive", MediaType::Image))
            .register(entry("hive", MediaType::Video))
            .build()
            .unwrap_err();
        assert_eq!(err, RegistryError::Duplicate("hive".to_string()));
    }

    #[test]
    fn test_invalid_thresholds_rejected() {
        let mut model = ModelSpec::new("m");
        model.thresholds = RankThresholds { low: 0.9, high: 0.2 };
        let spec = ProcessorSpec::new("hive", MediaType::Image).with_model(model);
        let adapter = Arc::new(ScoreAdapter::for_spec(&spec));
        let err = ProcessorRegistry::builder()
            .register(
                ProcessorEntry::new(spec)
                    .adapter(adapter)
                    .integration(Integration::Webhook(Arc::new(NoopStarter))),
            )
            .build()
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidThresholds { .. }));
    }
}
