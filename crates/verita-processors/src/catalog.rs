//! JSON processor catalog
//!
//! Deployments describe their processors in a JSON file (`PROCESSORS_CONFIG`).
//! Each entry is a [`ProcessorSpec`] plus the HTTP integration settings; the
//! API key is read from the environment variable named by `api_key_env`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

use verita_core::models::ProcessorSpec;

use crate::adapter::ScoreAdapter;
use crate::http::{HttpChecker, HttpProcessorConfig, HttpStarter};
use crate::registry::{Integration, ProcessorEntry, ProcessorRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntegrationKind {
    Sync,
    Poll,
    Webhook,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogEntry {
    #[serde(flatten)]
    pub spec: ProcessorSpec,
    pub integration: IntegrationKind,
    pub base_url: String,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessorCatalog {
    #[serde(default)]
    pub processors: Vec<CatalogEntry>,
}

impl ProcessorCatalog {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to parse processor catalog")
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read processor catalog {}", path.display()))?;
        Self::from_json(&json)
    }

    /// Build the registry with HTTP integrations and score adapters.
    ///
    /// `lookup` resolves `api_key_env` names; a missing key is not an error here,
    /// the processor fails its dispatches with a missing-credentials error instead.
    pub fn into_registry(
        self,
        webhook_base_url: Option<&str>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<ProcessorRegistry> {
        let mut builder = ProcessorRegistry::builder();

        for entry in self.processors {
            let id = entry.spec.id.clone();
            let api_key = entry.api_key_env.as_deref().and_then(&lookup);
            if entry.api_key_env.is_some() && api_key.is_none() {
                tracing::warn!(processor_id = %id, "Processor API key is not configured");
            }

            let mut config = HttpProcessorConfig::new(&entry.base_url, api_key);
            if let Some(secs) = entry.request_timeout_secs {
                config.request_timeout_secs = secs;
            }
            if entry.integration == IntegrationKind::Webhook {
                let base = webhook_base_url.with_context(|| {
                    format!("Processor '{}' uses webhooks but WEBHOOK_BASE_URL is not set", id)
                })?;
                config = config.with_callback_url(format!("{}/{}", base.trim_end_matches('/'), id));
            }

            let starter = Arc::new(HttpStarter::new(&id, config.clone())?);
            let integration = match entry.integration {
                IntegrationKind::Sync => Integration::Sync(starter),
                IntegrationKind::Webhook => Integration::Webhook(starter),
                IntegrationKind::Poll => Integration::Poll {
                    starter,
                    checker: Arc::new(HttpChecker::new(&id, config)?),
                },
            };

            let adapter = Arc::new(ScoreAdapter::for_spec(&entry.spec));
            builder = builder.register(
                ProcessorEntry::new(entry.spec)
                    .adapter(adapter)
                    .integration(integration),
            );
        }

        Ok(builder.build()?)
    }
}
