//! Result adapters
//!
//! An adapter turns one processor's raw provider payload into typed model
//! results. `check` runs first and reports provider-declared failures; `adapt`
//! is only called on payloads that passed `check`.

use anyhow::{Context, Result};
use serde_json::Value as JsonValue;
use std::fmt::Debug;

use verita_core::models::{FaceBox, ModelExtras, ModelResult, ModelSpec, ProcessorSpec, Rank};

pub trait ResultAdapter: Send + Sync + Debug {
    /// Provider-declared error carried by the payload, if any.
    fn check(&self, raw: &JsonValue) -> Option<String>;

    fn adapt(&self, raw: &JsonValue) -> Result<Vec<ModelResult>>;
}

/// Adapter for payloads shaped `{"scores": {<model_id>: <score or object>}}`.
///
/// A score entry is either a bare number or an object with `score` and the
/// optional `faces`, `generator` and `rationale` extras. Ranks come from the
/// model's thresholds. Keys for models the processor doesn't declare are skipped.
#[derive(Debug, Clone)]
pub struct ScoreAdapter {
    models: Vec<ModelSpec>,
}

impl ScoreAdapter {
    pub fn new(models: Vec<ModelSpec>) -> Self {
        Self { models }
    }

    pub fn for_spec(spec: &ProcessorSpec) -> Self {
        Self::new(spec.models.clone())
    }
}

impl ResultAdapter for ScoreAdapter {
    fn check(&self, raw: &JsonValue) -> Option<String> {
        if let Some(error) = raw.get("error").filter(|e| !e.is_null()) {
            return Some(
                error
                    .as_str()
                    .map(str::to_string)
                    .unwrap_or_else(|| error.to_string()),
            );
        }
        if raw.get("status").and_then(|s| s.as_str()) == Some("error") {
            return Some("provider reported an error".to_string());
        }
        if raw.get("scores").map_or(true, |s| !s.is_object()) {
            return Some("payload has no scores".to_string());
        }
        None
    }

    fn adapt(&self, raw: &JsonValue) -> Result<Vec<ModelResult>> {
        let scores = raw
            .get("scores")
            .and_then(|s| s.as_object())
            .context("payload has no scores object")?;

        let mut results = Vec::new();
        for model in &self.models {
            let Some(entry) = scores.get(&model.id) else {
                continue;
            };

            let (score, extras) = match entry {
                JsonValue::Null => (None, None),
                JsonValue::Number(n) => (n.as_f64(), None),
                JsonValue::Object(obj) => {
                    let score = obj.get("score").and_then(|s| s.as_f64());
                    let faces = match obj.get("faces") {
                        Some(faces) if !faces.is_null() => Some(
                            serde_json::from_value::<Vec<FaceBox>>(faces.clone())
                                .with_context(|| format!("invalid faces for model {}", model.id))?,
                        ),
                        _ => None,
                    };
                    let extras = ModelExtras {
                        faces,
                        generator: obj.get("generator").and_then(|g| g.as_str()).map(str::to_string),
                        rationale: obj.get("rationale").and_then(|r| r.as_str()).map(str::to_string),
                    };
                    let has_extras = extras != ModelExtras::default();
                    (score, has_extras.then_some(extras))
                }
                other => anyhow::bail!("unexpected score for model {}: {}", model.id, other),
            };

            let rank = model.thresholds.rank_for(score);
            // Out-of-range scores rank Unknown and are not kept
            let score = score.filter(|s| (0.0..=1.0).contains(s));
            if rank == Rank::Unknown {
                tracing::warn!(model_id = %model.id, entry = %entry, "Score outside [0, 1], dropping it");
            }

            let mut result = ModelResult::new(&model.id, rank, score);
            if let Some(extras) = extras {
                result = result.with_extras(extras);
            }
            results.push(result);
        }

        Ok(results)
    }
}
