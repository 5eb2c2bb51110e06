use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::model_result::ModelResult;

/// Materialized summary of every completed model on a media item.
///
/// Backed by an ordered map so two summaries holding the same entries compare
/// equal and serialize identically regardless of the order results arrived in.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CachedResults {
    #[serde(default)]
    pub results: BTreeMap<String, ModelResult>,
    /// Longest single processor analysis time, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis_time_ms: Option<i64>,
}

impl CachedResults {
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn get(&self, model_id: &str) -> Option<&ModelResult> {
        self.results.get(model_id)
    }

    /// Insert results, replacing any previous entry for the same model.
    pub fn merge(&mut self, results: impl IntoIterator<Item = ModelResult>) {
        for result in results {
            self.results.insert(result.model_id.clone(), result);
        }
    }

    /// Keep the longest analysis duration seen so far.
    pub fn record_analysis_time(&mut self, duration_ms: i64) {
        self.analysis_time_ms = Some(self.analysis_time_ms.map_or(duration_ms, |t| t.max(duration_ms)));
    }

    pub fn remove_models<'a>(&mut self, model_ids: impl IntoIterator<Item = &'a str>) {
        for id in model_ids {
            self.results.remove(id);
        }
    }
}
