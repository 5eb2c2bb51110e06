use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};

/// Coarse bucket derived from a continuous score via per-model thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rank {
    Low,
    Uncertain,
    High,
    Unknown,
    #[serde(rename = "n/a")]
    NotApplicable,
}

impl Display for Rank {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            Rank::Low => write!(f, "low"),
            Rank::Uncertain => write!(f, "uncertain"),
            Rank::High => write!(f, "high"),
            Rank::Unknown => write!(f, "unknown"),
            Rank::NotApplicable => write!(f, "n/a"),
        }
    }
}

/// Score boundaries for a model: below `low` ranks low, at or above `high` ranks high.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RankThresholds {
    pub low: f64,
    pub high: f64,
}

impl Default for RankThresholds {
    fn default() -> Self {
        Self { low: 0.3, high: 0.7 }
    }
}

impl RankThresholds {
    pub fn rank_for(&self, score: Option<f64>) -> Rank {
        match score {
            None => Rank::NotApplicable,
            Some(s) if !(0.0..=1.0).contains(&s) => Rank::Unknown,
            Some(s) if s < self.low => Rank::Low,
            Some(s) if s >= self.high => Rank::High,
            Some(_) => Rank::Uncertain,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    pub score: Option<f64>,
}

/// Model-specific details. Opaque to the coordinator, consumed by the verdict layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelExtras {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub faces: Option<Vec<FaceBox>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
}

/// A single named prediction produced by adapting one processor's raw output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelResult {
    pub model_id: String,
    pub rank: Rank,
    pub score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extras: Option<ModelExtras>,
}

impl ModelResult {
    pub fn new(model_id: impl Into<String>, rank: Rank, score: Option<f64>) -> Self {
        Self {
            model_id: model_id.into(),
            rank,
            score,
            extras: None,
        }
    }

    pub fn with_extras(mut self, extras: ModelExtras) -> Self {
        self.extras = Some(extras);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rank_for_score() {
        let t = RankThresholds { low: 0.2, high: 0.8 };
        assert_eq!(t.rank_for(Some(0.1)), Rank::Low);
        assert_eq!(t.rank_for(Some(0.2)), Rank::Uncertain);
        assert_eq!(t.rank_for(Some(0.79)), Rank::Uncertain);
        assert_eq!(t.rank_for(Some(0.8)), Rank::High);
        assert_eq!(t.rank_for(Some(1.5)), Rank::Unknown);
        assert_eq!(t.rank_for(Some(f64::NAN)), Rank::Unknown);
        assert_eq!(t.rank_for(None), Rank::NotApplicable);
    }

    #[test]
    fn test_rank_serializes_na() {
        let json = serde_json::to_string(&Rank::NotApplicable).unwrap();
        assert_eq!(json, "\"n/a\"");
        let rank: Rank = serde_json::from_str("\"uncertain\"").unwrap();
        assert_eq!(rank, Rank::Uncertain);
    }

    #[test]
    fn test_extras_omitted_when_empty() {
        let result = ModelResult::new("face-swap", Rank::High, Some(0.93));
        let value = serde_json::to_value(&result).unwrap();
        assert!(value.get("extras").is_none());
    }
}
