//! Domain records for the consensus derivation pipeline.
//!
//! ProviderScore → MetricConsensus → CategoryConsensus → CityConsensusScore
//! → ComparisonResult is a strict one-way derivation: nothing in this chain
//! is mutated once downstream derivation has consumed it. A consensus score
//! of `None` always means absence of data; zero is a legitimate score.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::judge::JudgeVerdict;
use crate::provider::ProviderScore;

/// The city being scored. Region hints keep the providers from confusing
/// same-named cities (Portland OR vs Portland ME).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CityDescriptor {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
}

impl CityDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            region: None,
            country: None,
        }
    }

    /// Human-readable form used in prompts and cache keys.
    pub fn display_name(&self) -> String {
        let mut parts = vec![self.name.clone()];
        if let Some(region) = &self.region {
            parts.push(region.clone());
        }
        if let Some(country) = &self.country {
            parts.push(country.clone());
        }
        parts.join(", ")
    }
}

impl std::fmt::Display for CityDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// How much the providers agreed on one metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceLevel {
    Unanimous,
    Strong,
    Moderate,
    Split,
    NoData,
}

impl std::fmt::Display for ConfidenceLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unanimous => write!(f, "unanimous"),
            Self::Strong => write!(f, "strong"),
            Self::Moderate => write!(f, "moderate"),
            Self::Split => write!(f, "split"),
            Self::NoData => write!(f, "no_data"),
        }
    }
}

/// Consensus across providers for one (metric, city) pair.
///
/// The full provider score list is retained so the evidence panel can show
/// every citation that fed the consensus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricConsensus {
    pub metric_id: String,
    /// Mean of the provider scores; `None` when no provider returned data.
    pub score: Option<f64>,
    /// Population standard deviation; 0.0 for a single score.
    pub std_dev: Option<f64>,
    pub confidence: ConfidenceLevel,
    /// Written-law consensus, for dual-dimension metrics.
    pub law_score: Option<f64>,
    /// Lived-experience consensus, for dual-dimension metrics.
    pub lived_score: Option<f64>,
    pub provider_scores: Vec<ProviderScore>,
}

impl MetricConsensus {
    pub fn no_data(metric_id: impl Into<String>) -> Self {
        Self {
            metric_id: metric_id.into(),
            score: None,
            std_dev: None,
            confidence: ConfidenceLevel::NoData,
            law_score: None,
            lived_score: None,
            provider_scores: Vec::new(),
        }
    }

    /// How many providers actually contributed.
    pub fn provider_count(&self) -> usize {
        self.provider_scores.len()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryConsensus {
    pub category_id: String,
    /// Weighted mean of this category's scored metrics; `None` when every
    /// metric came back `no_data`.
    pub score: Option<f64>,
    /// Effective share (0-100) of the city total after redistribution.
    pub weight: u32,
    pub metrics: Vec<MetricConsensus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CityConsensusScore {
    pub city: CityDescriptor,
    /// 0-100, comparable between the two cities; `None` when no category
    /// produced a score.
    pub total_score: Option<f64>,
    pub categories: Vec<CategoryConsensus>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Winner {
    City1,
    City2,
    Tie,
}

impl std::fmt::Display for Winner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::City1 => write!(f, "city1"),
            Self::City2 => write!(f, "city2"),
            Self::Tie => write!(f, "tie"),
        }
    }
}

/// Processing statistics for one comparison run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunStats {
    pub provider_calls_attempted: u64,
    pub provider_calls_succeeded: u64,
    pub failures_rate_limited: u64,
    pub failures_timeout: u64,
    pub failures_invalid_response: u64,
    pub failures_provider_error: u64,
    pub cache_hits: u64,
    pub duration_ms: u64,
    pub total_api_cost: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComparisonMetadata {
    pub id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub providers: Vec<String>,
    pub stats: RunStats,
}

/// Top-level record for one comparison run. Created once, never mutated;
/// corrections require a new run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComparisonResult {
    pub metadata: ComparisonMetadata,
    pub city1: CityConsensusScore,
    pub city2: CityConsensusScore,
    pub winner: Winner,
    pub score_difference: f64,
    /// Narrative verdict; absent when judge synthesis failed. The numeric
    /// winner above stands regardless.
    pub verdict: Option<JudgeVerdict>,
}

/// Deterministic winner from the two totals. Cities that could not be scored
/// at all make the comparison a tie rather than a fabricated loss.
pub fn determine_winner(city1_total: Option<f64>, city2_total: Option<f64>) -> (Winner, f64) {
    match (city1_total, city2_total) {
        (Some(a), Some(b)) => {
            let diff = (a - b).abs();
            if a > b {
                (Winner::City1, diff)
            } else if b > a {
                (Winner::City2, diff)
            } else {
                (Winner::Tie, 0.0)
            }
        }
        _ => (Winner::Tie, 0.0),
    }
}
