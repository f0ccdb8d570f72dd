//! Per-metric consensus aggregation.
//!
//! Combines however many provider scores actually arrived (0..N) into one
//! MetricConsensus. All providers are peers: the consensus is an unweighted
//! mean, dispersion is population standard deviation, and disagreement is
//! surfaced through the confidence label rather than smoothed away; a
//! single outlier is never trimmed.

use tracing::debug;

use crate::config::ConsensusConfig;
use crate::consensus::models::{ConfidenceLevel, MetricConsensus};
use crate::provider::ProviderScore;

/// Aggregate one (metric, city) pair's provider scores.
///
/// Order of the input never matters; mean and standard deviation are
/// commutative over the score set.
pub fn aggregate_metric(
    metric_id: &str,
    mut scores: Vec<ProviderScore>,
    config: &ConsensusConfig,
) -> MetricConsensus {
    if scores.is_empty() {
        return MetricConsensus::no_data(metric_id);
    }

    // Clamp before aggregation so a misbehaving provider cannot push the
    // consensus outside the scale.
    for score in &mut scores {
        score.score = score.score.clamp(0.0, 100.0);
        score.law_score = score.law_score.map(|v| v.clamp(0.0, 100.0));
        score.lived_score = score.lived_score.map(|v| v.clamp(0.0, 100.0));
    }

    let values: Vec<f64> = scores.iter().map(|s| s.score).collect();
    let consensus = mean(&values);
    let std_dev = population_std_dev(&values, consensus);
    let confidence = confidence_for(std_dev, config);

    let law_score = dimension_mean(scores.iter().map(|s| s.law_score));
    let lived_score = dimension_mean(scores.iter().map(|s| s.lived_score));

    debug!(
        metric_id,
        providers = scores.len(),
        consensus,
        std_dev,
        confidence = %confidence,
        "Metric consensus computed"
    );

    MetricConsensus {
        metric_id: metric_id.to_string(),
        score: Some(consensus),
        std_dev: Some(std_dev),
        confidence,
        law_score,
        lived_score,
        provider_scores: scores,
    }
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation (÷ n). 0.0 for a single value.
fn population_std_dev(values: &[f64], mean: f64) -> f64 {
    let variance =
        values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

/// Mean of an optional per-provider dimension, over the providers that
/// reported it. `None` when nobody did.
fn dimension_mean(values: impl Iterator<Item = Option<f64>>) -> Option<f64> {
    let present: Vec<f64> = values.flatten().collect();
    if present.is_empty() {
        None
    } else {
        Some(mean(&present))
    }
}

fn confidence_for(std_dev: f64, config: &ConsensusConfig) -> ConfidenceLevel {
    if std_dev <= config.unanimous_max_std_dev {
        ConfidenceLevel::Unanimous
    } else if std_dev <= config.strong_max_std_dev {
        ConfidenceLevel::Strong
    } else if std_dev <= config.moderate_max_std_dev {
        ConfidenceLevel::Moderate
    } else {
        ConfidenceLevel::Split
    }
}
