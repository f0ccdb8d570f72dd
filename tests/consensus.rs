//! Integration tests for the consensus pipeline through the public API.

use std::collections::HashSet;

use chrono::Utc;
use lifescore_engine::config::ConsensusConfig;
use lifescore_engine::consensus::aggregator::aggregate_metric;
use lifescore_engine::consensus::models::{
    determine_winner, CityDescriptor, ConfidenceLevel, MetricConsensus, Winner,
};
use lifescore_engine::consensus::rollup::{
    redistribute_weights, rollup_city, DualDimensionStrategy, RollupPreferences,
};
use lifescore_engine::catalog::MetricCatalog;
use lifescore_engine::provider::ProviderScore;

fn config() -> ConsensusConfig {
    ConsensusConfig {
        unanimous_max_std_dev: 5.0,
        strong_max_std_dev: 10.0,
        moderate_max_std_dev: 15.0,
    }
}

fn score(provider: &str, value: f64) -> ProviderScore {
    ProviderScore {
        provider: provider.to_string(),
        score: value,
        law_score: None,
        lived_score: None,
        reasoning: String::new(),
        citations: Vec::new(),
        timestamp: Utc::now(),
    }
}

fn scores(values: &[f64]) -> Vec<ProviderScore> {
    values
        .iter()
        .enumerate()
        .map(|(i, v)| score(&format!("p{i}"), *v))
        .collect()
}

// ──────────────────────────────────────────
// Per-metric aggregation
// ──────────────────────────────────────────

#[test]
fn tight_agreement_is_unanimous() {
    let consensus = aggregate_metric("m", scores(&[80.0, 82.0, 79.0, 81.0, 83.0]), &config());
    assert_eq!(consensus.score, Some(81.0));
    assert!((consensus.std_dev.unwrap() - 1.4142).abs() < 0.001);
    assert_eq!(consensus.confidence, ConfidenceLevel::Unanimous);
}

#[test]
fn wide_disagreement_is_split_not_smoothed() {
    let consensus = aggregate_metric("m", scores(&[20.0, 90.0, 30.0, 85.0, 25.0]), &config());
    assert_eq!(consensus.score, Some(50.0));
    assert!(consensus.std_dev.unwrap() > 15.0);
    assert_eq!(consensus.confidence, ConfidenceLevel::Split);
    // All five scores survive for the audit trail; no outlier is trimmed.
    assert_eq!(consensus.provider_count(), 5);
}

#[test]
fn zero_scores_are_data_not_absence() {
    let consensus = aggregate_metric("m", scores(&[0.0, 0.0, 0.0]), &config());
    assert_eq!(consensus.score, Some(0.0));
    assert_eq!(consensus.confidence, ConfidenceLevel::Unanimous);
}

#[test]
fn no_providers_is_no_data() {
    let consensus = aggregate_metric("m", Vec::new(), &config());
    assert_eq!(consensus.score, None);
    assert_eq!(consensus.std_dev, None);
    assert_eq!(consensus.confidence, ConfidenceLevel::NoData);
}

#[test]
fn threshold_boundaries_are_inclusive() {
    // Two scores d apart have population std dev d/2.
    let cases = [
        (10.0, ConfidenceLevel::Unanimous), // sigma = 5
        (20.0, ConfidenceLevel::Strong),    // sigma = 10
        (30.0, ConfidenceLevel::Moderate),  // sigma = 15
        (31.0, ConfidenceLevel::Split),
    ];
    for (spread, expected) in cases {
        let consensus = aggregate_metric("m", scores(&[50.0, 50.0 + spread]), &config());
        assert_eq!(consensus.confidence, expected, "spread {spread}");
    }
}

// ──────────────────────────────────────────
// Weight redistribution
// ──────────────────────────────────────────

#[test]
fn redistribution_preserves_ratios_and_sums_to_100() {
    let weights = vec![
        ("personal".to_string(), 20),
        ("speech".to_string(), 20),
        ("housing".to_string(), 20),
        ("work".to_string(), 15),
        ("movement".to_string(), 15),
        ("privacy".to_string(), 10),
    ];
    let excluded: HashSet<String> =
        ["housing".to_string(), "movement".to_string()].into_iter().collect();

    let redistributed = redistribute_weights(&weights, &excluded).unwrap();
    let total: u32 = redistributed.iter().map(|(_, w)| w).sum();
    assert_eq!(total, 100);
    // 20/65, 20/65, 15/65, 10/65 scaled: remainder lands on the first entry.
    assert_eq!(redistributed[0], ("personal".to_string(), 31));
    assert_eq!(redistributed[1], ("speech".to_string(), 31));
    assert_eq!(redistributed[2], ("work".to_string(), 23));
    assert_eq!(redistributed[3], ("privacy".to_string(), 15));
}

#[test]
fn weights_not_summing_to_100_rejected() {
    let weights = vec![("a".to_string(), 50), ("b".to_string(), 40)];
    assert!(redistribute_weights(&weights, &HashSet::new()).is_err());
}

#[test]
fn excluding_everything_rejected() {
    let weights = vec![("a".to_string(), 100)];
    let excluded: HashSet<String> = ["a".to_string()].into_iter().collect();
    assert!(redistribute_weights(&weights, &excluded).is_err());
}

// ──────────────────────────────────────────
// City rollup
// ──────────────────────────────────────────

const CATALOG: &str = r#"
version = 1

[[categories]]
id = "speech"
name = "Speech"
default_weight = 50

[[categories]]
id = "privacy"
name = "Privacy"
default_weight = 50

[[metrics]]
id = "press"
name = "Press freedom"
category = "speech"
weight = 1.0
direction = "higher_is_better"
dual_dimension = true

[metrics.criteria]
type = "scale"
min = 0.0
max = 10.0

[[metrics]]
id = "cctv"
name = "Surveillance density"
category = "privacy"
weight = 1.0
direction = "lower_is_better"
dual_dimension = false

[metrics.criteria]
type = "scale"
min = 0.0
max = 10.0
"#;

fn consensus_with_dims(metric_id: &str, law: f64, lived: f64) -> MetricConsensus {
    MetricConsensus {
        metric_id: metric_id.to_string(),
        score: Some((law + lived) / 2.0),
        std_dev: Some(0.0),
        confidence: ConfidenceLevel::Unanimous,
        law_score: Some(law),
        lived_score: Some(lived),
        provider_scores: Vec::new(),
    }
}

fn consensus_flat(metric_id: &str, score: f64) -> MetricConsensus {
    MetricConsensus {
        metric_id: metric_id.to_string(),
        score: Some(score),
        std_dev: Some(0.0),
        confidence: ConfidenceLevel::Unanimous,
        law_score: None,
        lived_score: None,
        provider_scores: Vec::new(),
    }
}

#[test]
fn blend_strategy_weighs_law_against_lived() {
    let catalog = MetricCatalog::from_toml(CATALOG).unwrap();
    let mut prefs = RollupPreferences::defaults(&catalog);
    prefs.dual = DualDimensionStrategy::Blend { law_pct: 60 };

    let metrics = vec![
        consensus_with_dims("press", 90.0, 40.0),
        consensus_flat("cctv", 70.0),
    ];
    let city = rollup_city(CityDescriptor::new("X"), metrics, &catalog, &prefs).unwrap();

    // press: 90*0.6 + 40*0.4 = 70; total = 70*0.5 + 70*0.5 = 70.
    assert!((city.total_score.unwrap() - 70.0).abs() < 1e-9);
}

#[test]
fn worst_case_strategy_takes_the_lower_dimension() {
    let catalog = MetricCatalog::from_toml(CATALOG).unwrap();
    let mut prefs = RollupPreferences::defaults(&catalog);
    prefs.dual = DualDimensionStrategy::WorstCase;

    let metrics = vec![
        consensus_with_dims("press", 90.0, 40.0),
        consensus_flat("cctv", 70.0),
    ];
    let city = rollup_city(CityDescriptor::new("X"), metrics, &catalog, &prefs).unwrap();

    // press collapses to 40; total = 40*0.5 + 70*0.5 = 55.
    assert!((city.total_score.unwrap() - 55.0).abs() < 1e-9);
}

#[test]
fn all_no_data_category_drops_out_of_total() {
    let catalog = MetricCatalog::from_toml(CATALOG).unwrap();
    let prefs = RollupPreferences::defaults(&catalog);

    let metrics = vec![
        consensus_flat("press", 80.0),
        MetricConsensus::no_data("cctv"),
    ];
    let city = rollup_city(CityDescriptor::new("X"), metrics, &catalog, &prefs).unwrap();

    // Privacy has no data: speech takes the full weight, privacy reads zero.
    assert!((city.total_score.unwrap() - 80.0).abs() < 1e-9);
    let privacy = city
        .categories
        .iter()
        .find(|c| c.category_id == "privacy")
        .unwrap();
    assert_eq!(privacy.score, None);
    assert_eq!(privacy.weight, 0);
}

#[test]
fn city_with_no_data_at_all_has_no_total() {
    let catalog = MetricCatalog::from_toml(CATALOG).unwrap();
    let prefs = RollupPreferences::defaults(&catalog);

    let metrics = vec![
        MetricConsensus::no_data("press"),
        MetricConsensus::no_data("cctv"),
    ];
    let city = rollup_city(CityDescriptor::new("X"), metrics, &catalog, &prefs).unwrap();
    assert_eq!(city.total_score, None);
}

// ──────────────────────────────────────────
// Winner determination
// ──────────────────────────────────────────

#[test]
fn winner_is_deterministic_from_totals() {
    let (winner, diff) = determine_winner(Some(71.3), Some(64.9));
    assert_eq!(winner, Winner::City1);
    assert!((diff - 6.4).abs() < 1e-9);
    assert_eq!(determine_winner(Some(50.0), Some(50.0)).0, Winner::Tie);
}

#[test]
fn unscorable_city_ties_rather_than_loses() {
    assert_eq!(determine_winner(None, Some(90.0)).0, Winner::Tie);
    assert_eq!(determine_winner(None, None).0, Winner::Tie);
}

// ──────────────────────────────────────────
// Shipped catalog sanity
// ──────────────────────────────────────────

#[test]
fn shipped_catalog_is_complete() {
    let catalog =
        MetricCatalog::load(std::path::Path::new("config/metrics.toml")).unwrap();
    assert_eq!(catalog.metrics.len(), 100);
    assert_eq!(catalog.categories.len(), 6);
    let weight_sum: u32 = catalog.categories.iter().map(|c| c.default_weight).sum();
    assert_eq!(weight_sum, 100);
}
