//! Category and total rollup.
//!
//! Combines metric consensus into category scores and one 0-100 city total
//! under a caller-supplied weighting scheme. Configuration errors (weights
//! not summing to 100, everything excluded) are rejected here before any
//! aggregation proceeds. Weight redistribution is exact: active weights
//! always sum to precisely 100, with the rounding remainder settled on the
//! earliest active categories that can absorb it.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::catalog::MetricCatalog;
use crate::consensus::models::{CategoryConsensus, CityConsensusScore, CityDescriptor, MetricConsensus};

#[derive(Debug, Error)]
pub enum RollupError {
    #[error("category weights must sum to 100, got {0}")]
    WeightSum(u32),
    #[error("unknown category '{0}' in weighting configuration")]
    UnknownCategory(String),
    #[error("category '{0}' is missing from the weighting configuration")]
    MissingCategory(String),
    #[error("every category is excluded; nothing left to score")]
    AllCategoriesExcluded,
    #[error("law/lived blend share must be 0-100, got {0}")]
    InvalidBlendShare(u8),
}

/// How dual-dimension metrics (separate written-law and lived-experience
/// scores) resolve to one effective score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DualDimensionStrategy {
    /// Weighted blend: law_pct% written law, the rest lived experience.
    Blend { law_pct: u8 },
    /// Worst-case mode: whichever dimension is lower wins.
    WorstCase,
}

impl DualDimensionStrategy {
    pub fn validate(&self) -> Result<(), RollupError> {
        match self {
            Self::Blend { law_pct } if *law_pct > 100 => {
                Err(RollupError::InvalidBlendShare(*law_pct))
            }
            _ => Ok(()),
        }
    }

    /// Effective score for one metric consensus. Falls back to the headline
    /// consensus when either dimension is missing.
    pub fn resolve(&self, consensus: &MetricConsensus) -> Option<f64> {
        match (consensus.law_score, consensus.lived_score) {
            (Some(law), Some(lived)) => Some(match self {
                Self::Blend { law_pct } => {
                    let law_share = f64::from(*law_pct) / 100.0;
                    law * law_share + lived * (1.0 - law_share)
                }
                Self::WorstCase => law.min(lived),
            }),
            _ => consensus.score,
        }
    }
}

/// User-supplied weighting scheme for one rollup.
#[derive(Debug, Clone)]
pub struct RollupPreferences {
    /// Full category → weight map (0-100 each, summing to 100), in the
    /// order redistribution remainders should be assigned.
    pub weights: Vec<(String, u32)>,
    /// Categories forced to zero weight.
    pub excluded: HashSet<String>,
    pub dual: DualDimensionStrategy,
}

impl RollupPreferences {
    /// Catalog defaults: declared weights, nothing excluded, 50/50 blend.
    pub fn defaults(catalog: &MetricCatalog) -> Self {
        Self {
            weights: catalog.default_weights(),
            excluded: HashSet::new(),
            dual: DualDimensionStrategy::Blend { law_pct: 50 },
        }
    }

    /// Every check `rollup_city` performs, runnable up front so a bad
    /// weighting scheme is rejected before any evaluation is paid for.
    pub fn validate(&self, catalog: &MetricCatalog) -> Result<(), RollupError> {
        self.dual.validate()?;
        validate_weight_coverage(&self.weights, catalog)?;
        for excluded in &self.excluded {
            if catalog.category(excluded).is_none() {
                return Err(RollupError::UnknownCategory(excluded.clone()));
            }
        }
        redistribute_weights(&self.weights, &self.excluded).map(|_| ())
    }
}

/// Rescale the non-excluded categories' weights so they sum to exactly 100,
/// preserving their relative ratios. The rounding remainder is settled on
/// the earliest active categories that can absorb it, so the total never
/// drifts.
pub fn redistribute_weights(
    weights: &[(String, u32)],
    excluded: &HashSet<String>,
) -> Result<Vec<(String, u32)>, RollupError> {
    let total: u32 = weights.iter().map(|(_, w)| w).sum();
    if total != 100 {
        return Err(RollupError::WeightSum(total));
    }

    let active: Vec<&(String, u32)> = weights
        .iter()
        .filter(|(id, _)| !excluded.contains(id))
        .collect();
    if active.is_empty() {
        return Err(RollupError::AllCategoriesExcluded);
    }

    let active_sum: u32 = active.iter().map(|(_, w)| w).sum();
    if active_sum == 0 {
        // All remaining weight sat on excluded categories; split evenly.
        let n = active.len() as u32;
        let share = 100 / n;
        let mut out: Vec<(String, u32)> = active
            .iter()
            .map(|(id, _)| (id.clone(), share))
            .collect();
        out[0].1 += 100 - share * n;
        return Ok(out);
    }

    // Round-half-up scaling, then settle the rounding remainder on the
    // earliest active categories that can absorb it. A zero-weight survivor
    // stays at zero; it never goes negative to pay for someone's rounding.
    let mut out: Vec<(String, u32)> = active
        .iter()
        .map(|(id, w)| (id.clone(), (w * 100 + active_sum / 2) / active_sum))
        .collect();
    let scaled_sum: u32 = out.iter().map(|(_, w)| w).sum();
    if scaled_sum > 100 {
        let mut excess = scaled_sum - 100;
        for (_, weight) in out.iter_mut() {
            let take = excess.min(*weight);
            *weight -= take;
            excess -= take;
            if excess == 0 {
                break;
            }
        }
    } else {
        out[0].1 += 100 - scaled_sum;
    }
    Ok(out)
}

/// Weighted mean of a category's scored metrics. Metrics with `no_data`
/// consensus are excluded, not counted as zero.
fn category_score(
    metrics: &[MetricConsensus],
    catalog: &MetricCatalog,
    dual: &DualDimensionStrategy,
) -> Option<f64> {
    let mut weighted_sum = 0.0;
    let mut weight_total = 0.0;
    for consensus in metrics {
        let Some(score) = dual.resolve(consensus) else {
            continue;
        };
        let weight = catalog
            .metric(&consensus.metric_id)
            .map(|m| m.weight)
            .unwrap_or(1.0);
        weighted_sum += score * weight;
        weight_total += weight;
    }
    if weight_total == 0.0 {
        None
    } else {
        Some(weighted_sum / weight_total)
    }
}

/// Roll all of one city's metric consensus up to a CityConsensusScore.
///
/// `metrics` holds every evaluated metric for the city; they are grouped by
/// category through the catalog. Categories excluded by the preferences are
/// omitted from the output entirely.
pub fn rollup_city(
    city: CityDescriptor,
    metrics: Vec<MetricConsensus>,
    catalog: &MetricCatalog,
    prefs: &RollupPreferences,
) -> Result<CityConsensusScore, RollupError> {
    prefs.validate(catalog)?;

    let active_weights = redistribute_weights(&prefs.weights, &prefs.excluded)?;

    let mut by_category: HashMap<&str, Vec<MetricConsensus>> = HashMap::new();
    for consensus in metrics {
        let Some(metric) = catalog.metric(&consensus.metric_id) else {
            warn!(metric_id = %consensus.metric_id, "Dropping consensus for unknown metric");
            continue;
        };
        by_category
            .entry(metric.category.as_str())
            .or_default()
            .push(consensus);
    }

    let mut categories: Vec<CategoryConsensus> = active_weights
        .iter()
        .map(|(category_id, weight)| {
            let metrics = by_category.remove(category_id.as_str()).unwrap_or_default();
            let score = category_score(&metrics, catalog, &prefs.dual);
            CategoryConsensus {
                category_id: category_id.clone(),
                score,
                weight: *weight,
                metrics,
            }
        })
        .collect();

    // Categories where every metric came back no_data drop out of the total;
    // their weight is redistributed over the scored ones, same exact-100 rule.
    let unscored: HashSet<String> = categories
        .iter()
        .filter(|c| c.score.is_none())
        .map(|c| c.category_id.clone())
        .collect();

    let total_score = if unscored.len() == categories.len() {
        None
    } else {
        let effective = if unscored.is_empty() {
            active_weights
        } else {
            redistribute_weights(
                &categories
                    .iter()
                    .map(|c| (c.category_id.clone(), c.weight))
                    .collect::<Vec<_>>(),
                &unscored,
            )?
        };
        let effective_map: HashMap<&str, u32> = effective
            .iter()
            .map(|(id, w)| (id.as_str(), *w))
            .collect();

        let mut total = 0.0;
        for category in &mut categories {
            match category.score {
                Some(score) => {
                    let weight = effective_map
                        .get(category.category_id.as_str())
                        .copied()
                        .unwrap_or(0);
                    category.weight = weight;
                    total += score * f64::from(weight) / 100.0;
                }
                None => category.weight = 0,
            }
        }
        Some(total)
    };

    Ok(CityConsensusScore {
        city,
        total_score,
        categories,
    })
}

fn validate_weight_coverage(
    weights: &[(String, u32)],
    catalog: &MetricCatalog,
) -> Result<(), RollupError> {
    let provided: HashSet<&str> = weights.iter().map(|(id, _)| id.as_str()).collect();
    for (id, _) in weights {
        if catalog.category(id).is_none() {
            return Err(RollupError::UnknownCategory(id.clone()));
        }
    }
    for category in &catalog.categories {
        if !provided.contains(category.id.as_str()) {
            return Err(RollupError::MissingCategory(category.id.clone()));
        }
    }
    Ok(())
}
