//! Static metric catalog.
//!
//! The 100 freedom metrics are pure data, loaded once at process start from
//! a versioned TOML file and validated before any evaluation runs. A metric's
//! scoring criteria describe how a provider's raw answer (scale level,
//! boolean, categorical label, or raw number) maps onto the 0-100 scale.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricCatalog {
    pub version: u32,
    pub categories: Vec<Category>,
    pub metrics: Vec<MetricDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Category {
    pub id: String,
    pub name: String,
    /// Default share (0-100) of the city total carried by this category.
    pub default_weight: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricDefinition {
    pub id: String,
    pub name: String,
    pub category: String,
    /// Relative weight within its category. Positive.
    pub weight: f64,
    pub direction: ScoringDirection,
    /// Whether this metric carries separate written-law and lived-experience
    /// dimensions that the rollup blends (or takes the worst of).
    pub dual_dimension: bool,
    pub criteria: ScoringCriteria,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoringDirection {
    HigherIsBetter,
    LowerIsBetter,
}

/// Schema used to normalize a provider's raw answer to 0-100.
///
/// Boolean and categorical mappings already encode direction in their level
/// scores; the direction flag inverts only scale and range values.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScoringCriteria {
    /// A bounded ordinal scale, e.g. 0-10.
    Scale { min: f64, max: f64 },
    /// A yes/no question with explicit scores for each answer.
    Boolean { true_score: f64, false_score: f64 },
    /// Named levels with explicit scores, matched case-insensitively.
    Categorical { levels: HashMap<String, f64> },
    /// A raw measurable quantity clamped into [min, max].
    Range { min: f64, max: f64 },
}

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("expected a number, got {0}")]
    NotANumber(String),
    #[error("expected a boolean, got {0}")]
    NotABoolean(String),
    #[error("unknown categorical level '{0}'")]
    UnknownLevel(String),
    #[error("value {0} is not finite")]
    NonFinite(f64),
}

impl MetricDefinition {
    /// Map a provider's raw answer into a 0-100 score per this metric's
    /// criteria. Unmappable values are errors, never default scores.
    pub fn normalize(&self, raw: &serde_json::Value) -> Result<f64, NormalizeError> {
        let score = match &self.criteria {
            ScoringCriteria::Scale { min, max } | ScoringCriteria::Range { min, max } => {
                let v = as_number(raw)?;
                let clamped = v.clamp(*min, *max);
                if (max - min).abs() < f64::EPSILON {
                    0.0
                } else {
                    (clamped - min) / (max - min) * 100.0
                }
            }
            ScoringCriteria::Boolean {
                true_score,
                false_score,
            } => {
                if as_boolean(raw)? {
                    *true_score
                } else {
                    *false_score
                }
            }
            ScoringCriteria::Categorical { levels } => {
                let label = raw
                    .as_str()
                    .ok_or_else(|| NormalizeError::UnknownLevel(raw.to_string()))?;
                let wanted = label.trim().to_ascii_lowercase().replace([' ', '-'], "_");
                levels
                    .iter()
                    .find(|(k, _)| k.to_ascii_lowercase() == wanted)
                    .map(|(_, v)| *v)
                    .ok_or_else(|| NormalizeError::UnknownLevel(label.to_string()))?
            }
        };

        let directed = match (&self.criteria, self.direction) {
            (
                ScoringCriteria::Scale { .. } | ScoringCriteria::Range { .. },
                ScoringDirection::LowerIsBetter,
            ) => 100.0 - score,
            _ => score,
        };
        Ok(directed.clamp(0.0, 100.0))
    }
}

fn as_number(raw: &serde_json::Value) -> Result<f64, NormalizeError> {
    let v = match raw {
        serde_json::Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| NormalizeError::NotANumber(raw.to_string()))?,
        // Providers sometimes quote numbers despite the schema.
        serde_json::Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| NormalizeError::NotANumber(raw.to_string()))?,
        _ => return Err(NormalizeError::NotANumber(raw.to_string())),
    };
    if !v.is_finite() {
        return Err(NormalizeError::NonFinite(v));
    }
    Ok(v)
}

fn as_boolean(raw: &serde_json::Value) -> Result<bool, NormalizeError> {
    match raw {
        serde_json::Value::Bool(b) => Ok(*b),
        serde_json::Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" => Ok(true),
            "false" | "no" => Ok(false),
            _ => Err(NormalizeError::NotABoolean(raw.to_string())),
        },
        _ => Err(NormalizeError::NotABoolean(raw.to_string())),
    }
}

impl MetricCatalog {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read metric catalog: {}", path.display()))?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let catalog: MetricCatalog =
            toml::from_str(contents).context("Failed to parse metric catalog")?;
        catalog.validate()?;
        Ok(catalog)
    }

    /// Reject malformed catalogs before any provider call is made.
    fn validate(&self) -> Result<()> {
        use anyhow::bail;

        let mut seen = std::collections::HashSet::new();
        for category in &self.categories {
            if !seen.insert(category.id.as_str()) {
                bail!("Duplicate category id '{}'", category.id);
            }
        }

        let mut metric_ids = std::collections::HashSet::new();
        for metric in &self.metrics {
            if !metric_ids.insert(metric.id.as_str()) {
                bail!("Duplicate metric id '{}'", metric.id);
            }
            if !seen.contains(metric.category.as_str()) {
                bail!(
                    "Metric '{}' references unknown category '{}'",
                    metric.id,
                    metric.category
                );
            }
            if metric.weight <= 0.0 || !metric.weight.is_finite() {
                bail!("Metric '{}' has non-positive weight", metric.id);
            }
            match &metric.criteria {
                ScoringCriteria::Scale { min, max } | ScoringCriteria::Range { min, max } => {
                    if min >= max {
                        bail!("Metric '{}' has inverted bounds ({} >= {})", metric.id, min, max);
                    }
                }
                ScoringCriteria::Categorical { levels } => {
                    if levels.is_empty() {
                        bail!("Metric '{}' has an empty categorical level map", metric.id);
                    }
                }
                ScoringCriteria::Boolean { .. } => {}
            }
        }
        Ok(())
    }

    pub fn metric(&self, id: &str) -> Option<&MetricDefinition> {
        self.metrics.iter().find(|m| m.id == id)
    }

    pub fn category(&self, id: &str) -> Option<&Category> {
        self.categories.iter().find(|c| c.id == id)
    }

    pub fn metrics_in_category<'a>(
        &'a self,
        category_id: &'a str,
    ) -> impl Iterator<Item = &'a MetricDefinition> {
        self.metrics.iter().filter(move |m| m.category == category_id)
    }

    /// Category weights as declared in the catalog, in declaration order.
    pub fn default_weights(&self) -> Vec<(String, u32)> {
        self.categories
            .iter()
            .map(|c| (c.id.clone(), c.default_weight))
            .collect()
    }
}
