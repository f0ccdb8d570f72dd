//! Comparison export: per-metric CSV and full JSON.
//!
//! The CSV is the flat analyst view, one row per metric with both cities side
//! by side. The JSON is the complete `ComparisonResult` including provider
//! audit trails and the verdict.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};

use crate::catalog::MetricCatalog;
use crate::consensus::models::{ComparisonResult, MetricConsensus};

const CSV_HEADER: &str = "metric,category,\
city1_score,city1_std_dev,city1_confidence,city1_providers,\
city2_score,city2_std_dev,city2_confidence,city2_providers";

pub fn write_csv(result: &ComparisonResult, catalog: &MetricCatalog, path: &Path) -> Result<()> {
    let csv = to_csv(result, catalog);
    std::fs::write(path, csv)
        .with_context(|| format!("Failed to write CSV export: {}", path.display()))
}

pub fn write_json(result: &ComparisonResult, path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(result).context("Failed to serialize comparison")?;
    std::fs::write(path, json)
        .with_context(|| format!("Failed to write JSON export: {}", path.display()))
}

/// Render one row per catalog metric, in catalog order. Metrics missing from
/// a city's results (excluded or never evaluated) render as empty cells.
pub fn to_csv(result: &ComparisonResult, catalog: &MetricCatalog) -> String {
    let city1: HashMap<&str, &MetricConsensus> = index_metrics(&result.city1.categories);
    let city2: HashMap<&str, &MetricConsensus> = index_metrics(&result.city2.categories);

    let mut out = String::from(CSV_HEADER);
    out.push('\n');
    for metric in &catalog.metrics {
        let m1 = city1.get(metric.id.as_str()).copied();
        let m2 = city2.get(metric.id.as_str()).copied();
        if m1.is_none() && m2.is_none() {
            continue;
        }
        out.push_str(&csv_field(&metric.name));
        out.push(',');
        out.push_str(&csv_field(&metric.category));
        out.push(',');
        out.push_str(&metric_cells(m1));
        out.push(',');
        out.push_str(&metric_cells(m2));
        out.push('\n');
    }
    out
}

fn index_metrics(
    categories: &[crate::consensus::models::CategoryConsensus],
) -> HashMap<&str, &MetricConsensus> {
    categories
        .iter()
        .flat_map(|c| c.metrics.iter())
        .map(|m| (m.metric_id.as_str(), m))
        .collect()
}

fn metric_cells(consensus: Option<&MetricConsensus>) -> String {
    match consensus {
        Some(c) => format!(
            "{},{},{},{}",
            c.score.map(|s| format!("{s:.1}")).unwrap_or_default(),
            c.std_dev.map(|s| format!("{s:.2}")).unwrap_or_default(),
            c.confidence,
            c.provider_count(),
        ),
        None => ",,,".to_string(),
    }
}

/// RFC 4180 quoting: fields containing commas, quotes, or newlines get
/// wrapped, with embedded quotes doubled.
fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}
