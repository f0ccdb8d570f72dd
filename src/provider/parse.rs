//! Parsing of LLM evaluation responses.
//!
//! Providers are asked for strict JSON but routinely wrap it in markdown or
//! prose. Extraction uses proper brace-depth tracking that respects string
//! escaping, then validates with serde_json before returning.

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::provider::Citation;

/// Raw JSON form of an evaluation, before normalization against the
/// metric's scoring criteria. Values stay as `serde_json::Value` because the
/// expected shape (number / bool / label) depends on the metric.
#[derive(Debug, Deserialize)]
pub struct RawEvaluation {
    #[serde(default)]
    pub value: Option<serde_json::Value>,
    #[serde(default)]
    pub law_value: Option<serde_json::Value>,
    #[serde(default)]
    pub lived_value: Option<serde_json::Value>,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub citations: Vec<Citation>,
}

/// Parse a provider's response text into a RawEvaluation.
pub fn parse_evaluation(text: &str) -> Result<RawEvaluation> {
    let json_str = extract_json(text).context("No valid JSON found in provider response")?;
    serde_json::from_str(&json_str)
        .with_context(|| format!("Failed to parse evaluation JSON: {json_str}"))
}

/// Sanitize a city name before it is interpolated into a prompt.
///
/// City names are untrusted user input. Strips control characters, limits
/// length, and removes common injection patterns.
pub fn sanitize_city_name(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .filter(|c| !c.is_control())
        .take(120)
        .collect();

    sanitized
        .replace("```", "")
        .replace("</CITY", "")
        .replace("<CITY", "")
        .replace("<SYSTEM", "")
        .replace("</SYSTEM", "")
}

/// Extract and validate JSON from text that might contain markdown code blocks.
pub fn extract_json(text: &str) -> Option<String> {
    if let Some(json) = try_markdown_block(text, "```json") {
        return Some(json);
    }
    if let Some(json) = try_markdown_block(text, "```") {
        return Some(json);
    }
    try_raw_json_object(text)
}

fn try_markdown_block(text: &str, marker: &str) -> Option<String> {
    let start = text.find(marker)?;
    let json_start = start + marker.len();
    // Skip to next line past the language tag.
    let json_start = text[json_start..]
        .find('\n')
        .map(|n| json_start + n + 1)
        .unwrap_or(json_start);
    let end = text[json_start..].find("```")?;
    let candidate = text[json_start..json_start + end].trim();

    serde_json::from_str::<serde_json::Value>(candidate).ok()?;
    Some(candidate.to_string())
}

/// Extract a JSON object from raw text using brace-depth tracking that
/// respects string escaping, so braces inside strings don't confuse it.
fn try_raw_json_object(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let mut depth: i32 = 0;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, ch) in text[start..].char_indices() {
        if escape_next {
            escape_next = false;
            continue;
        }
        if ch == '\\' && in_string {
            escape_next = true;
            continue;
        }
        if ch == '"' {
            in_string = !in_string;
            continue;
        }
        if !in_string {
            if ch == '{' {
                depth += 1;
            } else if ch == '}' {
                depth -= 1;
                if depth == 0 {
                    let candidate = &text[start..start + i + 1];
                    if serde_json::from_str::<serde_json::Value>(candidate).is_ok() {
                        return Some(candidate.to_string());
                    }
                    break;
                }
            }
        }
    }
    None
}
