//! Judge synthesis.
//!
//! One final LLM call turns the already-aggregated numbers into a narrative
//! verdict. The judge only ever sees consensus data, never raw provider
//! output, and it holds no authority over the result: the numeric winner is
//! computed deterministically from the two totals, and if the narrative
//! disagrees it is corrected in code. A failed judge call degrades to a
//! numeric-only result.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};

use crate::config::RetryConfig;
use crate::consensus::models::{CityConsensusScore, Winner};
use crate::provider::parse::extract_json;
use crate::provider::retry::with_retry;
use crate::provider::ScoreProvider;

/// Narrative verdict for one comparison. An enhancement over the numeric
/// result, never a requirement for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeVerdict {
    pub winner: Winner,
    pub summary: String,
    pub category_notes: Vec<CategoryNote>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryNote {
    pub category_id: String,
    pub note: String,
}

#[derive(Debug, Deserialize)]
struct RawVerdict {
    winner: String,
    summary: String,
    #[serde(default)]
    category_notes: Vec<CategoryNote>,
}

pub struct JudgeSynthesizer<'a> {
    provider: &'a dyn ScoreProvider,
    retry: RetryConfig,
}

/// What a judge call produced, with its cost for the ledger.
pub struct Synthesis {
    pub verdict: Option<JudgeVerdict>,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cost: Decimal,
}

impl<'a> JudgeSynthesizer<'a> {
    pub fn new(provider: &'a dyn ScoreProvider, retry: RetryConfig) -> Self {
        Self { provider, retry }
    }

    /// Produce the narrative verdict. Never fails: any provider-side problem
    /// is logged and degrades to `verdict: None`.
    #[instrument(skip_all, fields(judge = self.provider.name()))]
    pub async fn synthesize(
        &self,
        city1: &CityConsensusScore,
        city2: &CityConsensusScore,
        numeric_winner: Winner,
        score_difference: f64,
    ) -> Synthesis {
        let system_prompt = build_system_prompt();
        let user_prompt = build_user_prompt(city1, city2, numeric_winner, score_difference);

        let completion = match with_retry(&self.retry, self.provider.name(), || {
            self.provider.complete(&system_prompt, &user_prompt)
        })
        .await
        {
            Ok(completion) => completion,
            Err(failure) => {
                warn!(reason = %failure.reason, detail = %failure.detail,
                      "Judge synthesis failed; returning numeric-only result");
                return Synthesis {
                    verdict: None,
                    input_tokens: 0,
                    output_tokens: 0,
                    cost: Decimal::ZERO,
                };
            }
        };

        let verdict = parse_verdict(&completion.text, numeric_winner);
        if verdict.is_none() {
            warn!("Judge returned unparseable verdict; returning numeric-only result");
        }

        Synthesis {
            verdict,
            input_tokens: completion.input_tokens,
            output_tokens: completion.output_tokens,
            cost: completion.cost,
        }
    }
}

/// Parse the judge's JSON and enforce the deterministic winner. If the prose
/// disagrees with the numbers, the numbers win.
fn parse_verdict(text: &str, numeric_winner: Winner) -> Option<JudgeVerdict> {
    let json_str = extract_json(text)?;
    let raw: RawVerdict = serde_json::from_str(&json_str).ok()?;

    let claimed = match raw.winner.as_str() {
        "city1" => Winner::City1,
        "city2" => Winner::City2,
        "tie" => Winner::Tie,
        other => {
            warn!(claimed = other, "Judge named an unknown winner label");
            numeric_winner
        }
    };

    if claimed != numeric_winner {
        warn!(
            claimed = %claimed,
            numeric = %numeric_winner,
            "Judge narrative contradicts the deterministic winner; overriding"
        );
    }

    Some(JudgeVerdict {
        winner: numeric_winner,
        summary: raw.summary,
        category_notes: raw.category_notes,
    })
}

fn build_system_prompt() -> String {
    r#"You are the final judge in a two-city freedom comparison. You receive
already-aggregated consensus scores (0-100, higher is freer) with
confidence labels; you never see raw source material. The numeric winner
has already been decided and is stated in the input; your job is to
explain it, not to re-litigate it. Respond with ONLY valid JSON:
{
  "winner": "<city1|city2|tie>",
  "summary": "<3-5 sentence verdict>",
  "category_notes": [{"category_id": "<id>", "note": "<1-2 sentences>"}]
}"#
    .to_string()
}

fn build_user_prompt(
    city1: &CityConsensusScore,
    city2: &CityConsensusScore,
    numeric_winner: Winner,
    score_difference: f64,
) -> String {
    format!(
        "City 1: {}\nCity 2: {}\nNumeric winner: {} (difference {:.1} points)\n\n\
         City 1 breakdown:\n{}\nCity 2 breakdown:\n{}",
        summary_line(city1),
        summary_line(city2),
        numeric_winner,
        score_difference,
        category_table(city1),
        category_table(city2),
    )
}

fn summary_line(city: &CityConsensusScore) -> String {
    match city.total_score {
        Some(total) => format!("{} - total {:.1}/100", city.city, total),
        None => format!("{} - no scorable data", city.city),
    }
}

fn category_table(city: &CityConsensusScore) -> String {
    city.categories
        .iter()
        .map(|c| {
            let score = c
                .score
                .map(|s| format!("{s:.1}"))
                .unwrap_or_else(|| "no data".to_string());
            let low_confidence = c
                .metrics
                .iter()
                .filter(|m| {
                    matches!(
                        m.confidence,
                        crate::consensus::models::ConfidenceLevel::Split
                            | crate::consensus::models::ConfidenceLevel::NoData
                    )
                })
                .count();
            format!(
                "- {} (weight {}): {score}, {} metrics, {low_confidence} low-confidence",
                c.category_id,
                c.weight,
                c.metrics.len(),
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}
