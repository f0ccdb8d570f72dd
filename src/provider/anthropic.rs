//! Anthropic messages API client with web search enabled.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::config::ProviderConfig;
use crate::provider::{Completion, EvaluationFailure, ScoreProvider};

/// Anthropic pricing per token (claude-sonnet-4 family, 2025).
const INPUT_PRICE_PER_MILLION: Decimal = dec!(3.00);
const OUTPUT_PRICE_PER_MILLION: Decimal = dec!(15.00);
const MILLION: Decimal = dec!(1_000_000);

type Limiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: SecretString,
    model: String,
    base_url: String,
    limiter: Arc<Limiter>,
}

impl AnthropicProvider {
    pub fn new(
        config: &ProviderConfig,
        api_key: SecretString,
        call_timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(call_timeout)
            .build()
            .context("Failed to build HTTP client for Anthropic")?;

        Ok(Self {
            client,
            api_key,
            model: config.model.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            limiter: create_rate_limiter(config),
        })
    }
}

#[async_trait]
impl ScoreProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    #[instrument(skip(self, system_prompt, user_prompt))]
    async fn complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<Completion, EvaluationFailure> {
        self.limiter.until_ready().await;

        let request = MessagesRequest {
            model: self.model.clone(),
            max_tokens: 1024,
            system: Some(system_prompt.to_string()),
            messages: vec![Message {
                role: "user".to_string(),
                content: user_prompt.to_string(),
            }],
            tools: vec![WebSearchTool::default()],
        };

        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", self.api_key.expose_secret())
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| EvaluationFailure::from_reqwest(self.name(), e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EvaluationFailure::from_status(self.name(), status, body));
        }

        let api_response: MessagesResponse = response
            .json()
            .await
            .map_err(|e| EvaluationFailure::from_reqwest(self.name(), e))?;

        let text = api_response
            .content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<&str>>()
            .join("");

        let input_tokens = api_response.usage.input_tokens;
        let output_tokens = api_response.usage.output_tokens;
        let cost = calculate_cost(input_tokens, output_tokens);

        info!(
            input_tokens,
            output_tokens,
            cost = %cost,
            model = %self.model,
            "Anthropic call completed"
        );

        Ok(Completion {
            text,
            input_tokens,
            output_tokens,
            cost,
        })
    }
}

fn create_rate_limiter(config: &ProviderConfig) -> Arc<Limiter> {
    let rpm = NonZeroU32::new(config.requests_per_minute)
        .unwrap_or_else(|| NonZeroU32::new(60).expect("nonzero"));
    let burst = NonZeroU32::new(config.burst_size)
        .unwrap_or_else(|| NonZeroU32::new(10).expect("nonzero"));
    Arc::new(RateLimiter::direct(Quota::per_minute(rpm).allow_burst(burst)))
}

/// Calculate the dollar cost of an Anthropic API call.
pub fn calculate_cost(input_tokens: i64, output_tokens: i64) -> Decimal {
    let input_cost = Decimal::from(input_tokens) * INPUT_PRICE_PER_MILLION / MILLION;
    let output_cost = Decimal::from(output_tokens) * OUTPUT_PRICE_PER_MILLION / MILLION;
    input_cost + output_cost
}

// --- Request/Response Types ---

#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<Message>,
    tools: Vec<WebSearchTool>,
}

#[derive(Debug, Serialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct WebSearchTool {
    #[serde(rename = "type")]
    tool_type: String,
    name: String,
    max_uses: u32,
}

impl Default for WebSearchTool {
    fn default() -> Self {
        Self {
            tool_type: "web_search_20250305".to_string(),
            name: "web_search".to_string(),
            max_uses: 3,
        }
    }
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    usage: Usage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct Usage {
    input_tokens: i64,
    output_tokens: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cost_calculation() {
        // input: 1000 * 3.00 / 1_000_000 = 0.003
        // output: 500 * 15.00 / 1_000_000 = 0.0075
        assert_eq!(calculate_cost(1000, 500), dec!(0.0105));
    }

    #[test]
    fn test_cost_calculation_zero_tokens() {
        assert_eq!(calculate_cost(0, 0), Decimal::ZERO);
    }

    #[test]
    fn test_response_parses_mixed_content_blocks() {
        let body = r#"{
            "content": [
                {"type": "server_tool_use", "id": "t1", "name": "web_search", "input": {}},
                {"type": "text", "text": "{\"value\": 7}"}
            ],
            "usage": {"input_tokens": 1200, "output_tokens": 80}
        }"#;
        let response: MessagesResponse = serde_json::from_str(body).unwrap();
        let text: String = response
            .content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(text, "{\"value\": 7}");
        assert_eq!(response.usage.input_tokens, 1200);
    }
}
