//! OpenAI chat completions client (search-preview model family).

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

/// OpenAI pricing per token (gpt-4o family, 2025).
const INPUT_PRICE_PER_MILLION: Decimal = dec!(2.50);
const OUTPUT_PRICE_PER_MILLION: Decimal = dec!(10.00);
const MILLION: Decimal = dec!(1_000_000);

type Limiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: SecretString,
    model: String,
    base_url: String,
    limiter: Arc<Limiter>,
}

impl OpenAiProvider {
    pub fn new(
        config: &ProviderConfig,
        api_key: SecretString,
        call_timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(call_timeout)
            .build()
            .context("Failed to build HTTP client for OpenAI")?;

        let rpm = NonZeroU32::new(config.requests_per_minute)
            .unwrap_or_else(|| NonZeroU32::new(60).expect("nonzero"));
        let burst = NonZeroU32::new(config.burst_size)
            .unwrap_or_else(|| NonZeroU32::new(10).expect("nonzero"));

        Ok(Self {
            client,
            api_key,
            model: config.model.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            limiter: Arc::new(RateLimiter::direct(
                Quota::per_minute(rpm).allow_burst(burst),
            )),
        })
    }
}

#[async_trait]
impl ScoreProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    #[instrument(skip(self, system_prompt, user_prompt))]
    async fn complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<Completion, EvaluationFailure> {
        self.limiter.until_ready().await;

        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system_prompt.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: user_prompt.to_string(),
                },
            ],
            web_search_options: Some(WebSearchOptions {}),
        };

        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .json(&request)
            .send()
            .await
            .map_err(|e| EvaluationFailure::from_reqwest(self.name(), e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EvaluationFailure::from_status(self.name(), status, body));
        }

        let api_response: ChatResponse = response
            .json()
            .await
            .map_err(|e| EvaluationFailure::from_reqwest(self.name(), e))?;

        let text = api_response
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .unwrap_or_default();

        let input_tokens = api_response.usage.prompt_tokens;
        let output_tokens = api_response.usage.completion_tokens;
        let cost = calculate_cost(input_tokens, output_tokens);

        info!(
            input_tokens,
            output_tokens,
            cost = %cost,
            model = %self.model,
            "OpenAI call completed"
        );

        Ok(Completion {
            text,
            input_tokens,
            output_tokens,
            cost,
        })
    }
}

pub fn calculate_cost(input_tokens: i64, output_tokens: i64) -> Decimal {
    let input_cost = Decimal::from(input_tokens) * INPUT_PRICE_PER_MILLION / MILLION;
    let output_cost = Decimal::from(output_tokens) * OUTPUT_PRICE_PER_MILLION / MILLION;
    input_cost + output_cost
}

// --- Request/Response Types ---

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    web_search_options: Option<WebSearchOptions>,
}

#[derive(Debug, Serialize)]
struct WebSearchOptions {}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    usage: ChatUsage,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    prompt_tokens: i64,
    completion_tokens: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cost_calculation() {
        // input: 2000 * 2.50 / 1M = 0.005; output: 400 * 10.00 / 1M = 0.004
        assert_eq!(calculate_cost(2000, 400), dec!(0.009));
    }

    #[test]
    fn test_response_shape_parses() {
        let body = r#"{
            "choices": [{"message": {"role": "assistant", "content": "{\"value\": true}"}}],
            "usage": {"prompt_tokens": 900, "completion_tokens": 40, "total_tokens": 940}
        }"#;
        let response: ChatResponse = serde_json::from_str(body).unwrap();
        assert_eq!(response.choices[0].message.content, "{\"value\": true}");
        assert_eq!(response.usage.completion_tokens, 40);
    }
}
