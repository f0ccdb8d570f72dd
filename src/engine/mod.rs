//! Comparison orchestration.
//!
//! One `compare` call fans each city's active metrics out across every
//! configured provider under a shared wall-clock budget, aggregates the
//! per-metric consensus, rolls both cities up, picks the deterministic
//! winner, and asks the judge for a narrative. Provider failures and a
//! failed judge call degrade the result; they never abort it. Only
//! preference validation errors and persistence failures are fatal.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use rust_decimal::Decimal;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::cache::{cache_key, ConsensusCache};
use crate::catalog::{MetricCatalog, MetricDefinition};
use crate::config::{AppConfig, ConsensusConfig, EngineConfig, RetryConfig, Secrets};
use crate::consensus::aggregator::aggregate_metric;
use crate::consensus::models::{
    CityDescriptor, ComparisonMetadata, ComparisonResult, RunStats,
};
use crate::consensus::rollup::{rollup_city, RollupPreferences};
use crate::db::{ApiCostRecord, Store};
use crate::judge::JudgeSynthesizer;
use crate::provider::anthropic::AnthropicProvider;
use crate::provider::openai::OpenAiProvider;
use crate::provider::perplexity::PerplexityProvider;
use crate::provider::{evaluate_metric, FailureReason, ScoreProvider};

pub struct ComparisonEngine {
    catalog: Arc<MetricCatalog>,
    providers: Vec<Arc<dyn ScoreProvider>>,
    judge: Arc<dyn ScoreProvider>,
    cache: Arc<dyn ConsensusCache>,
    store: Option<Store>,
    consensus: ConsensusConfig,
    retry: RetryConfig,
    engine: EngineConfig,
}

/// Everything one metric evaluation produced, scores and bookkeeping alike.
struct MetricOutcome {
    consensus: crate::consensus::models::MetricConsensus,
    cache_hit: bool,
    attempted: u64,
    succeeded: u64,
    failures: Vec<FailureReason>,
    costs: Vec<CostEntry>,
}

struct CostEntry {
    provider: String,
    input_tokens: i64,
    output_tokens: i64,
    cost: Decimal,
}

/// Instantiate clients for every configured provider whose API key is
/// present. Providers without a key are skipped with a warning; a panel of
/// zero providers is an error.
pub fn build_providers(
    config: &AppConfig,
    secrets: &Secrets,
) -> Result<Vec<Arc<dyn ScoreProvider>>> {
    let call_timeout = Duration::from_secs(config.engine.provider_call_timeout_seconds);
    let mut providers: Vec<Arc<dyn ScoreProvider>> = Vec::new();

    for provider_config in &config.providers {
        let Some(api_key) = secrets.for_provider(&provider_config.name) else {
            warn!(
                provider = %provider_config.name,
                "No API key in environment; provider skipped"
            );
            continue;
        };

        let provider: Arc<dyn ScoreProvider> = match provider_config.name.as_str() {
            "anthropic" => Arc::new(AnthropicProvider::new(
                provider_config,
                api_key.clone(),
                call_timeout,
            )?),
            "openai" => Arc::new(OpenAiProvider::new(
                provider_config,
                api_key.clone(),
                call_timeout,
            )?),
            "perplexity" => Arc::new(PerplexityProvider::new(
                provider_config,
                api_key.clone(),
                call_timeout,
            )?),
            other => {
                warn!(provider = other, "Unknown provider name in config; skipped");
                continue;
            }
        };
        providers.push(provider);
    }

    if providers.is_empty() {
        bail!("No usable providers: check configured names and API key environment variables");
    }
    Ok(providers)
}

impl ComparisonEngine {
    pub fn new(
        config: &AppConfig,
        catalog: Arc<MetricCatalog>,
        providers: Vec<Arc<dyn ScoreProvider>>,
        judge: Arc<dyn ScoreProvider>,
        cache: Arc<dyn ConsensusCache>,
        store: Option<Store>,
    ) -> Result<Self> {
        if providers.is_empty() {
            bail!("Comparison engine needs at least one provider");
        }
        Ok(Self {
            catalog,
            providers,
            judge,
            cache,
            store,
            consensus: config.consensus.clone(),
            retry: config.retry.clone(),
            engine: config.engine.clone(),
        })
    }

    /// Build the engine from config and environment secrets. The judge
    /// provider is picked from the panel; if its key is missing the first
    /// available provider stands in.
    pub fn from_config(
        config: &AppConfig,
        secrets: &Secrets,
        catalog: Arc<MetricCatalog>,
        cache: Arc<dyn ConsensusCache>,
        store: Option<Store>,
    ) -> Result<Self> {
        let providers = build_providers(config, secrets)?;
        let judge = match providers
            .iter()
            .find(|p| p.name() == config.judge.provider)
        {
            Some(judge) => judge.clone(),
            None => {
                warn!(
                    configured = %config.judge.provider,
                    fallback = %providers[0].name(),
                    "Configured judge provider unavailable; using fallback"
                );
                providers[0].clone()
            }
        };
        Self::new(config, catalog, providers, judge, cache, store)
    }

    /// Run one full comparison between two cities.
    #[instrument(skip(self, prefs), fields(city1 = %city1, city2 = %city2))]
    pub async fn compare(
        &self,
        city1: CityDescriptor,
        city2: CityDescriptor,
        prefs: &RollupPreferences,
    ) -> Result<ComparisonResult> {
        // Reject a bad weighting scheme, including a typoed exclusion,
        // before spending a single API call.
        prefs.validate(&self.catalog)?;

        let active_metrics: Vec<&MetricDefinition> = self
            .catalog
            .metrics
            .iter()
            .filter(|m| !prefs.excluded.contains(&m.category))
            .collect();
        if active_metrics.is_empty() {
            bail!("Every metric is excluded; nothing to evaluate");
        }

        let provider_names: Vec<String> =
            self.providers.iter().map(|p| p.name().to_string()).collect();
        info!(
            metrics = active_metrics.len(),
            providers = provider_names.len(),
            budget_seconds = self.engine.comparison_budget_seconds,
            "Starting comparison"
        );

        let started = std::time::Instant::now();
        let deadline = tokio::time::Instant::now()
            + Duration::from_secs(self.engine.comparison_budget_seconds);

        let (outcomes1, outcomes2) = tokio::join!(
            self.score_city(&city1, &active_metrics, deadline, &provider_names),
            self.score_city(&city2, &active_metrics, deadline, &provider_names),
        );

        let mut stats = RunStats::default();
        let mut cost_rows: Vec<CostEntry> = Vec::new();
        let mut metrics1 = Vec::with_capacity(outcomes1.len());
        let mut metrics2 = Vec::with_capacity(outcomes2.len());
        for (outcomes, metrics) in [(outcomes1, &mut metrics1), (outcomes2, &mut metrics2)] {
            for outcome in outcomes {
                fold_outcome(&mut stats, &mut cost_rows, &outcome);
                metrics.push(outcome.consensus);
            }
        }

        let scored1 = rollup_city(city1, metrics1, &self.catalog, prefs)?;
        let scored2 = rollup_city(city2, metrics2, &self.catalog, prefs)?;

        let (winner, score_difference) =
            crate::consensus::models::determine_winner(scored1.total_score, scored2.total_score);

        let synthesis = JudgeSynthesizer::new(self.judge.as_ref(), self.retry.clone())
            .synthesize(&scored1, &scored2, winner, score_difference)
            .await;
        if synthesis.cost > Decimal::ZERO {
            cost_rows.push(CostEntry {
                provider: self.judge.name().to_string(),
                input_tokens: synthesis.input_tokens,
                output_tokens: synthesis.output_tokens,
                cost: synthesis.cost,
            });
        }

        stats.duration_ms = started.elapsed().as_millis() as u64;
        stats.total_api_cost = cost_rows.iter().map(|c| c.cost).sum();

        let result = ComparisonResult {
            metadata: ComparisonMetadata {
                id: Uuid::new_v4(),
                generated_at: Utc::now(),
                providers: provider_names,
                stats: stats.clone(),
            },
            city1: scored1,
            city2: scored2,
            winner,
            score_difference,
            verdict: synthesis.verdict,
        };

        if let Some(store) = &self.store {
            store
                .insert_comparison(&result)
                .await
                .context("Failed to archive comparison")?;
            for entry in &cost_rows {
                store
                    .insert_api_cost(&ApiCostRecord {
                        id: None,
                        comparison_id: Some(result.metadata.id.to_string()),
                        provider: entry.provider.clone(),
                        input_tokens: Some(entry.input_tokens),
                        output_tokens: Some(entry.output_tokens),
                        cost: entry.cost.to_string(),
                        created_at: None,
                    })
                    .await
                    .context("Failed to record API cost")?;
            }
        }

        info!(
            winner = %result.winner,
            score_difference,
            duration_ms = stats.duration_ms,
            api_cost = %stats.total_api_cost,
            cache_hits = stats.cache_hits,
            "Comparison complete"
        );
        Ok(result)
    }

    async fn score_city(
        &self,
        city: &CityDescriptor,
        metrics: &[&MetricDefinition],
        deadline: tokio::time::Instant,
        provider_names: &[String],
    ) -> Vec<MetricOutcome> {
        stream::iter(metrics.iter().copied())
            .map(|metric| self.evaluate_one(city, metric, deadline, provider_names))
            .buffer_unordered(self.engine.metric_concurrency)
            .collect()
            .await
    }

    /// Evaluate one metric for one city across the whole provider panel.
    /// Always settles: every provider either contributes a score, a typed
    /// failure, or a deadline timeout.
    async fn evaluate_one(
        &self,
        city: &CityDescriptor,
        metric: &MetricDefinition,
        deadline: tokio::time::Instant,
        provider_names: &[String],
    ) -> MetricOutcome {
        let key = cache_key(city, &metric.id, provider_names);
        if let Some(hit) = self.cache.get(&key).await {
            return MetricOutcome {
                consensus: hit,
                cache_hit: true,
                attempted: 0,
                succeeded: 0,
                failures: Vec::new(),
                costs: Vec::new(),
            };
        }

        let calls = self.providers.iter().map(|provider| {
            let provider = provider.clone();
            async move {
                match tokio::time::timeout_at(
                    deadline,
                    evaluate_metric(provider.as_ref(), city, metric, &self.retry),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(crate::provider::EvaluationFailure::permanent(
                        provider.name(),
                        FailureReason::Timeout,
                        "comparison budget exhausted",
                    )),
                }
            }
        });
        let results = futures::future::join_all(calls).await;

        let attempted = results.len() as u64;
        let mut scores = Vec::new();
        let mut failures = Vec::new();
        let mut costs = Vec::new();
        for result in results {
            match result {
                Ok(evaluated) => {
                    costs.push(CostEntry {
                        provider: evaluated.score.provider.clone(),
                        input_tokens: evaluated.input_tokens,
                        output_tokens: evaluated.output_tokens,
                        cost: evaluated.cost,
                    });
                    scores.push(evaluated.score);
                }
                Err(failure) => {
                    warn!(
                        provider = %failure.provider,
                        metric = %metric.id,
                        city = %city,
                        reason = %failure.reason,
                        detail = %failure.detail,
                        "Provider contributed no score"
                    );
                    failures.push(failure.reason);
                }
            }
        }
        let succeeded = scores.len() as u64;

        let consensus = aggregate_metric(&metric.id, scores, &self.consensus);
        if consensus.score.is_some() {
            // no_data is never cached; the next run should try again.
            self.cache
                .set(
                    &key,
                    &consensus,
                    Duration::from_secs(self.engine.cache_ttl_seconds),
                )
                .await;
        }

        MetricOutcome {
            consensus,
            cache_hit: false,
            attempted,
            succeeded,
            failures,
            costs,
        }
    }
}

fn fold_outcome(stats: &mut RunStats, cost_rows: &mut Vec<CostEntry>, outcome: &MetricOutcome) {
    stats.provider_calls_attempted += outcome.attempted;
    stats.provider_calls_succeeded += outcome.succeeded;
    if outcome.cache_hit {
        stats.cache_hits += 1;
    }
    for reason in &outcome.failures {
        match reason {
            FailureReason::RateLimited => stats.failures_rate_limited += 1,
            FailureReason::Timeout => stats.failures_timeout += 1,
            FailureReason::InvalidResponse => stats.failures_invalid_response += 1,
            FailureReason::ProviderError => stats.failures_provider_error += 1,
        }
    }
    for cost in &outcome.costs {
        cost_rows.push(CostEntry {
            provider: cost.provider.clone(),
            input_tokens: cost.input_tokens,
            output_tokens: cost.output_tokens,
            cost: cost.cost,
        });
    }
}
