use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use lifescore_engine::cache::{ConsensusCache, NoopCache};
use lifescore_engine::catalog::MetricCatalog;
use lifescore_engine::config::AppConfig;
use lifescore_engine::consensus::models::{CityDescriptor, ComparisonResult};
use lifescore_engine::consensus::rollup::{DualDimensionStrategy, RollupPreferences};
use lifescore_engine::db::{SqliteCache, Store};
use lifescore_engine::engine::ComparisonEngine;
use lifescore_engine::export;
use lifescore_engine::monitoring::logger;

#[derive(Parser)]
#[command(name = "lifescore", about = "Multi-LLM consensus comparison of freedom between two cities")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compare two cities across the metric catalog.
    Compare {
        /// First city, e.g. "Portland, Oregon, USA"
        city1: String,
        /// Second city, e.g. "Berlin, Germany"
        city2: String,
        /// Category id to exclude from the rollup (repeatable)
        #[arg(long = "exclude")]
        exclude: Vec<String>,
        /// Written-law share for dual-dimension metrics, e.g. "60/40"
        #[arg(long = "law-lived")]
        law_lived: Option<String>,
        /// Score dual-dimension metrics by their worse dimension
        #[arg(long)]
        worst_case: bool,
        /// Skip the consensus cache and hit the providers fresh
        #[arg(long)]
        no_cache: bool,
        /// Restrict the panel to these providers, e.g. "anthropic,openai"
        #[arg(long)]
        providers: Option<String>,
        /// Write a per-metric CSV export here
        #[arg(long)]
        csv: Option<PathBuf>,
        /// Write the full result JSON here
        #[arg(long)]
        json: Option<PathBuf>,
    },
    /// Validate and summarize the metric catalog.
    Catalog,
    /// List recent archived comparisons.
    Recent {
        #[arg(long, default_value_t = 10)]
        limit: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let (config, secrets) = AppConfig::load()?;
    logger::init_logging(&config.monitoring)?;

    let catalog = MetricCatalog::load(Path::new(&config.catalog.path))?;

    match Cli::parse().command {
        Commands::Compare {
            city1,
            city2,
            exclude,
            law_lived,
            worst_case,
            no_cache,
            providers,
            csv,
            json,
        } => {
            let mut config = config;
            if let Some(names) = providers {
                let wanted: HashSet<&str> = names.split(',').map(str::trim).collect();
                config.providers.retain(|p| wanted.contains(p.name.as_str()));
                if config.providers.is_empty() {
                    bail!("--providers '{names}' matches none of the configured providers");
                }
            }
            let catalog = Arc::new(catalog);
            let store = Store::new(&config.database.path).await?;
            let cache: Arc<dyn ConsensusCache> = if no_cache {
                Arc::new(NoopCache)
            } else {
                Arc::new(SqliteCache::new(store.clone()))
            };

            let prefs = build_preferences(&config, &catalog, exclude, law_lived, worst_case)?;
            let engine = ComparisonEngine::from_config(
                &config,
                &secrets,
                catalog.clone(),
                cache,
                Some(store),
            )?;

            let result = engine
                .compare(parse_city(&city1), parse_city(&city2), &prefs)
                .await?;

            print_summary(&result);
            if let Some(path) = csv {
                export::write_csv(&result, &catalog, &path)?;
                println!("CSV written to {}", path.display());
            }
            if let Some(path) = json {
                export::write_json(&result, &path)?;
                println!("JSON written to {}", path.display());
            }
        }
        Commands::Catalog => {
            println!(
                "Catalog v{}: {} metrics in {} categories",
                catalog.version,
                catalog.metrics.len(),
                catalog.categories.len()
            );
            for category in &catalog.categories {
                let count = catalog.metrics_in_category(&category.id).count();
                println!(
                    "  {:<24} weight {:>3}  {} metrics",
                    category.id, category.default_weight, count
                );
            }
        }
        Commands::Recent { limit } => {
            let store = Store::new(&config.database.path).await?;
            let recent = store.get_recent_comparisons(limit).await?;
            if recent.is_empty() {
                println!("No archived comparisons.");
            }
            for row in recent {
                println!(
                    "{}  {}  {} vs {}  winner: {} (+{:.1})",
                    row.created_at.unwrap_or_default(),
                    row.id,
                    row.city1,
                    row.city2,
                    row.winner,
                    row.score_difference
                );
            }
        }
    }

    Ok(())
}

/// "Portland, Oregon, USA" → name + optional region + optional country.
fn parse_city(input: &str) -> CityDescriptor {
    let mut parts = input.split(',').map(str::trim).filter(|p| !p.is_empty());
    let mut city = CityDescriptor::new(parts.next().unwrap_or(input).to_string());
    city.region = parts.next().map(str::to_string);
    city.country = parts.next().map(str::to_string);
    city
}

fn build_preferences(
    config: &AppConfig,
    catalog: &MetricCatalog,
    exclude: Vec<String>,
    law_lived: Option<String>,
    worst_case: bool,
) -> Result<RollupPreferences> {
    let mut prefs = RollupPreferences::defaults(catalog);
    prefs.excluded = exclude.into_iter().collect::<HashSet<String>>();

    prefs.dual = if worst_case || (config.rollup.worst_case && law_lived.is_none()) {
        DualDimensionStrategy::WorstCase
    } else {
        let law_pct = match law_lived {
            Some(split) => parse_law_lived(&split)?,
            None => config.rollup.law_weight_pct,
        };
        DualDimensionStrategy::Blend { law_pct }
    };
    Ok(prefs)
}

/// "60/40" → 60. The lived share must be the complement.
fn parse_law_lived(split: &str) -> Result<u8> {
    let Some((law, lived)) = split.split_once('/') else {
        bail!("--law-lived expects LAW/LIVED, e.g. 60/40");
    };
    let law: u8 = law.trim().parse().context("Invalid law share")?;
    let lived: u8 = lived.trim().parse().context("Invalid lived share")?;
    if law.checked_add(lived) != Some(100) {
        bail!("--law-lived shares must sum to 100, got {law}/{lived}");
    }
    Ok(law)
}

fn print_summary(result: &ComparisonResult) {
    let fmt_total = |t: Option<f64>| {
        t.map(|v| format!("{v:.1}"))
            .unwrap_or_else(|| "no data".to_string())
    };
    println!(
        "\n{}: {}   {}: {}",
        result.city1.city,
        fmt_total(result.city1.total_score),
        result.city2.city,
        fmt_total(result.city2.total_score)
    );
    println!(
        "Winner: {} (margin {:.1})",
        result.winner, result.score_difference
    );

    println!("\nBy category:");
    for (c1, c2) in result.city1.categories.iter().zip(&result.city2.categories) {
        println!(
            "  {:<24} {:>8} vs {:>8}  (weight {})",
            c1.category_id,
            fmt_total(c1.score),
            fmt_total(c2.score),
            c1.weight
        );
    }

    if let Some(verdict) = &result.verdict {
        println!("\nVerdict: {}", verdict.summary);
        for note in &verdict.category_notes {
            println!("  [{}] {}", note.category_id, note.note);
        }
    } else {
        println!("\n(no narrative verdict; numeric result stands)");
    }

    let stats = &result.metadata.stats;
    println!(
        "\n{} calls, {} ok, {} cache hits, {:.1}s, ${}",
        stats.provider_calls_attempted,
        stats.provider_calls_succeeded,
        stats.cache_hits,
        stats.duration_ms as f64 / 1000.0,
        stats.total_api_cost
    );
}
