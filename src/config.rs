use std::path::Path;

use anyhow::{bail, Context, Result};
use secrecy::SecretString;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub engine: EngineConfig,
    pub consensus: ConsensusConfig,
    pub rollup: RollupConfig,
    pub judge: JudgeConfig,
    pub retry: RetryConfig,
    pub monitoring: MonitoringConfig,
    pub database: DatabaseConfig,
    pub catalog: CatalogConfig,
    pub providers: Vec<ProviderConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Wall-clock budget for one whole comparison run.
    pub comparison_budget_seconds: u64,
    /// Timeout for a single provider API call.
    pub provider_call_timeout_seconds: u64,
    /// How many metrics are evaluated concurrently per city.
    pub metric_concurrency: usize,
    pub cache_ttl_seconds: u64,
}

/// Standard-deviation cutoffs for the confidence label.
///
/// These are tunable product constants, not hard invariants. They must be
/// strictly increasing so the label is monotonic in dispersion.
#[derive(Debug, Clone, Deserialize)]
pub struct ConsensusConfig {
    pub unanimous_max_std_dev: f64,
    pub strong_max_std_dev: f64,
    pub moderate_max_std_dev: f64,
}

impl ConsensusConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.unanimous_max_std_dev < self.strong_max_std_dev
            && self.strong_max_std_dev < self.moderate_max_std_dev)
        {
            bail!(
                "Confidence thresholds must be strictly increasing: {} / {} / {}",
                self.unanimous_max_std_dev,
                self.strong_max_std_dev,
                self.moderate_max_std_dev
            );
        }
        if self.unanimous_max_std_dev < 0.0 {
            bail!("Confidence thresholds must be non-negative");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RollupConfig {
    /// Default written-law share (0-100) for dual-dimension metrics.
    pub law_weight_pct: u8,
    /// When true, dual-dimension metrics take min(law, lived) instead of the blend.
    pub worst_case: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JudgeConfig {
    /// Which configured provider performs the verdict synthesis call.
    pub provider: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitoringConfig {
    pub log_level: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogConfig {
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub model: String,
    pub base_url: String,
    pub requests_per_minute: u32,
    pub burst_size: u32,
}

/// Secrets loaded exclusively from environment variables.
/// Not serializable, not stored in config files.
pub struct Secrets {
    pub anthropic_api_key: Option<SecretString>,
    pub openai_api_key: Option<SecretString>,
    pub perplexity_api_key: Option<SecretString>,
}

impl Secrets {
    pub fn from_env() -> Self {
        let read = |var: &str| std::env::var(var).ok().map(SecretString::from);
        Self {
            anthropic_api_key: read("ANTHROPIC_API_KEY"),
            openai_api_key: read("OPENAI_API_KEY"),
            perplexity_api_key: read("PERPLEXITY_API_KEY"),
        }
    }

    pub fn for_provider(&self, name: &str) -> Option<&SecretString> {
        match name {
            "anthropic" => self.anthropic_api_key.as_ref(),
            "openai" => self.openai_api_key.as_ref(),
            "perplexity" => self.perplexity_api_key.as_ref(),
            _ => None,
        }
    }
}

impl AppConfig {
    /// Load configuration from config/default.toml, overlaying environment
    /// variables for secrets.
    pub fn load() -> Result<(Self, Secrets)> {
        dotenvy::dotenv().ok();
        let config = Self::from_file(Path::new("config/default.toml"))?;
        Ok((config, Secrets::from_env()))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: AppConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        self.consensus.validate()?;
        if self.rollup.law_weight_pct > 100 {
            bail!(
                "rollup.law_weight_pct must be 0-100, got {}",
                self.rollup.law_weight_pct
            );
        }
        if self.providers.is_empty() {
            bail!("At least one provider must be configured");
        }
        if !self.providers.iter().any(|p| p.name == self.judge.provider) {
            bail!(
                "judge.provider '{}' is not among the configured providers",
                self.judge.provider
            );
        }
        if self.engine.metric_concurrency == 0 {
            bail!("engine.metric_concurrency must be at least 1");
        }
        Ok(())
    }
}
