//! SQLite persistence: the comparison archive, the API cost ledger, and the
//! durable consensus cache.

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};
use tracing::warn;
use uuid::Uuid;

use crate::cache::ConsensusCache;
use crate::consensus::models::{ComparisonResult, MetricConsensus};

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

/// One row of the comparison archive, without the full result payload.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ComparisonSummary {
    pub id: String,
    pub city1: String,
    pub city2: String,
    pub winner: String,
    pub score_difference: f64,
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ApiCostRecord {
    pub id: Option<i64>,
    pub comparison_id: Option<String>,
    pub provider: String,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    /// Decimal serialized as text; SQLite REAL would lose cents.
    pub cost: String,
    pub created_at: Option<String>,
}

impl Store {
    pub async fn new(database_path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{database_path}"))
            .context("Invalid database path")?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("Failed to connect to SQLite database")?;

        let store = Self { pool };
        store.migrate().await?;

        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        let migration_sql = include_str!("../../migrations/001_init.sql");
        // Execute each statement separately (sqlx doesn't support multiple statements in one call)
        for statement in migration_sql.split(';') {
            let trimmed = statement.trim();
            if !trimmed.is_empty() {
                sqlx::query(trimmed)
                    .execute(&self.pool)
                    .await
                    .with_context(|| format!("Failed to execute migration: {trimmed}"))?;
            }
        }
        Ok(())
    }

    // --- Comparison archive ---

    pub async fn insert_comparison(&self, result: &ComparisonResult) -> Result<()> {
        let payload =
            serde_json::to_string(result).context("Failed to serialize comparison result")?;

        sqlx::query(
            "INSERT INTO comparisons (id, city1, city2, winner, score_difference, result_json)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(result.metadata.id.to_string())
        .bind(result.city1.city.display_name())
        .bind(result.city2.city.display_name())
        .bind(result.winner.to_string())
        .bind(result.score_difference)
        .bind(payload)
        .execute(&self.pool)
        .await
        .context("Failed to insert comparison")?;

        Ok(())
    }

    pub async fn get_comparison(&self, id: Uuid) -> Result<Option<ComparisonResult>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT result_json FROM comparisons WHERE id = ?")
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await
                .context("Failed to fetch comparison")?;

        match row {
            Some((payload,)) => {
                let result = serde_json::from_str(&payload)
                    .context("Failed to deserialize archived comparison")?;
                Ok(Some(result))
            }
            None => Ok(None),
        }
    }

    pub async fn get_recent_comparisons(&self, limit: i64) -> Result<Vec<ComparisonSummary>> {
        let rows = sqlx::query_as::<_, ComparisonSummary>(
            "SELECT id, city1, city2, winner, score_difference, created_at
             FROM comparisons ORDER BY created_at DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch recent comparisons")?;
        Ok(rows)
    }

    // --- API cost operations ---

    pub async fn insert_api_cost(&self, cost: &ApiCostRecord) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO api_costs (comparison_id, provider, input_tokens, output_tokens, cost)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&cost.comparison_id)
        .bind(&cost.provider)
        .bind(cost.input_tokens)
        .bind(cost.output_tokens)
        .bind(&cost.cost)
        .execute(&self.pool)
        .await
        .context("Failed to insert API cost")?;

        Ok(result.last_insert_rowid())
    }

    pub async fn get_total_api_cost(&self) -> Result<Decimal> {
        let row: (Option<String>,) =
            sqlx::query_as("SELECT CAST(SUM(CAST(cost AS REAL)) AS TEXT) FROM api_costs")
                .fetch_one(&self.pool)
                .await
                .context("Failed to get total API cost")?;

        match row.0 {
            Some(s) => Ok(Decimal::from_str(&s).unwrap_or(Decimal::ZERO)),
            None => Ok(Decimal::ZERO),
        }
    }

    pub async fn get_api_cost_for_comparison(&self, id: Uuid) -> Result<Decimal> {
        let row: (Option<String>,) = sqlx::query_as(
            "SELECT CAST(SUM(CAST(cost AS REAL)) AS TEXT) FROM api_costs WHERE comparison_id = ?",
        )
        .bind(id.to_string())
        .fetch_one(&self.pool)
        .await
        .context("Failed to get API cost for comparison")?;

        match row.0 {
            Some(s) => Ok(Decimal::from_str(&s).unwrap_or(Decimal::ZERO)),
            None => Ok(Decimal::ZERO),
        }
    }

    // --- Consensus cache rows ---

    pub async fn cache_get(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT payload FROM consensus_cache WHERE cache_key = ? AND expires_at > ?",
        )
        .bind(key)
        .bind(Utc::now().timestamp())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to read consensus cache")?;
        Ok(row.map(|(payload,)| payload))
    }

    pub async fn cache_set(&self, key: &str, payload: &str, expires_at: i64) -> Result<()> {
        sqlx::query(
            "INSERT INTO consensus_cache (cache_key, payload, expires_at) VALUES (?, ?, ?)
             ON CONFLICT(cache_key) DO UPDATE SET payload = excluded.payload,
                                                  expires_at = excluded.expires_at",
        )
        .bind(key)
        .bind(payload)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .context("Failed to write consensus cache")?;
        Ok(())
    }

    pub async fn cache_purge_expired(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM consensus_cache WHERE expires_at <= ?")
            .bind(Utc::now().timestamp())
            .execute(&self.pool)
            .await
            .context("Failed to purge expired cache rows")?;
        Ok(result.rows_affected())
    }
}

/// Consensus cache backed by the store, so cached evaluations survive across
/// CLI invocations. Cache trouble is logged and treated as a miss; it must
/// never fail a comparison.
pub struct SqliteCache {
    store: Store,
}

impl SqliteCache {
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ConsensusCache for SqliteCache {
    async fn get(&self, key: &str) -> Option<MetricConsensus> {
        let payload = match self.store.cache_get(key).await {
            Ok(payload) => payload?,
            Err(e) => {
                warn!(error = %e, "Consensus cache read failed; treating as miss");
                return None;
            }
        };
        match serde_json::from_str(&payload) {
            Ok(consensus) => Some(consensus),
            Err(e) => {
                warn!(error = %e, "Corrupt consensus cache entry; treating as miss");
                None
            }
        }
    }

    async fn set(&self, key: &str, value: &MetricConsensus, ttl: Duration) {
        let payload = match serde_json::to_string(value) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Failed to serialize consensus for cache");
                return;
            }
        };
        let expires_at = Utc::now().timestamp() + ttl.as_secs() as i64;
        if let Err(e) = self.store.cache_set(key, &payload, expires_at).await {
            warn!(error = %e, "Consensus cache write failed");
        }
    }
}
