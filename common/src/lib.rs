/*!
common/src/lib.rs

Shared configuration types and DB helper functions for Geodaily.

This file provides:
- Config data structures (deserialized from TOML, every section defaulted)
- An async loader for a TOML config file with default/override merging
- A helper to initialize an SQLite pool for the cost ledger
*/

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

/// Database configuration section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Path to the sqlite database file (e.g. "data/geodaily.db")
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "data/geodaily.db".to_string(),
        }
    }
}

/// Near-duplicate detection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Normalized-title similarity at or above which two articles are duplicates
    pub title_threshold: f64,
    /// Above this many articles, comparisons are restricted to token buckets
    pub pairwise_limit: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            title_threshold: 0.85,
            pairwise_limit: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusteringConfig {
    pub similarity_threshold: f64,
    /// Minimum Jaccard overlap of significant tokens for two articles to link
    pub min_token_overlap: f64,
    pub recency_half_life_hours: f64,
    pub w_diversity: f64,
    pub w_relevance: f64,
    pub w_keywords: f64,
    pub w_recency: f64,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.6,
            min_token_overlap: 0.2,
            recency_half_life_hours: 24.0,
            w_diversity: 1.0,
            w_relevance: 1.0,
            w_keywords: 0.5,
            w_recency: 2.0,
        }
    }
}

/// A keyword and the weight it contributes to relevance when matched
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KeywordWeight {
    pub term: String,
    pub weight: f64,
}

impl KeywordWeight {
    pub fn new(term: &str, weight: f64) -> Self {
        Self {
            term: term.to_string(),
            weight,
        }
    }
}

/// Multipliers applied per source category
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceWeights {
    pub mainstream: f64,
    pub analysis: f64,
    pub think_tank: f64,
    pub regional: f64,
}

impl Default for SourceWeights {
    fn default() -> Self {
        Self {
            mainstream: 0.8,
            analysis: 1.1,
            think_tank: 1.3,
            regional: 1.0,
        }
    }
}

/// Relevance scoring group
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub keywords: Vec<KeywordWeight>,
    pub source_weights: SourceWeights,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        let high = [
            "china",
            "taiwan",
            "russia",
            "ukraine",
            "nato",
            "sanctions",
            "nuclear",
            "energy",
            "cyber",
            "diplomacy",
            "military",
            "trade war",
            "semiconductor",
            "arctic",
            "middle east",
        ];
        let medium = [
            "election",
            "democracy",
            "economy",
            "climate",
            "migration",
            "terrorism",
            "africa",
            "asia",
            "europe",
            "g7",
            "g20",
        ];
        let keywords = high
            .iter()
            .map(|t| KeywordWeight::new(t, 1.0))
            .chain(medium.iter().map(|t| KeywordWeight::new(t, 0.5)))
            .collect();
        Self {
            keywords,
            source_weights: SourceWeights::default(),
        }
    }
}

/// Multi-stage analysis settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Minimum overall screening score for a cluster to advance
    pub screening_threshold: f64,
    pub target_stories: usize,
    /// Upper bound on the share of breaking-news stories in the selection
    pub breaking_news_ratio: f64,
    pub max_concurrency: usize,
    pub run_timeout_seconds: u64,
    pub max_tokens_per_call: usize,
    pub temperature: f32,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            screening_threshold: 6.5,
            target_stories: 4,
            breaking_news_ratio: 0.25,
            max_concurrency: 3,
            run_timeout_seconds: 600,
            max_tokens_per_call: 800,
            temperature: 0.3,
        }
    }
}

/// Spend ceilings and pricing for the analysis service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CostConfig {
    pub daily_limit: f64,
    pub monthly_limit: f64,
    pub alert_threshold_percent: f64,
    pub input_cost_per_1k: f64,
    pub output_cost_per_1k: f64,
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            daily_limit: 2.0,
            monthly_limit: 50.0,
            alert_threshold_percent: 80.0,
            input_cost_per_1k: 0.0008,
            output_cost_per_1k: 0.0024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout_seconds: u64,
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_seconds: 60,
            success_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            multiplier: 2.0,
            max_delay_ms: 60_000,
            jitter: true,
        }
    }
}

/// Capacity of requests allowed per window for one endpoint
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RateLimitConfig {
    pub capacity: u32,
    pub window_seconds: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 30,
            window_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitsConfig {
    pub default: RateLimitConfig,
    /// Per-endpoint overrides keyed by endpoint name
    pub endpoints: HashMap<String, RateLimitConfig>,
}

impl RateLimitsConfig {
    pub fn for_endpoint(&self, endpoint: &str) -> RateLimitConfig {
        self.endpoints.get(endpoint).copied().unwrap_or(self.default)
    }
}

/// Source health tracking
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub interval_seconds: u64,
    /// Number of most recent outcomes kept per source
    pub window: usize,
    pub min_samples: usize,
    pub healthy_threshold: f64,
    pub degraded_threshold: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 60,
            window: 20,
            min_samples: 3,
            healthy_threshold: 0.7,
            degraded_threshold: 0.3,
        }
    }
}

/// Remote LLM config (used if `llm.adapter = "remote"`)
///
/// Token ceiling and temperature live in `[analysis]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemoteLlmConfig {
    pub api_url: Option<String>,
    pub api_key_env: Option<String>,
    pub model: Option<String>,
    pub timeout_seconds: Option<u64>,
}

/// LLM top-level config
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub adapter: Option<String>, // "remote", "none"
    // Fallback: single remote config
    pub remote: Option<RemoteLlmConfig>,
    // Task-specific config for the analysis stages
    pub analysis: Option<RemoteLlmConfig>,
}

/// Top-level application configuration (deserialized from config.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub clustering: ClusteringConfig,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub cost: CostConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub rate_limits: RateLimitsConfig,
    #[serde(default)]
    pub health: HealthConfig,
    pub llm: Option<LlmConfig>,
}

impl Config {
    /// Load configuration from a TOML file asynchronously.
    ///
    /// Example:
    ///   let cfg = Config::from_file("config.toml").await?;
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = tokio::fs::read_to_string(path.as_ref())
            .await
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;
        let cfg: Config = toml::from_str(&data).context("Failed to parse TOML configuration")?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load configuration with an optional default file and an optional override file.
    /// If both are present, they are merged (override takes precedence).
    pub async fn load_with_defaults(
        default_path: Option<&Path>,
        override_path: Option<&Path>,
    ) -> Result<Self> {
        let mut config_value = toml::Value::Table(toml::map::Map::new());

        for (path, label) in [(default_path, "default"), (override_path, "override")] {
            let Some(path) = path else { continue };
            if !path.exists() {
                continue;
            }
            let data = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read {} config: {}", label, path.display()))?;
            let val: toml::Value = toml::from_str(&data)
                .with_context(|| format!("Failed to parse {} configuration", label))?;
            merge_toml(&mut config_value, val);
        }

        let cfg: Config = config_value
            .try_into()
            .context("Failed to parse merged configuration")?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("dedup.title_threshold", self.dedup.title_threshold),
            ("clustering.similarity_threshold", self.clustering.similarity_threshold),
            ("clustering.min_token_overlap", self.clustering.min_token_overlap),
            ("analysis.breaking_news_ratio", self.analysis.breaking_news_ratio),
        ] {
            if !(0.0..=1.0).contains(&value) {
                bail!("{} must be within [0, 1], got {}", name, value);
            }
        }
        if self.clustering.recency_half_life_hours <= 0.0 {
            bail!("clustering.recency_half_life_hours must be positive");
        }
        if self.analysis.max_concurrency == 0 {
            bail!("analysis.max_concurrency must be at least 1");
        }
        if self.cost.daily_limit < 0.0 || self.cost.monthly_limit < 0.0 {
            bail!("cost limits must not be negative");
        }
        if self.circuit_breaker.failure_threshold == 0 || self.circuit_breaker.success_threshold == 0 {
            bail!("circuit_breaker thresholds must be at least 1");
        }
        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be at least 1");
        }
        let limits = std::iter::once(&self.rate_limits.default).chain(self.rate_limits.endpoints.values());
        for limit in limits {
            if limit.capacity == 0 || limit.window_seconds == 0 {
                bail!("rate limit capacity and window must be at least 1");
            }
        }
        if self.health.window == 0 {
            bail!("health.window must be at least 1");
        }
        Ok(())
    }
}

fn merge_toml(a: &mut toml::Value, b: toml::Value) {
    match (a, b) {
        (toml::Value::Table(a_map), toml::Value::Table(b_map)) => {
            for (k, v) in b_map {
                if let Some(a_val) = a_map.get_mut(&k) {
                    merge_toml(a_val, v);
                } else {
                    a_map.insert(k, v);
                }
            }
        }
        (a_val, b_val) => *a_val = b_val,
    }
}

/// Initialize an SQLite connection pool.
///
/// Creates the parent directory if necessary and returns a configured `SqlitePool`.
/// The ledger is small and written by a single process, so the pool stays modest.
///
/// Example:
///   let pool = init_db_pool("data/geodaily.db").await?;
pub async fn init_db_pool(path: &str) -> Result<SqlitePool> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await.with_context(|| {
                format!("Failed to create DB parent directory: {}", parent.display())
            })?;
        }
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to connect to sqlite database at path: {}", path))?;

    Ok(pool)
}
