/*
geodaily - single-binary main.rs
Reads a batch of collected articles, deduplicates and clusters them, runs the
multi-stage analysis and prints the run report as JSON.
*/

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use common::{init_db_pool, Config};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use geodaily::analysis::{CallGateway, Guards, MultiStageAnalyzer, RunReport};
use geodaily::archiver::MemoryArchiver;
use geodaily::cost::CostController;
use geodaily::llm::{self, LlmProvider};
use geodaily::models::Article;
use geodaily::processing::{process_articles, ProcessingStats};
use geodaily::resilience::{
    CircuitBreakerRegistry, GracefulDegradationManager, HealthMonitor, RateLimiterRegistry, RetryPolicy,
};
use geodaily::storage::{self, SqliteLedgerStore};

#[derive(Parser, Debug)]
#[command(name = "geodaily", about = "Geodaily processing and analysis engine")]
struct Args {
    /// Path to config.toml
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// JSON file holding the collected articles
    #[arg(long, value_name = "FILE")]
    articles: Option<PathBuf>,

    /// Override log level (info, debug, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Skip the analysis service and use heuristic output only
    #[arg(long)]
    mock: bool,

    /// Write stage archive records to this JSON file
    #[arg(long, value_name = "FILE")]
    archive_out: Option<PathBuf>,

    /// Reference time for recency scoring (RFC 3339); defaults to now
    #[arg(long)]
    now: Option<DateTime<Utc>>,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    print_config: bool,
}

#[derive(serde::Serialize)]
struct Output<'a> {
    processing: &'a ProcessingStats,
    analysis: &'a RunReport,
    cost: geodaily::cost::CostReport,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI args
    let args = Args::parse();

    // Initialize logging; the report goes to stdout so logs go to stderr
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    // Resolve config paths
    let default_path = PathBuf::from("config.default.toml");
    let override_path = if let Some(p) = args.config.clone() {
        if !p.exists() {
            error!(path = ?p, "specified config file not found");
            return Err(anyhow::anyhow!("Config file not found: {}", p.display()));
        }
        Some(p)
    } else {
        let p = PathBuf::from("config.toml");
        if p.exists() {
            Some(p)
        } else {
            None
        }
    };

    let config = match Config::load_with_defaults(
        if default_path.exists() { Some(&default_path) } else { None },
        override_path.as_deref(),
    )
    .await
    {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(%e, "failed to load configuration");
            return Err(e);
        }
    };
    info!(default = ?default_path, override = ?override_path, "configuration loaded");

    if args.print_config {
        print!("{}", toml::to_string(&config).context("failed to render configuration")?);
        return Ok(());
    }

    let articles_path = args
        .articles
        .clone()
        .ok_or_else(|| anyhow::anyhow!("--articles is required"))?;
    let articles = load_articles(&articles_path).await?;
    info!(count = articles.len(), path = %articles_path.display(), "articles loaded");

    // Initialize DB pool - resolve and log the absolute DB path before connecting
    let db_path_abs = match tokio::fs::canonicalize(&config.database.path).await {
        Ok(p) => p.to_string_lossy().to_string(),
        Err(_) => config.database.path.clone(),
    };
    info!(db_path = %db_path_abs, "resolved DB path");

    let db_pool = match init_db_pool(&db_path_abs).await {
        Ok(p) => p,
        Err(e) => {
            error!(%e, db_path = %db_path_abs, "failed to initialize database pool");
            return Err(e);
        }
    };
    storage::ensure_schema(&db_pool).await?;

    let ledger = Arc::new(SqliteLedgerStore::new(db_pool.clone()).await?);
    let cost = CostController::open(config.cost.clone(), ledger).await?;

    let breakers = Arc::new(CircuitBreakerRegistry::new(config.circuit_breaker.clone()));
    match storage::load_breaker_snapshots(&db_pool).await {
        Ok(snapshots) => breakers.restore(&snapshots),
        Err(e) => warn!(%e, "failed to restore circuit breaker state"),
    }

    // One token stops the analysis run and the background tasks
    let shutdown = CancellationToken::new();
    let degradation = Arc::new(GracefulDegradationManager::new());
    let health = Arc::new(HealthMonitor::new(config.health.clone(), degradation.clone()));
    let health_task = health.clone().spawn(shutdown.clone());

    let provider: Option<Arc<dyn LlmProvider>> = if args.mock {
        info!("mock mode: analysis service disabled");
        None
    } else if let Some(ref llm_config) = config.llm {
        match create_llm_provider(llm_config, &config.analysis) {
            Ok(provider) => {
                info!(endpoint = provider.endpoint(), "analysis provider initialized");
                Some(Arc::from(provider))
            }
            Err(e) => {
                error!("Failed to initialize analysis provider: {}", e);
                None
            }
        }
    } else {
        None
    };

    let guards = Guards {
        cost: cost.clone(),
        breakers: breakers.clone(),
        retry: RetryPolicy::new(config.retry.clone()),
        limiter: Arc::new(RateLimiterRegistry::new(config.rate_limits.clone())),
        degradation: degradation.clone(),
        health: Some(health.clone()),
    };
    let gateway = CallGateway::new(
        provider,
        guards,
        config.analysis.max_tokens_per_call,
        config.analysis.temperature,
    );
    let archiver = Arc::new(MemoryArchiver::new());
    let analyzer = MultiStageAnalyzer::new(
        config.analysis.clone(),
        config.scoring.source_weights.clone(),
        gateway,
        archiver.clone(),
    );

    let now = args.now.unwrap_or_else(Utc::now);
    let processed = process_articles(&config, articles, now);

    let ctrl_c_task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("ctrl-c received, cancelling analysis run");
                shutdown.cancel();
            }
        })
    };
    let report = analyzer.run_until_cancelled(processed.clusters, &shutdown).await;
    ctrl_c_task.abort();

    shutdown.cancel();
    if tokio::time::timeout(Duration::from_secs(5), health_task).await.is_err() {
        info!("Timed out waiting for health monitor to exit; continuing shutdown");
    }

    if let Err(e) = storage::save_breaker_snapshots(&db_pool, &breakers.snapshots()).await {
        warn!(%e, "failed to persist circuit breaker state");
    }
    if let Err(e) = storage::append_health_records(&db_pool, &health.aggregate(), Utc::now()).await {
        warn!(%e, "failed to persist health history");
    }
    if let Err(e) = storage::append_level_transitions(&db_pool, &degradation.history()).await {
        warn!(%e, "failed to persist degradation history");
    }

    if let Some(path) = &args.archive_out {
        let records = serde_json::to_vec_pretty(&archiver.records())?;
        tokio::fs::write(path, records)
            .await
            .with_context(|| format!("failed to write archive records to {}", path.display()))?;
        info!(path = %path.display(), "archive records written");
    }

    let output = Output {
        processing: &processed.stats,
        analysis: &report,
        cost: cost.report(),
    };
    println!("{}", serde_json::to_string_pretty(&output)?);

    info!("Shutdown complete");
    Ok(())
}

async fn load_articles(path: &Path) -> Result<Vec<Article>> {
    let data = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read articles file: {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("Failed to parse articles from {}", path.display()))
}

/// Create the analysis provider based on configuration
fn create_llm_provider(
    llm_config: &common::LlmConfig,
    analysis: &common::AnalysisConfig,
) -> anyhow::Result<Box<dyn LlmProvider>> {
    let adapter = llm_config.adapter.as_deref().unwrap_or("none");
    match adapter {
        "remote" => {
            let endpoint_config = llm_config.analysis.as_ref().or(llm_config.remote.as_ref());

            if let Some(remote_config) = endpoint_config {
                // Fetch API key from env var
                let api_key_env = remote_config
                    .api_key_env
                    .as_deref()
                    .ok_or_else(|| anyhow::anyhow!("Missing api_key_env in remote config"))?;

                let api_key = std::env::var(api_key_env)
                    .with_context(|| format!("LLM API key env var '{}' not set", api_key_env))?;

                let model = remote_config.model.clone().unwrap_or_else(|| "gpt-4o-mini".to_string());
                let api_url = remote_config
                    .api_url
                    .clone()
                    .unwrap_or_else(|| "http://localhost:11434/v1/chat/completions".to_string());
                let timeout_secs = remote_config.timeout_seconds.unwrap_or(30);

                let provider = llm::remote::RemoteLlmProvider::new(api_url, api_key, model).with_defaults(
                    timeout_secs,
                    analysis.max_tokens_per_call,
                    analysis.temperature,
                );
                Ok(Box::new(provider))
            } else {
                anyhow::bail!("Remote adapter selected but no analysis endpoint configured")
            }
        }
        "none" => anyhow::bail!("analysis adapter 'none' selected"),
        _ => anyhow::bail!("Unknown LLM adapter type: {}", adapter),
    }
}
