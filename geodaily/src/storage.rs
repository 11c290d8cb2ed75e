use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tracing::{info, warn};

use crate::cost::{LedgerEntry, LedgerStore};
use crate::resilience::degradation::LevelTransition;
use crate::resilience::{BreakerSnapshot, HealthRecord};

/// Ensure the ledger, breaker and health tables exist. Idempotent and safe to call at startup.
pub async fn ensure_schema(pool: &SqlitePool) -> Result<()> {
    info!("storage: ensuring DB schema (CREATE TABLE IF NOT EXISTS ...)");
    let stmts = [
        r#"
        CREATE TABLE IF NOT EXISTS cost_ledger (
            id TEXT PRIMARY KEY,
            recorded_at INTEGER NOT NULL,
            cost REAL NOT NULL,
            tokens INTEGER NOT NULL,
            operation TEXT NOT NULL
        );
        "#,
        "CREATE INDEX IF NOT EXISTS idx_cost_ledger_recorded_at ON cost_ledger (recorded_at);",
        r#"
        CREATE TABLE IF NOT EXISTS breaker_state (
            name TEXT PRIMARY KEY,
            snapshot_json TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        );
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS health_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source TEXT NOT NULL,
            record_json TEXT NOT NULL,
            recorded_at INTEGER NOT NULL
        );
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS degradation_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            component TEXT NOT NULL,
            transition_json TEXT NOT NULL,
            recorded_at INTEGER NOT NULL
        );
        "#,
    ];
    for stmt in stmts {
        sqlx::query(stmt)
            .execute(pool)
            .await
            .context("failed to create storage schema")?;
    }
    Ok(())
}

/// Cost ledger persisted in SQLite; timestamps are stored as UTC epoch milliseconds.
#[derive(Clone)]
pub struct SqliteLedgerStore {
    pool: SqlitePool,
}

impl SqliteLedgerStore {
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        ensure_schema(&pool).await?;
        Ok(Self { pool })
    }
}

#[async_trait::async_trait]
impl LedgerStore for SqliteLedgerStore {
    async fn append(&self, entry: &LedgerEntry) -> Result<bool> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO cost_ledger (id, recorded_at, cost, tokens, operation) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&entry.id)
        .bind(entry.recorded_at.timestamp_millis())
        .bind(entry.cost)
        .bind(entry.tokens as i64)
        .bind(&entry.operation)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to append ledger entry {}", entry.id))?;
        Ok(result.rows_affected() == 1)
    }

    async fn total_since(&self, since: DateTime<Utc>) -> Result<f64> {
        let total = sqlx::query_scalar::<_, f64>(
            "SELECT COALESCE(SUM(cost), 0.0) FROM cost_ledger WHERE recorded_at >= ?",
        )
        .bind(since.timestamp_millis())
        .fetch_one(&self.pool)
        .await
        .context("failed to sum ledger entries")?;
        Ok(total)
    }
}

pub async fn save_breaker_snapshots(pool: &SqlitePool, snapshots: &[BreakerSnapshot]) -> Result<()> {
    let now = Utc::now().timestamp_millis();
    for snapshot in snapshots {
        let json = serde_json::to_string(snapshot).context("failed to serialize breaker snapshot")?;
        sqlx::query(
            "INSERT OR REPLACE INTO breaker_state (name, snapshot_json, updated_at) VALUES (?, ?, ?)",
        )
        .bind(&snapshot.name)
        .bind(&json)
        .bind(now)
        .execute(pool)
        .await
        .with_context(|| format!("failed to save breaker {}", snapshot.name))?;
    }
    Ok(())
}

/// Loads saved breaker snapshots, skipping rows that no longer decode.
pub async fn load_breaker_snapshots(pool: &SqlitePool) -> Result<Vec<BreakerSnapshot>> {
    let rows = sqlx::query("SELECT name, snapshot_json FROM breaker_state ORDER BY name")
        .fetch_all(pool)
        .await
        .context("failed to load breaker snapshots")?;
    let mut snapshots = Vec::with_capacity(rows.len());
    for row in rows {
        let name: String = row.get("name");
        let json: String = row.get("snapshot_json");
        match serde_json::from_str::<BreakerSnapshot>(&json) {
            Ok(snapshot) => snapshots.push(snapshot),
            Err(e) => warn!(breaker = %name, error = %e, "skipping unreadable breaker snapshot"),
        }
    }
    Ok(snapshots)
}

/// Appends one row per health record; earlier rows are never rewritten.
pub async fn append_health_records(pool: &SqlitePool, records: &[HealthRecord], at: DateTime<Utc>) -> Result<()> {
    for record in records {
        let json = serde_json::to_string(record).context("failed to serialize health record")?;
        sqlx::query("INSERT INTO health_history (source, record_json, recorded_at) VALUES (?, ?, ?)")
            .bind(&record.source)
            .bind(&json)
            .bind(at.timestamp_millis())
            .execute(pool)
            .await
            .with_context(|| format!("failed to append health record for {}", record.source))?;
    }
    Ok(())
}

/// Health records for `source` in the order they were appended.
pub async fn load_health_history(pool: &SqlitePool, source: &str) -> Result<Vec<HealthRecord>> {
    let rows = sqlx::query("SELECT record_json FROM health_history WHERE source = ? ORDER BY id")
        .bind(source)
        .fetch_all(pool)
        .await
        .context("failed to load health history")?;
    let mut records = Vec::with_capacity(rows.len());
    for row in rows {
        let json: String = row.get("record_json");
        match serde_json::from_str::<HealthRecord>(&json) {
            Ok(record) => records.push(record),
            Err(e) => warn!(source, error = %e, "skipping unreadable health record"),
        }
    }
    Ok(records)
}

pub async fn append_level_transitions(pool: &SqlitePool, transitions: &[LevelTransition]) -> Result<()> {
    for transition in transitions {
        let json = serde_json::to_string(transition).context("failed to serialize level transition")?;
        sqlx::query("INSERT INTO degradation_history (component, transition_json, recorded_at) VALUES (?, ?, ?)")
            .bind(&transition.component)
            .bind(&json)
            .bind(transition.at.timestamp_millis())
            .execute(pool)
            .await
            .with_context(|| format!("failed to append level transition for {}", transition.component))?;
    }
    Ok(())
}

pub async fn load_level_transitions(pool: &SqlitePool) -> Result<Vec<LevelTransition>> {
    let rows = sqlx::query("SELECT transition_json FROM degradation_history ORDER BY id")
        .fetch_all(pool)
        .await
        .context("failed to load degradation history")?;
    rows.iter()
        .map(|row| {
            let json: String = row.get("transition_json");
            serde_json::from_str(&json).context("failed to decode level transition")
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::{CircuitState, GracefulDegradationManager, ServiceLevel};
    use chrono::TimeZone;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn memory_pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("memory pool")
    }

    fn entry(id: &str, at: DateTime<Utc>, cost: f64) -> LedgerEntry {
        LedgerEntry {
            id: id.to_string(),
            recorded_at: at,
            cost,
            tokens: 120,
            operation: "relevance_screening".to_string(),
        }
    }

    #[tokio::test]
    async fn ledger_append_is_idempotent_and_sums_by_time() {
        let store = SqliteLedgerStore::new(memory_pool().await).await.expect("store");
        let morning = Utc.with_ymd_and_hms(2024, 4, 2, 8, 0, 0).unwrap();
        let yesterday = Utc.with_ymd_and_hms(2024, 4, 1, 22, 0, 0).unwrap();

        assert!(store.append(&entry("a", yesterday, 0.5)).await.expect("append"));
        assert!(store.append(&entry("b", morning, 0.25)).await.expect("append"));
        assert!(!store.append(&entry("b", morning, 0.25)).await.expect("duplicate"));

        let day_start = Utc.with_ymd_and_hms(2024, 4, 2, 0, 0, 0).unwrap();
        let month_start = Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap();
        assert_eq!(store.total_since(day_start).await.expect("sum"), 0.25);
        assert_eq!(store.total_since(month_start).await.expect("sum"), 0.75);
    }

    #[tokio::test]
    async fn empty_ledger_sums_to_zero() {
        let store = SqliteLedgerStore::new(memory_pool().await).await.expect("store");
        let since = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(store.total_since(since).await.expect("sum"), 0.0);
    }

    #[tokio::test]
    async fn breaker_snapshots_round_trip_through_sqlite() {
        let pool = memory_pool().await;
        ensure_schema(&pool).await.expect("schema");
        let snapshot = BreakerSnapshot {
            name: "analysis".to_string(),
            state: CircuitState::Open,
            failure_count: 5,
            success_count: 0,
            last_failure_at: Some(Utc.with_ymd_and_hms(2024, 4, 2, 8, 0, 0).unwrap()),
            total_calls: 9,
            total_failures: 6,
            short_circuited: 2,
            state_changes: 1,
        };
        save_breaker_snapshots(&pool, &[snapshot.clone()]).await.expect("save");
        save_breaker_snapshots(&pool, &[snapshot.clone()]).await.expect("save again");

        sqlx::query("INSERT INTO breaker_state (name, snapshot_json, updated_at) VALUES ('broken', 'not json', 0)")
            .execute(&pool)
            .await
            .expect("insert garbage");

        let loaded = load_breaker_snapshots(&pool).await.expect("load");
        assert_eq!(loaded, vec![snapshot]);
    }

    #[tokio::test]
    async fn health_history_is_appended_not_replaced() {
        let pool = memory_pool().await;
        ensure_schema(&pool).await.expect("schema");
        let record = |score: f64, level: ServiceLevel| HealthRecord {
            source: "analysis".to_string(),
            score,
            success_rate: score,
            samples: 5,
            consecutive_failures: 0,
            level,
            last_error: None,
        };
        let first = record(0.9, ServiceLevel::Healthy);
        let second = record(0.2, ServiceLevel::Unavailable);
        let morning = Utc.with_ymd_and_hms(2024, 4, 2, 8, 0, 0).unwrap();
        append_health_records(&pool, &[first.clone()], morning).await.expect("append");
        append_health_records(&pool, &[second.clone()], morning + chrono::Duration::minutes(1))
            .await
            .expect("append again");

        let history = load_health_history(&pool, "analysis").await.expect("load");
        assert_eq!(history, vec![first, second]);
        assert!(load_health_history(&pool, "feed-a").await.expect("load").is_empty());
    }

    #[tokio::test]
    async fn level_transitions_survive_in_order() {
        let pool = memory_pool().await;
        ensure_schema(&pool).await.expect("schema");
        let manager = GracefulDegradationManager::new();
        manager.set_level("analysis", ServiceLevel::Degraded, "health score 0.50");
        manager.set_level("analysis", ServiceLevel::Unavailable, "health score 0.10");

        append_level_transitions(&pool, &manager.history()).await.expect("append");
        let loaded = load_level_transitions(&pool).await.expect("load");
        assert_eq!(loaded, manager.history());
        assert_eq!(loaded[1].to, ServiceLevel::Unavailable);
    }
}
