//! Spend tracking against daily and monthly ceilings.
//!
//! Every analysis call reserves its projected cost before it is made and commits the actual
//! cost afterwards, so concurrent workers cannot jointly overshoot a ceiling.

use anyhow::Result;
use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, TimeZone, Utc};
use common::CostConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

use crate::error::CallError;
use crate::resilience::lock;

/// Price per thousand tokens, input and output billed separately.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricingTable {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

impl From<&CostConfig> for PricingTable {
    fn from(config: &CostConfig) -> Self {
        Self {
            input_per_1k: config.input_cost_per_1k,
            output_per_1k: config.output_cost_per_1k,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TokenCount {
    pub input: u64,
    pub output: u64,
}

impl TokenCount {
    pub fn total(&self) -> u64 {
        self.input + self.output
    }
}

pub fn estimate_cost(tokens: TokenCount, pricing: &PricingTable) -> f64 {
    tokens.input as f64 / 1000.0 * pricing.input_per_1k + tokens.output as f64 / 1000.0 * pricing.output_per_1k
}

/// Rough token count for a prompt: a quarter of its characters, at least 100.
pub fn estimate_tokens(text: &str) -> u64 {
    ((text.chars().count() / 4) as u64).max(100)
}

/// One durable spend record. The id makes appends idempotent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: String,
    pub recorded_at: DateTime<Utc>,
    pub cost: f64,
    pub tokens: u64,
    pub operation: String,
}

/// Durable backing store for the cost ledger.
#[async_trait::async_trait]
pub trait LedgerStore: Send + Sync {
    /// Appends an entry; returns `false` if an entry with the same id already exists.
    async fn append(&self, entry: &LedgerEntry) -> Result<bool>;

    /// Total cost of entries recorded at or after `since`.
    async fn total_since(&self, since: DateTime<Utc>) -> Result<f64>;
}

#[derive(Debug, Default)]
pub struct MemoryLedgerStore {
    entries: Mutex<Vec<LedgerEntry>>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<LedgerEntry> {
        lock(&self.entries).clone()
    }
}

#[async_trait::async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn append(&self, entry: &LedgerEntry) -> Result<bool> {
        let mut entries = lock(&self.entries);
        if entries.iter().any(|e| e.id == entry.id) {
            return Ok(false);
        }
        entries.push(entry.clone());
        Ok(true)
    }

    async fn total_since(&self, since: DateTime<Utc>) -> Result<f64> {
        Ok(lock(&self.entries)
            .iter()
            .filter(|e| e.recorded_at >= since)
            .map(|e| e.cost)
            .sum())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BudgetDecision {
    pub allowed: bool,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetStatus {
    Normal,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CostReport {
    pub date: NaiveDate,
    pub daily_spend: f64,
    pub daily_limit: f64,
    pub daily_usage_percent: f64,
    pub monthly_spend: f64,
    pub monthly_limit: f64,
    pub monthly_usage_percent: f64,
    pub pending: f64,
    pub status: BudgetStatus,
}

/// A charge to record once the call has completed.
#[derive(Debug, Clone, PartialEq)]
pub struct Charge {
    pub id: String,
    pub cost: f64,
    pub tokens: u64,
    pub operation: String,
}

impl Charge {
    pub fn new(cost: f64, tokens: u64, operation: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            cost,
            tokens,
            operation: operation.into(),
        }
    }
}

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Debug)]
struct LedgerState {
    day: NaiveDate,
    month: (i32, u32),
    daily_spend: f64,
    monthly_spend: f64,
    pending: f64,
    daily_alert: BudgetStatus,
    monthly_alert: BudgetStatus,
    charged: HashSet<String>,
}

impl LedgerState {
    /// Zeroes counters whose UTC period has ended.
    fn roll(&mut self, now: DateTime<Utc>) {
        let day = now.date_naive();
        if day != self.day {
            self.day = day;
            self.daily_spend = 0.0;
            self.daily_alert = BudgetStatus::Normal;
        }
        let month = (now.year(), now.month());
        if month != self.month {
            self.month = month;
            self.monthly_spend = 0.0;
            self.monthly_alert = BudgetStatus::Normal;
        }
    }
}

struct CostInner {
    config: CostConfig,
    store: Arc<dyn LedgerStore>,
    clock: Clock,
    state: Mutex<LedgerState>,
}

/// Gates analysis calls on spend ceilings. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct CostController {
    inner: Arc<CostInner>,
}

fn day_start(now: DateTime<Utc>) -> DateTime<Utc> {
    Utc.from_utc_datetime(&now.date_naive().and_time(NaiveTime::MIN))
}

fn month_start(now: DateTime<Utc>) -> DateTime<Utc> {
    let first = NaiveDate::from_ymd_opt(now.year(), now.month(), 1).unwrap_or_else(|| now.date_naive());
    Utc.from_utc_datetime(&first.and_time(NaiveTime::MIN))
}

fn usage_percent(spend: f64, limit: f64) -> f64 {
    if limit <= 0.0 {
        return if spend > 0.0 { 100.0 } else { 0.0 };
    }
    spend / limit * 100.0
}

impl CostController {
    /// Opens the controller, restoring the current day and month totals from the store.
    pub async fn open(config: CostConfig, store: Arc<dyn LedgerStore>) -> Result<Self> {
        Self::open_with_clock(config, store, Arc::new(Utc::now)).await
    }

    pub async fn open_with_clock(config: CostConfig, store: Arc<dyn LedgerStore>, clock: Clock) -> Result<Self> {
        let now = clock();
        let daily_spend = store.total_since(day_start(now)).await?;
        let monthly_spend = store.total_since(month_start(now)).await?;
        info!(daily_spend, monthly_spend, "cost ledger restored");
        let state = LedgerState {
            day: now.date_naive(),
            month: (now.year(), now.month()),
            daily_spend,
            monthly_spend,
            pending: 0.0,
            daily_alert: BudgetStatus::Normal,
            monthly_alert: BudgetStatus::Normal,
            charged: HashSet::new(),
        };
        Ok(Self {
            inner: Arc::new(CostInner {
                config,
                store,
                clock,
                state: Mutex::new(state),
            }),
        })
    }

    pub fn pricing(&self) -> PricingTable {
        PricingTable::from(&self.inner.config)
    }

    fn decide(&self, state: &LedgerState, projected: f64) -> BudgetDecision {
        let config = &self.inner.config;
        let daily = state.daily_spend + state.pending + projected;
        if daily > config.daily_limit {
            return BudgetDecision {
                allowed: false,
                reason: Some(format!(
                    "daily limit ${:.2} would be exceeded (spent ${:.4}, pending ${:.4}, projected ${:.4})",
                    config.daily_limit, state.daily_spend, state.pending, projected
                )),
            };
        }
        let monthly = state.monthly_spend + state.pending + projected;
        if monthly > config.monthly_limit {
            return BudgetDecision {
                allowed: false,
                reason: Some(format!(
                    "monthly limit ${:.2} would be exceeded (spent ${:.4}, pending ${:.4}, projected ${:.4})",
                    config.monthly_limit, state.monthly_spend, state.pending, projected
                )),
            };
        }
        BudgetDecision {
            allowed: true,
            reason: None,
        }
    }

    pub fn check_budget_allowance(&self, projected: f64) -> BudgetDecision {
        let mut state = lock(&self.inner.state);
        state.roll((self.inner.clock)());
        self.decide(&state, projected)
    }

    /// Checks the ceilings and holds `projected` against them in one step.
    pub fn reserve(&self, projected: f64) -> Result<Reservation, CallError> {
        let projected = projected.max(0.0);
        let mut state = lock(&self.inner.state);
        state.roll((self.inner.clock)());
        let decision = self.decide(&state, projected);
        if !decision.allowed {
            let reason = decision.reason.unwrap_or_else(|| "budget exceeded".to_string());
            warn!(%reason, "analysis call denied by budget");
            return Err(CallError::BudgetExceeded { reason });
        }
        state.pending += projected;
        Ok(Reservation {
            controller: self.clone(),
            amount: projected,
            settled: false,
        })
    }

    fn release(&self, amount: f64) {
        let mut state = lock(&self.inner.state);
        state.pending = (state.pending - amount).max(0.0);
    }

    /// Replaces the reservation with the actual charge.
    pub async fn commit(&self, mut reservation: Reservation, charge: Charge) -> Result<bool> {
        let held = reservation.take();
        self.apply(charge, held).await
    }

    pub async fn record_actual_cost(&self, cost: f64, tokens: u64, operation: &str) -> Result<bool> {
        self.record_charge(Charge::new(cost, tokens, operation)).await
    }

    /// Counts the charge against the running totals and appends it to the ledger.
    ///
    /// Duplicate charge ids are ignored. A store failure still counts the spend in memory
    /// before the error is returned.
    pub async fn record_charge(&self, charge: Charge) -> Result<bool> {
        self.apply(charge, 0.0).await
    }

    /// Swaps `held` pending for the charge in one step, then persists it.
    ///
    /// The totals are updated before the first await, so a concurrent `reserve` always sees
    /// either the hold or the spend, and dropping the future mid-append keeps the spend.
    async fn apply(&self, charge: Charge, held: f64) -> Result<bool> {
        let entry = LedgerEntry {
            id: charge.id,
            recorded_at: (self.inner.clock)(),
            cost: charge.cost.max(0.0),
            tokens: charge.tokens,
            operation: charge.operation,
        };
        {
            let mut state = lock(&self.inner.state);
            state.pending = (state.pending - held).max(0.0);
            if !state.charged.insert(entry.id.clone()) {
                info!(charge_id = %entry.id, "duplicate charge ignored");
                return Ok(false);
            }
            state.roll(entry.recorded_at);
            state.daily_spend += entry.cost;
            state.monthly_spend += entry.cost;
            self.check_alerts(&mut state);
        }
        let appended = self.inner.store.append(&entry).await;
        if let Ok(false) = appended {
            // Already in the durable ledger, so it was restored when the controller opened.
            let mut state = lock(&self.inner.state);
            state.roll((self.inner.clock)());
            if state.day == entry.recorded_at.date_naive() {
                state.daily_spend = (state.daily_spend - entry.cost).max(0.0);
            }
            if state.month == (entry.recorded_at.year(), entry.recorded_at.month()) {
                state.monthly_spend = (state.monthly_spend - entry.cost).max(0.0);
            }
            info!(charge_id = %entry.id, "duplicate charge ignored");
        }
        appended
    }

    fn check_alerts(&self, state: &mut LedgerState) {
        let config = &self.inner.config;
        let classify = |percent: f64| {
            if percent >= 100.0 {
                BudgetStatus::Critical
            } else if percent >= config.alert_threshold_percent {
                BudgetStatus::Warning
            } else {
                BudgetStatus::Normal
            }
        };
        let daily_percent = usage_percent(state.daily_spend, config.daily_limit);
        let daily = classify(daily_percent);
        if daily > state.daily_alert {
            state.daily_alert = daily;
            alert("daily", daily, daily_percent, state.daily_spend, config.daily_limit);
        }
        let monthly_percent = usage_percent(state.monthly_spend, config.monthly_limit);
        let monthly = classify(monthly_percent);
        if monthly > state.monthly_alert {
            state.monthly_alert = monthly;
            alert("monthly", monthly, monthly_percent, state.monthly_spend, config.monthly_limit);
        }
    }

    pub fn report(&self) -> CostReport {
        let config = &self.inner.config;
        let mut state = lock(&self.inner.state);
        state.roll((self.inner.clock)());
        let daily_usage_percent = usage_percent(state.daily_spend, config.daily_limit);
        let monthly_usage_percent = usage_percent(state.monthly_spend, config.monthly_limit);
        let peak = daily_usage_percent.max(monthly_usage_percent);
        let status = if peak >= 100.0 {
            BudgetStatus::Critical
        } else if peak >= config.alert_threshold_percent {
            BudgetStatus::Warning
        } else {
            BudgetStatus::Normal
        };
        CostReport {
            date: state.day,
            daily_spend: state.daily_spend,
            daily_limit: config.daily_limit,
            daily_usage_percent,
            monthly_spend: state.monthly_spend,
            monthly_limit: config.monthly_limit,
            monthly_usage_percent,
            pending: state.pending,
            status,
        }
    }
}

fn alert(period: &str, status: BudgetStatus, percent: f64, spend: f64, limit: f64) {
    match status {
        BudgetStatus::Critical => error!(period, percent, spend, limit, "cost limit reached"),
        BudgetStatus::Warning => warn!(period, percent, spend, limit, "cost alert threshold crossed"),
        BudgetStatus::Normal => {}
    }
}

/// Projected spend held against the ceilings. Dropping it unsettled releases the hold.
pub struct Reservation {
    controller: CostController,
    amount: f64,
    settled: bool,
}

impl Reservation {
    /// Marks the hold settled and returns the amount still to release.
    fn take(&mut self) -> f64 {
        if self.settled {
            return 0.0;
        }
        self.settled = true;
        self.amount
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        let amount = self.take();
        if amount > 0.0 {
            self.controller.release(amount);
        }
    }
}
