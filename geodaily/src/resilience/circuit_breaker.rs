use chrono::{DateTime, Utc};
use common::CircuitBreakerConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use super::lock;
use crate::error::CallError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Persistable view of one breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub total_calls: u64,
    pub total_failures: u64,
    pub short_circuited: u64,
    pub state_changes: u64,
}

impl BreakerSnapshot {
    pub fn success_rate(&self) -> f64 {
        if self.total_calls == 0 {
            return 1.0;
        }
        1.0 - self.total_failures as f64 / self.total_calls as f64
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    total_calls: u64,
    total_failures: u64,
    short_circuited: u64,
    state_changes: u64,
}

/// Per-endpoint failure isolation state machine.
///
/// CLOSED opens after `failure_threshold` consecutive failures. OPEN rejects calls until
/// `recovery_timeout` has elapsed, then the next call moves it to HALF_OPEN. HALF_OPEN closes
/// after `success_threshold` consecutive successes and reopens on any failure.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    success_threshold: u32,
    recovery_timeout: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: &CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            failure_threshold: config.failure_threshold.max(1),
            success_threshold: config.success_threshold.max(1),
            recovery_timeout: Duration::from_secs(config.recovery_timeout_seconds),
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure: None,
                last_failure_at: None,
                total_calls: 0,
                total_failures: 0,
                short_circuited: 0,
                state_changes: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        lock(&self.inner).state
    }

    /// Admits or rejects a call. Rejection never touches the network.
    pub fn try_acquire(&self) -> Result<(), CallError> {
        let mut inner = lock(&self.inner);
        if inner.state == CircuitState::Open {
            let recovered = inner
                .last_failure
                .map(|at| at.elapsed() >= self.recovery_timeout)
                .unwrap_or(true);
            if !recovered {
                inner.short_circuited += 1;
                return Err(CallError::CircuitOpen {
                    endpoint: self.name.clone(),
                });
            }
            self.transition(&mut inner, CircuitState::HalfOpen);
        }
        inner.total_calls += 1;
        Ok(())
    }

    pub fn record_success(&self) {
        let mut inner = lock(&self.inner);
        match inner.state {
            CircuitState::Closed => inner.failure_count = 0,
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.success_threshold {
                    self.transition(&mut inner, CircuitState::Closed);
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = lock(&self.inner);
        inner.failure_count += 1;
        inner.total_failures += 1;
        inner.last_failure = Some(Instant::now());
        inner.last_failure_at = Some(Utc::now());
        match inner.state {
            CircuitState::Closed if inner.failure_count >= self.failure_threshold => {
                self.transition(&mut inner, CircuitState::Open);
            }
            CircuitState::HalfOpen => self.transition(&mut inner, CircuitState::Open),
            _ => {}
        }
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        inner.state_changes += 1;
        inner.success_count = 0;
        if to == CircuitState::Closed {
            inner.failure_count = 0;
        }
        match to {
            CircuitState::Open => warn!(breaker = %self.name, ?from, failures = inner.failure_count, "circuit opened"),
            _ => info!(breaker = %self.name, ?from, ?to, "circuit state changed"),
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = lock(&self.inner);
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            last_failure_at: inner.last_failure_at,
            total_calls: inner.total_calls,
            total_failures: inner.total_failures,
            short_circuited: inner.short_circuited,
            state_changes: inner.state_changes,
        }
    }

    /// Restores persisted state, mapping the wall-clock failure time onto the monotonic clock.
    pub fn restore(&self, snapshot: &BreakerSnapshot) {
        let mut inner = lock(&self.inner);
        inner.state = snapshot.state;
        inner.failure_count = snapshot.failure_count;
        inner.success_count = snapshot.success_count;
        inner.last_failure_at = snapshot.last_failure_at;
        inner.last_failure = snapshot.last_failure_at.map(|at| {
            let ago = (Utc::now() - at).to_std().unwrap_or_default();
            Instant::now().checked_sub(ago).unwrap_or_else(Instant::now)
        });
        inner.total_calls = snapshot.total_calls;
        inner.total_failures = snapshot.total_failures;
        inner.short_circuited = snapshot.short_circuited;
        inner.state_changes = snapshot.state_changes;
    }

    pub fn reset(&self) {
        let mut inner = lock(&self.inner);
        self.transition(&mut inner, CircuitState::Closed);
        inner.failure_count = 0;
        inner.last_failure = None;
        inner.last_failure_at = None;
    }
}

/// Lazily creates one breaker per endpoint; breakers live as long as the registry.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn get_or_create(&self, endpoint: &str) -> Arc<CircuitBreaker> {
        let mut breakers = lock(&self.breakers);
        breakers
            .entry(endpoint.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(endpoint, &self.config)))
            .clone()
    }

    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let mut snapshots: Vec<BreakerSnapshot> = lock(&self.breakers)
            .values()
            .map(|b| b.snapshot())
            .collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    pub fn restore(&self, snapshots: &[BreakerSnapshot]) {
        for snapshot in snapshots {
            self.get_or_create(&snapshot.name).restore(snapshot);
        }
    }

    pub fn open_circuits(&self) -> Vec<String> {
        let mut open: Vec<String> = lock(&self.breakers)
            .values()
            .filter(|b| b.state() == CircuitState::Open)
            .map(|b| b.name().to_string())
            .collect();
        open.sort();
        open
    }

    pub fn reset_all(&self) {
        for breaker in lock(&self.breakers).values() {
            breaker.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 5,
            recovery_timeout_seconds: 60,
            success_threshold: 3,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_threshold_and_short_circuits() {
        let breaker = CircuitBreaker::new("analysis", &config());
        for _ in 0..5 {
            breaker.try_acquire().expect("closed breaker admits calls");
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        let sixth = breaker.try_acquire();
        assert!(matches!(sixth, Err(CallError::CircuitOpen { .. })));
        assert_eq!(breaker.snapshot().short_circuited, 1);
        assert_eq!(breaker.snapshot().total_calls, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn success_in_closed_resets_consecutive_failures() {
        let breaker = CircuitBreaker::new("analysis", &config());
        for _ in 0..4 {
            breaker.record_failure();
        }
        breaker.record_success();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_closes_after_successes() {
        let breaker = CircuitBreaker::new("analysis", &config());
        for _ in 0..5 {
            breaker.record_failure();
        }
        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(breaker.try_acquire().is_err());

        tokio::time::advance(Duration::from_secs(1)).await;
        breaker.try_acquire().expect("recovery timeout elapsed");
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.record_success();
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("analysis", &config());
        for _ in 0..5 {
            breaker.record_failure();
        }
        tokio::time::advance(Duration::from_secs(61)).await;
        breaker.try_acquire().expect("half-open trial call admitted");
        breaker.record_success();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.try_acquire().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn registry_creates_lazily_and_restores() {
        let registry = CircuitBreakerRegistry::new(config());
        let a = registry.get_or_create("a");
        let again = registry.get_or_create("a");
        assert!(Arc::ptr_eq(&a, &again));
        for _ in 0..5 {
            a.record_failure();
        }
        assert_eq!(registry.open_circuits(), vec!["a".to_string()]);

        let saved = registry.snapshots();
        let fresh = CircuitBreakerRegistry::new(config());
        fresh.restore(&saved);
        assert_eq!(fresh.get_or_create("a").state(), CircuitState::Open);
        assert_eq!(fresh.snapshots(), saved);

        fresh.reset_all();
        assert!(fresh.open_circuits().is_empty());
    }
}
