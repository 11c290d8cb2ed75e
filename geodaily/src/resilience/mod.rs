//! Failure isolation around every external call the engine makes.

pub mod circuit_breaker;
pub mod degradation;
pub mod health;
pub mod rate_limiter;
pub mod retry;

pub use circuit_breaker::{BreakerSnapshot, CircuitBreaker, CircuitBreakerRegistry, CircuitState};
pub use degradation::{GracefulDegradationManager, ServiceLevel};
pub use health::{HealthMonitor, HealthRecord};
pub use rate_limiter::RateLimiterRegistry;
pub use retry::{RetryPolicy, Retryable};

use std::sync::{Mutex, MutexGuard};

/// Locks a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
