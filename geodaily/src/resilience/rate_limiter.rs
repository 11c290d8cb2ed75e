use common::{RateLimitConfig, RateLimitsConfig};
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

use super::lock;
use crate::error::CallError;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// One limiter per endpoint, created on first use from the configured limits.
pub struct RateLimiterRegistry {
    limits: RateLimitsConfig,
    limiters: Mutex<HashMap<String, Arc<DirectLimiter>>>,
}

impl RateLimiterRegistry {
    pub fn new(limits: RateLimitsConfig) -> Self {
        Self {
            limits,
            limiters: Mutex::new(HashMap::new()),
        }
    }

    fn limiter(&self, endpoint: &str) -> Arc<DirectLimiter> {
        let mut limiters = lock(&self.limiters);
        if let Some(limiter) = limiters.get(endpoint) {
            return limiter.clone();
        }
        let limiter = Arc::new(RateLimiter::direct(quota(self.limits.for_endpoint(endpoint))));
        limiters.insert(endpoint.to_string(), limiter.clone());
        limiter
    }

    /// Fails fast when the endpoint has no capacity left in the current window.
    pub fn try_acquire(&self, endpoint: &str) -> Result<(), CallError> {
        match self.limiter(endpoint).check() {
            Ok(_) => Ok(()),
            Err(_) => {
                debug!(endpoint, "rate limit reached");
                Err(CallError::RateLimitExceeded {
                    endpoint: endpoint.to_string(),
                })
            }
        }
    }

    /// Waits until the endpoint has capacity.
    pub async fn acquire(&self, endpoint: &str) {
        let limiter = self.limiter(endpoint);
        limiter.until_ready().await;
    }
}

/// `capacity` permits per window, replenished evenly, with the full capacity available as burst.
fn quota(limit: RateLimitConfig) -> Quota {
    let capacity = NonZeroU32::new(limit.capacity).unwrap_or(NonZeroU32::MIN);
    let period = Duration::from_secs(limit.window_seconds.max(1)) / capacity.get();
    match Quota::with_period(period) {
        Some(quota) => quota.allow_burst(capacity),
        None => Quota::per_second(capacity),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn registry(capacity: u32, window_seconds: u64) -> RateLimiterRegistry {
        let mut limits = RateLimitsConfig::default();
        limits.endpoints.insert(
            "analysis".to_string(),
            RateLimitConfig {
                capacity,
                window_seconds,
            },
        );
        RateLimiterRegistry::new(limits)
    }

    #[test]
    fn try_acquire_fails_fast_beyond_capacity() {
        let registry = registry(2, 60);
        assert!(registry.try_acquire("analysis").is_ok());
        assert!(registry.try_acquire("analysis").is_ok());
        assert!(matches!(
            registry.try_acquire("analysis"),
            Err(CallError::RateLimitExceeded { .. })
        ));
        // Other endpoints use the default limit and are unaffected
        assert!(registry.try_acquire("collector").is_ok());
    }

    #[tokio::test]
    async fn acquire_waits_for_replenishment() {
        let registry = registry(10, 1);
        for _ in 0..10 {
            registry.try_acquire("analysis").expect("burst capacity");
        }
        let started = Instant::now();
        registry.acquire("analysis").await;
        assert!(started.elapsed() >= Duration::from_millis(50));
    }
}
