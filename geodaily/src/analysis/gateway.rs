use std::sync::Arc;
use tracing::{debug, warn};

use crate::cost::{estimate_cost, estimate_tokens, Charge, CostController, TokenCount};
use crate::error::{CallError, FallbackReason};
use crate::llm::{LlmProvider, LlmRequest};
use crate::resilience::{
    CircuitBreakerRegistry, GracefulDegradationManager, HealthMonitor, RateLimiterRegistry, RetryPolicy,
};

/// A completed call and what it cost.
#[derive(Debug, Clone, PartialEq)]
pub struct CallSuccess {
    pub content: String,
    pub cost: f64,
    pub tokens: u64,
}

/// Shared resilience and budget state the gateway consults on every call.
#[derive(Clone)]
pub struct Guards {
    pub cost: CostController,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub retry: RetryPolicy,
    pub limiter: Arc<RateLimiterRegistry>,
    pub degradation: Arc<GracefulDegradationManager>,
    pub health: Option<Arc<HealthMonitor>>,
}

/// Single path for every external analysis call.
///
/// Order: degradation check, budget reservation, circuit breaker, retry loop, rate limiter,
/// provider. Rate limiting and budget denials are not counted as endpoint failures.
pub struct CallGateway {
    provider: Option<Arc<dyn LlmProvider>>,
    guards: Guards,
    max_tokens: usize,
    temperature: f32,
}

impl CallGateway {
    pub fn new(provider: Option<Arc<dyn LlmProvider>>, guards: Guards, max_tokens: usize, temperature: f32) -> Self {
        Self {
            provider,
            guards,
            max_tokens,
            temperature,
        }
    }

    pub async fn call(&self, operation: &str, prompt: String) -> Result<CallSuccess, FallbackReason> {
        let provider = self.provider.as_ref().ok_or(FallbackReason::NoProvider)?;
        let endpoint = provider.endpoint().to_string();

        if self.guards.degradation.should_fallback(&endpoint) {
            return Err(CallError::Unavailable { component: endpoint }.into());
        }

        let pricing = self.guards.cost.pricing();
        let input_estimate = estimate_tokens(&prompt);
        let projected = estimate_cost(
            TokenCount {
                input: input_estimate,
                output: self.max_tokens as u64,
            },
            &pricing,
        );
        let reservation = self.guards.cost.reserve(projected)?;

        let breaker = self.guards.breakers.get_or_create(&endpoint);
        breaker.try_acquire()?;

        let request = LlmRequest {
            prompt,
            max_tokens: Some(self.max_tokens),
            temperature: Some(self.temperature),
            timeout_seconds: None,
        };
        let limiter = &self.guards.limiter;
        let provider = provider.as_ref();
        let (request, endpoint_ref) = (&request, endpoint.as_str());
        let result = self
            .guards
            .retry
            .run(operation, move || async move {
                limiter.try_acquire(endpoint_ref)?;
                provider
                    .generate(request.clone())
                    .await
                    .map_err(|e| CallError::from_llm(endpoint_ref, e))
            })
            .await;

        match result {
            Ok(response) => {
                breaker.record_success();
                if let Some(health) = &self.guards.health {
                    health.record_success(&endpoint);
                }
                let tokens = if response.usage.total_tokens > 0 {
                    TokenCount {
                        input: response.usage.prompt_tokens as u64,
                        output: response.usage.completion_tokens as u64,
                    }
                } else {
                    TokenCount {
                        input: input_estimate,
                        output: estimate_tokens(&response.content),
                    }
                };
                let actual = estimate_cost(tokens, &pricing);
                let charged = tokens.total().max(response.usage.total_tokens as u64);
                if let Err(e) = self
                    .guards
                    .cost
                    .commit(reservation, Charge::new(actual, charged, operation))
                    .await
                {
                    warn!(operation, error = %e, "failed to persist cost ledger entry");
                }
                debug!(operation, cost = actual, tokens = charged, model = %response.model, "analysis call succeeded");
                Ok(CallSuccess {
                    content: response.content,
                    cost: actual,
                    tokens: charged,
                })
            }
            Err(e @ CallError::RateLimitExceeded { .. }) => {
                debug!(operation, error = %e, "analysis call rate limited");
                Err(e.into())
            }
            Err(e) => {
                breaker.record_failure();
                if let Some(health) = &self.guards.health {
                    health.record_failure(&endpoint, &e.to_string());
                }
                warn!(operation, error = %e, "analysis call failed");
                Err(e.into())
            }
        }
    }
}
