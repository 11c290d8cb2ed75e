use thiserror::Error;

use crate::llm::LlmError;
use crate::models::Provenance;
use crate::resilience::retry::Retryable;

/// Why a guarded call to the analysis service did not produce a response.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CallError {
    #[error("transient failure calling {endpoint}: {message}")]
    TransientIo { endpoint: String, message: String },

    #[error("non-retryable failure calling {endpoint}: {message}")]
    NonRetryable { endpoint: String, message: String },

    #[error("budget exceeded: {reason}")]
    BudgetExceeded { reason: String },

    #[error("circuit open for {endpoint}")]
    CircuitOpen { endpoint: String },

    #[error("rate limit exceeded for {endpoint}")]
    RateLimitExceeded { endpoint: String },

    #[error("{component} is unavailable")]
    Unavailable { component: String },
}

impl CallError {
    pub fn from_llm(endpoint: &str, err: LlmError) -> Self {
        if err.is_retryable() {
            CallError::TransientIo {
                endpoint: endpoint.to_string(),
                message: err.to_string(),
            }
        } else {
            CallError::NonRetryable {
                endpoint: endpoint.to_string(),
                message: err.to_string(),
            }
        }
    }

    /// Rate limiting is an expected local condition; everything else degrades the result.
    pub fn provenance(&self) -> Provenance {
        match self {
            CallError::RateLimitExceeded { .. } => Provenance::Mock,
            _ => Provenance::Degraded,
        }
    }
}

impl Retryable for CallError {
    fn is_retryable(&self) -> bool {
        matches!(self, CallError::TransientIo { .. })
    }
}

/// Reason a stage used its heuristic generator instead of a real response.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FallbackReason {
    #[error("no analysis provider configured")]
    NoProvider,

    #[error(transparent)]
    Call(#[from] CallError),

    #[error("malformed response: {0}")]
    Malformed(String),
}

impl FallbackReason {
    pub fn provenance(&self) -> Provenance {
        match self {
            FallbackReason::NoProvider => Provenance::Mock,
            FallbackReason::Call(e) => e.provenance(),
            FallbackReason::Malformed(_) => Provenance::Degraded,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn llm_errors_map_to_retryability() {
        let transient = CallError::from_llm("analysis", LlmError::Timeout);
        assert!(transient.is_retryable());

        let throttled = CallError::from_llm(
            "analysis",
            LlmError::Status {
                status: 429,
                body: "slow down".into(),
            },
        );
        assert!(throttled.is_retryable());

        let auth = CallError::from_llm(
            "analysis",
            LlmError::Status {
                status: 401,
                body: "bad key".into(),
            },
        );
        assert!(!auth.is_retryable());
        assert!(matches!(auth, CallError::NonRetryable { .. }));
    }

    #[test]
    fn fallback_reasons_carry_provenance() {
        assert_eq!(FallbackReason::NoProvider.provenance(), Provenance::Mock);
        let limited: FallbackReason = CallError::RateLimitExceeded {
            endpoint: "analysis".into(),
        }
        .into();
        assert_eq!(limited.provenance(), Provenance::Mock);
        let open: FallbackReason = CallError::CircuitOpen {
            endpoint: "analysis".into(),
        }
        .into();
        assert_eq!(open.provenance(), Provenance::Degraded);
        assert_eq!(
            FallbackReason::Malformed("no json".into()).provenance(),
            Provenance::Degraded
        );
    }
}
