use std::sync::Arc;

use common::{CircuitBreakerConfig, CostConfig, RateLimitsConfig, RetryConfig};
use geodaily::analysis::{CallGateway, Guards};
use geodaily::cost::{CostController, MemoryLedgerStore};
use geodaily::error::{CallError, FallbackReason};
use geodaily::llm::remote::RemoteLlmProvider;
use geodaily::llm::{LlmError, LlmProvider, LlmRequest};
use geodaily::resilience::{
    CircuitBreakerRegistry, GracefulDegradationManager, RateLimiterRegistry, RetryPolicy,
};

const OK_BODY: &str = r#"{
    "model": "gpt-4o-mini",
    "choices": [{
        "message": {
            "role": "assistant",
            "content": "This is a test response"
        },
        "finish_reason": "stop"
    }],
    "usage": {
        "prompt_tokens": 10,
        "completion_tokens": 5,
        "total_tokens": 15
    }
}"#;

async fn gateway(provider: RemoteLlmProvider) -> (CallGateway, Arc<CircuitBreakerRegistry>, CostController) {
    let cost = CostController::open(CostConfig::default(), Arc::new(MemoryLedgerStore::new()))
        .await
        .unwrap();
    let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default()));
    let guards = Guards {
        cost: cost.clone(),
        breakers: breakers.clone(),
        retry: RetryPolicy::new(RetryConfig {
            max_attempts: 3,
            base_delay_ms: 1,
            jitter: false,
            ..RetryConfig::default()
        }),
        limiter: Arc::new(RateLimiterRegistry::new(RateLimitsConfig::default())),
        degradation: Arc::new(GracefulDegradationManager::new()),
        health: None,
    };
    let provider: Arc<dyn LlmProvider> = Arc::new(provider);
    (CallGateway::new(Some(provider), guards, 100, 0.3), breakers, cost)
}

#[tokio::test]
async fn test_remote_provider_with_mock() {
    let mut server = mockito::Server::new_async().await;

    // Mock successful OpenAI response
    let mock = server
        .mock("POST", "/")
        .match_header("authorization", "Bearer fake-api-key")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(OK_BODY)
        .create_async()
        .await;

    let provider = RemoteLlmProvider::new(server.url(), "fake-api-key", "gpt-4o-mini");

    let request = LlmRequest {
        prompt: "Test prompt".to_string(),
        max_tokens: Some(100),
        temperature: Some(0.7),
        timeout_seconds: Some(10),
    };

    let result = provider.generate(request).await;

    assert!(result.is_ok());
    let response = result.unwrap();
    assert_eq!(response.content, "This is a test response");
    assert_eq!(response.usage.prompt_tokens, 10);
    assert_eq!(response.usage.completion_tokens, 5);
    assert_eq!(response.usage.total_tokens, 15);
    assert_eq!(response.model, "gpt-4o-mini");

    mock.assert_async().await;
}

#[tokio::test]
async fn test_remote_provider_without_usage_block() {
    let mut server = mockito::Server::new_async().await;

    let mock = server
        .mock("POST", "/")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"choices": [{"message": {"role": "assistant", "content": "{\"overall\": 7}"}}]}"#)
        .create_async()
        .await;

    let provider = RemoteLlmProvider::new(server.url(), "fake-api-key", "gpt-4o-mini");
    let request = LlmRequest {
        prompt: "Test".to_string(),
        max_tokens: None,
        temperature: None,
        timeout_seconds: None,
    };

    let response = provider.generate(request).await.unwrap();
    assert_eq!(response.content, "{\"overall\": 7}");
    assert_eq!(response.usage.total_tokens, 0);
    assert_eq!(response.model, "gpt-4o-mini");

    mock.assert_async().await;
}

#[tokio::test]
async fn test_remote_provider_error_handling() {
    let mut server = mockito::Server::new_async().await;

    // Mock API error
    let mock = server
        .mock("POST", "/")
        .with_status(429)
        .with_header("content-type", "application/json")
        .with_body(r#"{"error": {"message": "Rate limit exceeded"}}"#)
        .create_async()
        .await;

    let provider = RemoteLlmProvider::new(server.url(), "fake-api-key", "gpt-4o-mini");

    let request = LlmRequest {
        prompt: "Test".to_string(),
        max_tokens: None,
        temperature: None,
        timeout_seconds: None,
    };

    let result = provider.generate(request).await;

    assert!(result.is_err());
    let err = result.unwrap_err();
    assert!(err.to_string().contains("429"));
    assert!(err.is_retryable());

    mock.assert_async().await;
}

#[tokio::test]
async fn test_remote_provider_timeout() {
    let mut server = mockito::Server::new_async().await;

    // Mock slow response
    let _mock = server
        .mock("POST", "/")
        .with_status(200)
        .with_chunked_body(|w| {
            std::thread::sleep(std::time::Duration::from_secs(3));
            w.write_all(b"too late")
        })
        .create_async()
        .await;

    let provider = RemoteLlmProvider::new(server.url(), "fake-api-key", "gpt-4o-mini");

    let request = LlmRequest {
        prompt: "Test".to_string(),
        max_tokens: None,
        temperature: None,
        timeout_seconds: Some(1), // 1 second timeout
    };

    let result = provider.generate(request).await;

    assert!(result.is_err());
    let err = result.unwrap_err();
    assert!(matches!(err, LlmError::Timeout));
    assert!(err.to_string().contains("timed out"));
}

#[tokio::test]
async fn test_gateway_retries_server_errors_then_gives_up() {
    let mut server = mockito::Server::new_async().await;

    let mock = server
        .mock("POST", "/")
        .with_status(503)
        .with_body("upstream unavailable")
        .expect(3)
        .create_async()
        .await;

    let provider = RemoteLlmProvider::new(server.url(), "fake-api-key", "gpt-4o-mini");
    let (gateway, breakers, cost) = gateway(provider).await;

    let result = gateway.call("relevance_screening", "Test".to_string()).await;
    match result {
        Err(FallbackReason::Call(CallError::TransientIo { endpoint, message })) => {
            assert_eq!(endpoint, "analysis");
            assert!(message.contains("503"));
        }
        other => panic!("expected transient failure, got {:?}", other),
    }
    // Retries count as one call for the breaker and nothing is charged
    assert_eq!(breakers.get_or_create("analysis").snapshot().failure_count, 1);
    assert_eq!(cost.report().daily_spend, 0.0);

    mock.assert_async().await;
}

#[tokio::test]
async fn test_gateway_does_not_retry_client_errors() {
    let mut server = mockito::Server::new_async().await;

    let mock = server
        .mock("POST", "/")
        .with_status(400)
        .with_body("bad request")
        .expect(1)
        .create_async()
        .await;

    let provider = RemoteLlmProvider::new(server.url(), "fake-api-key", "gpt-4o-mini");
    let (gateway, _breakers, _cost) = gateway(provider).await;

    let result = gateway.call("category_analysis", "Test".to_string()).await;
    assert!(matches!(
        result,
        Err(FallbackReason::Call(CallError::NonRetryable { .. }))
    ));

    mock.assert_async().await;
}

#[tokio::test]
async fn test_gateway_charges_successful_calls() {
    let mut server = mockito::Server::new_async().await;

    // The gateway's per-call ceiling is the only token setting sent upstream
    let mock = server
        .mock("POST", "/")
        .match_body(mockito::Matcher::PartialJson(serde_json::json!({"max_tokens": 100})))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(OK_BODY)
        .create_async()
        .await;

    let provider = RemoteLlmProvider::new(server.url(), "fake-api-key", "gpt-4o-mini").with_defaults(30, 4000, 0.3);
    let (gateway, breakers, cost) = gateway(provider).await;

    let success = gateway.call("content_generation", "Test".to_string()).await.unwrap();
    assert_eq!(success.content, "This is a test response");
    assert_eq!(success.tokens, 15);
    assert!(success.cost > 0.0);
    assert!((cost.report().daily_spend - success.cost).abs() < 1e-12);
    assert_eq!(breakers.get_or_create("analysis").snapshot().failure_count, 0);

    mock.assert_async().await;
}
