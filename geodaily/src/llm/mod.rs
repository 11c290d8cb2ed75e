use thiserror::Error;

/// Core trait for analysis service providers
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    /// Name used to key breakers, rate limits and health for this provider
    fn endpoint(&self) -> &str;

    /// Generate completion for a given prompt
    async fn generate(&self, request: LlmRequest) -> Result<LlmResponse, LlmError>;
}

/// Request structure for LLM generation
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub prompt: String,
    pub max_tokens: Option<usize>,
    pub temperature: Option<f32>,
    pub timeout_seconds: Option<u64>,
}

/// Response from LLM generation
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub content: String,
    pub usage: UsageMetadata,
    pub model: String,
}

/// Token usage metadata
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UsageMetadata {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

#[derive(Error, Debug)]
pub enum LlmError {
    #[error("LLM request timed out")]
    Timeout,

    #[error("LLM HTTP request failed: {0}")]
    Connection(String),

    #[error("LLM API error {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Failed to parse LLM response: {0}")]
    Malformed(String),
}

impl LlmError {
    /// Timeouts, connection failures, throttling and server errors are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::Timeout | LlmError::Connection(_) => true,
            LlmError::Status { status, .. } => *status == 429 || *status >= 500,
            LlmError::Malformed(_) => false,
        }
    }
}

pub mod remote;

/// Helper to extract JSON from text that might contain markdown backticks or preamble
pub fn extract_json_from_text(text: &str) -> Option<String> {
    // 1. Try to find content between ```json and ```
    if let Some(start) = text.find("```json") {
        let rest = &text[start + 7..];
        if let Some(end) = rest.find("```") {
            return Some(rest[..end].trim().to_string());
        }
    }

    // 2. Try to find content between ``` and ```
    if let Some(start) = text.find("```") {
        let rest = &text[start + 3..];
        if let Some(end) = rest.find("```") {
            return Some(rest[..end].trim().to_string());
        }
    }

    // 3. Try to find the first '{' and last '}'
    if let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) {
        if start < end {
            return Some(text[start..=end].to_string());
        }
    }

    None
}

/// Extracts and deserializes the JSON object embedded in a model reply.
pub fn parse_json_reply<T: serde::de::DeserializeOwned>(text: &str) -> Result<T, String> {
    let cleaned = extract_json_from_text(text).ok_or_else(|| "no JSON object in reply".to_string())?;
    serde_json::from_str(&cleaned).map_err(|e| format!("invalid JSON reply: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_fenced_and_bare_json() {
        assert_eq!(
            extract_json_from_text("Here:\n```json\n{\"a\": 1}\n```").as_deref(),
            Some("{\"a\": 1}")
        );
        assert_eq!(
            extract_json_from_text("prefix {\"b\": 2} suffix").as_deref(),
            Some("{\"b\": 2}")
        );
        assert_eq!(extract_json_from_text("} nothing {"), None);
    }

    #[test]
    fn status_retryability() {
        assert!(LlmError::Status { status: 503, body: String::new() }.is_retryable());
        assert!(!LlmError::Status { status: 400, body: String::new() }.is_retryable());
        assert!(!LlmError::Malformed("x".into()).is_retryable());
    }
}
