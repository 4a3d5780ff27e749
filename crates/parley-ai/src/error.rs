//! Error types for parley-ai

use std::{sync::LazyLock, time::Duration};

use regex::Regex;
use thiserror::Error;

/// Result type alias using the provider error
pub type Result<T> = std::result::Result<T, ProviderError>;

/// Errors raised by a provider call
#[derive(Error, Debug, Clone)]
pub enum ProviderError {
    /// API returned an error response
    #[error("API error: {message} (type: {error_type})")]
    Api { error_type: String, message: String },

    /// Context overflow / too many tokens
    #[error("Context overflow: {0}")]
    ContextOverflow(String),

    /// The provider produced nothing at all
    #[error("Provider returned no response")]
    EmptyResponse,

    /// The provider reported an unsuccessful call
    #[error("Provider reported failure: {0}")]
    Failed(String),

    /// Rate limit exceeded
    #[error("Rate limited: retry after {retry_after:?} seconds")]
    RateLimited { retry_after: Option<u64> },

    /// Request was aborted
    #[error("Request aborted")]
    Aborted,

    /// Request did not finish in time
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// Unexpected response format
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    /// Anything else a provider wants to surface
    #[error("{0}")]
    Other(String),
}

impl ProviderError {
    /// Create an API error from type and message
    pub fn api(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Api {
            error_type: error_type.into(),
            message: message.into(),
        }
    }

    /// Check if this error is worth retrying with backoff
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::RateLimited { .. } | ProviderError::Timeout(_) => true,
            ProviderError::Api {
                error_type,
                message,
            } => {
                let et = error_type.to_lowercase();
                let msg = message.to_lowercase();
                et.contains("rate_limit")
                    || et.contains("overloaded")
                    || msg.contains("rate limit")
                    || msg.contains("overloaded")
                    || msg.contains("too many requests")
                    || msg.contains("529")
            }
            _ => false,
        }
    }

    /// Check if this error indicates the context window was exceeded
    pub fn is_context_overflow(&self) -> bool {
        match self {
            ProviderError::ContextOverflow(_) => true,
            ProviderError::Api { message, .. } | ProviderError::Failed(message) => {
                is_context_overflow(message)
            }
            ProviderError::Other(message) | ProviderError::UnexpectedResponse(message) => {
                is_context_overflow(message)
            }
            _ => false,
        }
    }
}

/// Errors raised while executing a tool
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Tool not permitted by filter: {0}")]
    NotPermitted(String),

    #[error("Invalid tool arguments: {0}")]
    InvalidArguments(String),

    #[error("Tool execution failed: {0}")]
    Failed(String),

    #[error("Tool produced no result")]
    NoResult,
}

/// Compiled patterns for recognising context overflow messages across providers.
static OVERFLOW_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)context.?length",
        r"(?i)maximum.?context",
        r"(?i)context.?window.?(exceed|full|limit)",
        r"(?i)too.?many.?tokens",
        r"(?i)prompt.?is.?too.?long",
        r"(?i)prompt.?too.?long",
        r"(?i)input.?too.?long",
        r"(?i)token.?limit",
        r"(?i)content.?too.?large",
        r"(?i)request.?too.?large",
        r"(?i)messages?.?too.?long",
        r"(?i)maximum.?number.?of.?tokens",
        r"(?i)reduce.?the.?length",
        r"(?i)context_length_exceeded",
        r"(?i)max_tokens.*(exceed|limit|too|overflow)",
        r"(?i)context.?overflow",
        r"(?i)sequence.?too.?long",
        r"(?i)context.?size.?exceed",
        r"(?i)total.?tokens?.?exceed",
        r"\b413\b",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

/// HTTP 400 in an error string; only meaningful together with token wording.
static HTTP_400_PATTERN: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:status|http|error)[:\s]*400\b|\b400\s+bad\s+request").ok()
});

/// Check if an error message indicates the context window was exceeded
pub fn is_context_overflow(message: &str) -> bool {
    if HTTP_400_PATTERN
        .as_ref()
        .is_some_and(|re| re.is_match(message))
    {
        let lower = message.to_lowercase();
        if lower.contains("token") || lower.contains("context") || lower.contains("length") {
            return true;
        }
    }

    OVERFLOW_PATTERNS.iter().any(|re| re.is_match(message))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overflow_known_phrases() {
        assert!(is_context_overflow("This model's maximum context length is 8192 tokens"));
        assert!(is_context_overflow("token limit exceeded"));
        assert!(is_context_overflow("error code: context_length_exceeded"));
        assert!(is_context_overflow("Prompt is too long"));
        assert!(is_context_overflow("HTTP 413 Payload Too Large"));
    }

    #[test]
    fn test_overflow_http_400_with_token_wording() {
        assert!(is_context_overflow("status: 400 - too many tokens in context"));
        assert!(!is_context_overflow("400 Bad Request: invalid field"));
    }

    #[test]
    fn test_no_overflow_normal_errors() {
        assert!(!is_context_overflow("401 Unauthorized"));
        assert!(!is_context_overflow("rate limit exceeded"));
        assert!(!is_context_overflow("connection timeout"));
        assert!(!is_context_overflow("processed 400 items"));
    }

    #[test]
    fn test_error_overflow_classification() {
        assert!(ProviderError::ContextOverflow("big".into()).is_context_overflow());
        assert!(ProviderError::api("invalid_request_error", "context length exceeded").is_context_overflow());
        assert!(ProviderError::Failed("token limit reached".into()).is_context_overflow());
        assert!(!ProviderError::EmptyResponse.is_context_overflow());
        assert!(!ProviderError::Aborted.is_context_overflow());
    }

    #[test]
    fn test_retryable() {
        assert!(ProviderError::RateLimited { retry_after: Some(1) }.is_retryable());
        assert!(ProviderError::api("overloaded_error", "busy").is_retryable());
        assert!(!ProviderError::api("authentication_error", "bad key").is_retryable());
        assert!(!ProviderError::ContextOverflow("x".into()).is_retryable());
    }
}
