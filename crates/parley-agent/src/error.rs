//! Error types for parley-agent

use parley_ai::{ProviderError, ToolError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using the session error
pub type Result<T> = std::result::Result<T, SessionError>;

/// Coarse classification of session failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Provider,
    Tool,
    ContextExceeded,
    MaxTurnsExceeded,
    Cancelled,
    Summarization,
}

/// Errors that can occur while driving a session
#[derive(Error, Debug, Clone)]
pub enum SessionError {
    /// The request was malformed; no provider call was made
    #[error("Invalid request: {}", .0.join("; "))]
    Validation(Vec<String>),

    /// The provider failed or returned nothing
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// A tool failed (normally recovered into a diagnostic tool result)
    #[error(transparent)]
    Tool(#[from] ToolError),

    /// The context window was exceeded and recovery did not help
    #[error("Context window exceeded: {0}")]
    ContextExceeded(String),

    /// The loop did not stabilise within the turn budget
    #[error("Max turns reached ({0}) without a stable result")]
    MaxTurnsExceeded(u32),

    /// Cooperative cancellation was observed
    #[error("Cancelled")]
    Cancelled,

    /// Summarization could not be performed
    #[error("Summarization failed: {0}")]
    Summarization(String),
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::Validation(_) => ErrorKind::Validation,
            SessionError::Provider(_) => ErrorKind::Provider,
            SessionError::Tool(_) => ErrorKind::Tool,
            SessionError::ContextExceeded(_) => ErrorKind::ContextExceeded,
            SessionError::MaxTurnsExceeded(_) => ErrorKind::MaxTurnsExceeded,
            SessionError::Cancelled => ErrorKind::Cancelled,
            SessionError::Summarization(_) => ErrorKind::Summarization,
        }
    }

    /// Check if this error indicates a context overflow
    pub fn is_context_overflow(&self) -> bool {
        match self {
            SessionError::Provider(e) => e.is_context_overflow(),
            SessionError::ContextExceeded(_) => true,
            _ => false,
        }
    }
}
