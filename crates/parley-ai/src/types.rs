//! Core types for conversation interactions

use serde::{Deserialize, Serialize};
use std::fmt;

const SUMMARY_OPEN: &str = "<context-summary>";
const SUMMARY_CLOSE: &str = "</context-summary>";

/// The party (or synthetic source) that produced an interaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Agent {
    User,
    Assistant,
    System,
    /// Injected dynamic context; never persisted as history
    Context,
    ToolCall,
    ToolResult,
    Error,
}

impl Agent {
    /// Get the role as a string
    pub fn name(&self) -> &'static str {
        match self {
            Agent::User => "user",
            Agent::Assistant => "assistant",
            Agent::System => "system",
            Agent::Context => "context",
            Agent::ToolCall => "tool_call",
            Agent::ToolResult => "tool_result",
            Agent::Error => "error",
        }
    }
}

impl fmt::Display for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Opaque identifier shared by every interaction produced within one turn
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TurnId(String);

impl TurnId {
    /// Generate a fresh turn identifier
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TurnId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for TurnId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for TurnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Token usage and timing attributed to one interaction (or a sum of them)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Metrics {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cached_tokens: u32,
    /// Wall-clock completion time in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_time_ms: Option<u64>,
}

impl Metrics {
    pub fn new(input_tokens: u32, output_tokens: u32) -> Self {
        Self {
            input_tokens,
            output_tokens,
            ..Default::default()
        }
    }

    /// Tokens this interaction occupies in the context window
    pub fn total_tokens(&self) -> u32 {
        self.input_tokens.saturating_add(self.output_tokens)
    }

    /// Add another set of metrics into this one
    pub fn accumulate(&mut self, other: &Metrics) {
        self.input_tokens = self.input_tokens.saturating_add(other.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(other.output_tokens);
        self.cached_tokens = self.cached_tokens.saturating_add(other.cached_tokens);
        self.completion_time_ms = match (self.completion_time_ms, other.completion_time_ms) {
            (Some(a), Some(b)) => Some(a.saturating_add(b)),
            (a, b) => a.or(b),
        };
    }

    /// Percentage of `limit` consumed by these metrics, when the limit is known
    pub fn context_usage_percent(&self, limit: Option<u32>) -> Option<f64> {
        match limit {
            Some(limit) if limit > 0 => Some(self.total_tokens() as f64 / limit as f64 * 100.0),
            _ => None,
        }
    }
}

/// Variant-specific content of an interaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    /// Plain text, optionally with the model's reasoning
    Text {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reasoning: Option<String>,
    },
    /// Tool invocation requested by the provider; arguments are raw JSON text
    ToolCall {
        id: String,
        name: String,
        arguments: String,
    },
    /// Outcome of a tool invocation, keyed by the originating call id
    ToolResult {
        id: String,
        name: String,
        result: serde_json::Value,
        #[serde(default)]
        is_error: bool,
    },
    /// Error surfaced into the conversation
    Error { content: String },
}

/// One atomic unit of conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interaction {
    pub agent: Agent,
    pub turn_id: TurnId,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Metrics>,
    pub payload: Payload,
}

impl Interaction {
    fn new(agent: Agent, payload: Payload) -> Self {
        Self {
            agent,
            turn_id: TurnId::new(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            metrics: None,
            payload,
        }
    }

    fn text_from(agent: Agent, content: impl Into<String>) -> Self {
        Self::new(
            agent,
            Payload::Text {
                content: content.into(),
                reasoning: None,
            },
        )
    }

    /// Create a user text interaction
    pub fn user(content: impl Into<String>) -> Self {
        Self::text_from(Agent::User, content)
    }

    /// Create an assistant text interaction
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::text_from(Agent::Assistant, content)
    }

    /// Create an assistant text interaction carrying reasoning
    pub fn assistant_with_reasoning(
        content: impl Into<String>,
        reasoning: impl Into<String>,
    ) -> Self {
        Self::new(
            Agent::Assistant,
            Payload::Text {
                content: content.into(),
                reasoning: Some(reasoning.into()),
            },
        )
    }

    /// Create a system text interaction
    pub fn system(content: impl Into<String>) -> Self {
        Self::text_from(Agent::System, content)
    }

    /// Create an injected context interaction
    pub fn context(content: impl Into<String>) -> Self {
        Self::text_from(Agent::Context, content)
    }

    /// Create a summary of earlier history, stored as a user text interaction
    pub fn summary(summary: impl AsRef<str>) -> Self {
        Self::user(format!(
            "{}\n{}\n{}",
            SUMMARY_OPEN,
            summary.as_ref(),
            SUMMARY_CLOSE
        ))
    }

    /// Create a tool call interaction
    pub fn tool_call(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self::new(
            Agent::ToolCall,
            Payload::ToolCall {
                id: id.into(),
                name: name.into(),
                arguments: arguments.into(),
            },
        )
    }

    /// Create a tool result interaction
    pub fn tool_result(
        id: impl Into<String>,
        name: impl Into<String>,
        result: serde_json::Value,
        is_error: bool,
    ) -> Self {
        Self::new(
            Agent::ToolResult,
            Payload::ToolResult {
                id: id.into(),
                name: name.into(),
                result,
                is_error,
            },
        )
    }

    /// Create an error interaction
    pub fn error(content: impl Into<String>) -> Self {
        Self::new(
            Agent::Error,
            Payload::Error {
                content: content.into(),
            },
        )
    }

    /// Set the turn this interaction belongs to
    pub fn with_turn(mut self, turn_id: TurnId) -> Self {
        self.turn_id = turn_id;
        self
    }

    /// Attach metrics
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Get the text content, for text and error interactions
    pub fn text(&self) -> Option<&str> {
        match &self.payload {
            Payload::Text { content, .. } | Payload::Error { content } => Some(content),
            _ => None,
        }
    }

    /// Get the reasoning attached to a text interaction
    pub fn reasoning(&self) -> Option<&str> {
        match &self.payload {
            Payload::Text { reasoning, .. } => reasoning.as_deref(),
            _ => None,
        }
    }

    /// Get the call id if this is a tool call
    pub fn tool_call_id(&self) -> Option<&str> {
        match &self.payload {
            Payload::ToolCall { id, .. } => Some(id),
            _ => None,
        }
    }

    /// Get the originating call id if this is a tool result
    pub fn tool_result_id(&self) -> Option<&str> {
        match &self.payload {
            Payload::ToolResult { id, .. } => Some(id),
            _ => None,
        }
    }

    /// Get the tool name for tool calls and results
    pub fn tool_name(&self) -> Option<&str> {
        match &self.payload {
            Payload::ToolCall { name, .. } | Payload::ToolResult { name, .. } => Some(name),
            _ => None,
        }
    }

    /// Parse tool call arguments as JSON. Empty arguments parse as an empty object.
    pub fn arguments_json(&self) -> Option<serde_json::Value> {
        match &self.payload {
            Payload::ToolCall { arguments, .. } if arguments.trim().is_empty() => {
                Some(serde_json::Value::Object(Default::default()))
            }
            Payload::ToolCall { arguments, .. } => serde_json::from_str(arguments).ok(),
            _ => None,
        }
    }

    pub fn is_tool_call(&self) -> bool {
        matches!(self.payload, Payload::ToolCall { .. })
    }

    pub fn is_tool_result(&self) -> bool {
        matches!(self.payload, Payload::ToolResult { .. })
    }

    pub fn is_error(&self) -> bool {
        match &self.payload {
            Payload::Error { .. } => true,
            Payload::ToolResult { is_error, .. } => *is_error,
            _ => false,
        }
    }

    /// Whether this interaction is a summary produced by context compaction
    pub fn is_summary(&self) -> bool {
        self.agent == Agent::User
            && self
                .text()
                .is_some_and(|t| t.starts_with(SUMMARY_OPEN) && t.trim_end().ends_with(SUMMARY_CLOSE))
    }

    /// Whether this is a text interaction with nothing but whitespace in it
    pub fn is_blank(&self) -> bool {
        match &self.payload {
            Payload::Text { content, reasoning } => {
                content.trim().is_empty()
                    && reasoning.as_deref().is_none_or(|r| r.trim().is_empty())
            }
            Payload::ToolCall { name, .. } => name.is_empty(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constructors_set_agent() {
        assert_eq!(Interaction::user("hi").agent, Agent::User);
        assert_eq!(Interaction::assistant("hi").agent, Agent::Assistant);
        assert_eq!(Interaction::system("hi").agent, Agent::System);
        assert_eq!(Interaction::context("hi").agent, Agent::Context);
        assert_eq!(Interaction::tool_call("c1", "x", "{}").agent, Agent::ToolCall);
        assert_eq!(
            Interaction::tool_result("c1", "x", serde_json::json!({}), false).agent,
            Agent::ToolResult
        );
        assert_eq!(Interaction::error("bad").agent, Agent::Error);
    }

    #[test]
    fn test_summary_marker() {
        let summary = Interaction::summary("we did things");
        assert!(summary.is_summary());
        assert!(summary.text().unwrap().contains("we did things"));
        assert!(!Interaction::user("plain").is_summary());
    }

    #[test]
    fn test_arguments_json() {
        let call = Interaction::tool_call("c1", "x", r#"{"a": 1}"#);
        assert_eq!(call.arguments_json(), Some(serde_json::json!({"a": 1})));

        let empty = Interaction::tool_call("c1", "x", "");
        assert_eq!(empty.arguments_json(), Some(serde_json::json!({})));

        let partial = Interaction::tool_call("c1", "x", r#"{"a": "#);
        assert_eq!(partial.arguments_json(), None);
    }

    #[test]
    fn test_metrics_accumulate() {
        let mut total = Metrics::new(10, 5);
        total.accumulate(&Metrics {
            input_tokens: 3,
            output_tokens: 2,
            cached_tokens: 1,
            completion_time_ms: Some(40),
        });
        assert_eq!(total.total_tokens(), 20);
        assert_eq!(total.cached_tokens, 1);
        assert_eq!(total.completion_time_ms, Some(40));
    }

    #[test]
    fn test_context_usage_percent() {
        let m = Metrics::new(60, 25);
        assert_eq!(m.context_usage_percent(Some(100)), Some(85.0));
        assert_eq!(m.context_usage_percent(None), None);
        assert_eq!(m.context_usage_percent(Some(0)), None);
    }

    #[test]
    fn test_interaction_serde_shape() {
        let call = Interaction::tool_call("c1", "move", r#"{"x":1}"#).with_turn("t1".into());
        let json = serde_json::to_value(&call).unwrap();
        assert_eq!(json["agent"], "tool_call");
        assert_eq!(json["turn_id"], "t1");
        assert_eq!(json["payload"]["type"], "tool_call");
        assert_eq!(json["payload"]["name"], "move");
    }

    #[test]
    fn test_blank_text() {
        assert!(Interaction::assistant("  \n").is_blank());
        assert!(!Interaction::assistant_with_reasoning("", "thinking").is_blank());
        assert!(!Interaction::assistant("hello").is_blank());
    }
}
