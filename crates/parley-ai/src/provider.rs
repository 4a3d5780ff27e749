//! Provider executor interface: calling the AI backend and dispatching tools

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::body::ToolFilter;
use crate::error::{ProviderError, Result, ToolError};
use crate::stream::DeltaStream;
use crate::types::{Agent, Interaction, Metrics, TurnId};

/// Which backend and model a conversation talks to
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestConfig {
    /// Provider name (e.g. "anthropic", "openai")
    pub provider: String,
    /// Model identifier
    pub model: String,
    /// Optional endpoint override
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Context window size in tokens, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_window: Option<u32>,
    /// Maximum tokens per response
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

impl RequestConfig {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            ..Default::default()
        }
    }

    pub fn with_context_window(mut self, tokens: u32) -> Self {
        self.context_window = Some(tokens);
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }
}

/// Why a request is being made
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    /// First provider call of a turn
    Turn,
    /// Call made to consume tool results within a turn
    FollowUp,
    /// Tool-disabled sub-request asking for a summary of history
    Summary,
    /// Tool-disabled sub-request producing an opening message
    Greeting,
}

/// One provider call
#[derive(Debug, Clone)]
pub struct Request {
    pub config: RequestConfig,
    pub kind: RequestKind,
    pub turn_id: TurnId,
    /// History as the provider should see it (including injected context)
    pub interactions: Vec<Interaction>,
    pub tool_filter: ToolFilter,
    pub json_output_schema: Option<serde_json::Value>,
    /// Whether the caller intends to consume the reply as a stream
    pub stream: bool,
}

impl Request {
    pub fn new(
        config: RequestConfig,
        kind: RequestKind,
        turn_id: TurnId,
        interactions: Vec<Interaction>,
    ) -> Self {
        Self {
            config,
            kind,
            turn_id,
            interactions,
            tool_filter: ToolFilter::All,
            json_output_schema: None,
            stream: false,
        }
    }

    pub fn with_tool_filter(mut self, filter: ToolFilter) -> Self {
        self.tool_filter = filter;
        self
    }

    pub fn with_json_output_schema(mut self, schema: Option<serde_json::Value>) -> Self {
        self.json_output_schema = schema;
        self
    }

    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    /// Text of the most recent user interaction
    pub fn last_user_text(&self) -> Option<&str> {
        self.interactions
            .iter()
            .rev()
            .find(|i| i.agent == Agent::User)
            .and_then(Interaction::text)
    }
}

/// What a non-streaming provider call returned
#[derive(Debug, Clone, Default)]
pub struct ProviderReply {
    pub success: bool,
    pub interactions: Vec<Interaction>,
    /// Usage for the whole call, if the provider does not attach it per interaction
    pub metrics: Option<Metrics>,
    pub messages: Vec<String>,
}

impl ProviderReply {
    /// A successful reply
    pub fn new(interactions: Vec<Interaction>) -> Self {
        Self {
            success: true,
            interactions,
            metrics: None,
            messages: vec![],
        }
    }

    /// A reply the provider itself flagged as failed
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            interactions: vec![],
            metrics: None,
            messages: vec![message.into()],
        }
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Turn the reply into its interactions, or the error it represents.
    ///
    /// Call-level metrics attach to the last interaction when none carry their own.
    pub fn into_interactions(self) -> Result<Vec<Interaction>> {
        if !self.success {
            let message = if self.messages.is_empty() {
                "unknown provider failure".to_string()
            } else {
                self.messages.join("; ")
            };
            return Err(ProviderError::Failed(message));
        }
        let mut interactions = self.interactions;
        if interactions.is_empty() {
            return Err(ProviderError::EmptyResponse);
        }
        if let Some(metrics) = self.metrics {
            if interactions.iter().all(|i| i.metrics.is_none()) {
                if let Some(last) = interactions.last_mut() {
                    last.metrics = Some(metrics);
                }
            }
        }
        Ok(interactions)
    }
}

/// A single tool invocation handed to the executor
#[derive(Debug, Clone)]
pub struct ToolRequest {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
    pub turn_id: TurnId,
}

impl ToolRequest {
    /// Build a tool request from a recorded tool call interaction
    pub fn from_call(call: &Interaction) -> std::result::Result<Self, ToolError> {
        let (Some(id), Some(name)) = (call.tool_call_id(), call.tool_name()) else {
            return Err(ToolError::InvalidArguments(format!(
                "{} interaction is not a tool call",
                call.agent
            )));
        };
        let arguments = call
            .arguments_json()
            .ok_or_else(|| ToolError::InvalidArguments(format!("arguments for '{}' are not valid JSON", name)))?;
        Ok(Self {
            id: id.to_string(),
            name: name.to_string(),
            arguments,
            turn_id: call.turn_id.clone(),
        })
    }
}

/// What a tool execution returned
#[derive(Debug, Clone, Default)]
pub struct ToolReturn {
    pub success: bool,
    pub result: Option<serde_json::Value>,
    pub metrics: Option<Metrics>,
    pub messages: Vec<String>,
}

impl ToolReturn {
    /// A successful result
    pub fn ok(result: serde_json::Value) -> Self {
        Self {
            success: true,
            result: Some(result),
            metrics: None,
            messages: vec![],
        }
    }

    /// A failed execution with a diagnostic message
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            result: None,
            metrics: None,
            messages: vec![message.into()],
        }
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

/// Abstracts the AI backend and tool dispatch behind one seam
#[async_trait]
pub trait ProviderExecutor: Send + Sync {
    /// Run one provider call to completion
    async fn exec(&self, request: &Request, cancel: CancellationToken) -> Result<ProviderReply>;

    /// Run one provider call, yielding partial interactions as they arrive.
    ///
    /// The default implementation replays the non-streaming reply as a stream.
    async fn exec_stream(&self, request: &Request, cancel: CancellationToken) -> Result<DeltaStream> {
        let interactions = self.exec(request, cancel).await?.into_interactions()?;
        Ok(Box::pin(futures::stream::iter(interactions.into_iter().map(Ok))))
    }

    /// Whether `exec_stream` is meaningful for this backend
    fn supports_streaming(&self) -> bool {
        true
    }

    /// Execute a tool by name
    async fn exec_tool(
        &self,
        request: &ToolRequest,
        cancel: CancellationToken,
    ) -> std::result::Result<ToolReturn, ToolError>;
}
