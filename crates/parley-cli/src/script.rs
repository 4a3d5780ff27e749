//! Scripted conversations: what the user says, what the provider answers, and
//! what each tool returns, replayed through a real session.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use parking_lot::Mutex;
use parley_ai::{
    Body, DeltaStream, Interaction, Metrics, ProviderError, ProviderExecutor, ProviderReply,
    Request, ToolError, ToolFilter, ToolRequest, ToolReturn,
};
use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// A conversation to replay
#[derive(Debug, Clone, Deserialize)]
pub struct Script {
    #[serde(default)]
    pub system: Option<String>,
    /// Earlier exchanges placed before the user prompt
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    pub user: String,
    #[serde(default)]
    pub context_window: Option<u32>,
    #[serde(default)]
    pub tool_filter: ToolFilter,
    #[serde(default)]
    pub json_output_schema: Option<Value>,
    /// Provider replies, consumed one per provider call (summaries and greetings included)
    #[serde(default)]
    pub replies: Vec<ScriptReply>,
    /// Canned tool outcomes keyed by tool name
    #[serde(default)]
    pub tools: HashMap<String, ToolScript>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum HistoryEntry {
    User { content: String },
    Assistant { content: String },
}

/// One provider reply. An `error` makes the call fail with that message.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ScriptReply {
    pub items: Vec<ScriptItem>,
    pub error: Option<String>,
    pub metrics: Option<Metrics>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScriptItem {
    Text {
        content: String,
        #[serde(default)]
        reasoning: Option<String>,
    },
    ToolCall {
        id: String,
        name: String,
        /// A JSON value, or a string passed through verbatim
        #[serde(default)]
        arguments: Value,
    },
}

/// Canned outcome for a tool. `error` wins over `result`; neither means "no result".
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ToolScript {
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl Script {
    /// Load a script from a JSON file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read script {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid script {}", path.display()))
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    /// The starting history: system prompt, earlier exchanges, then the user prompt
    pub fn body(&self) -> Body {
        let mut builder = Body::builder();
        if let Some(system) = &self.system {
            builder = builder.push(Interaction::system(system.clone()));
        }
        for entry in &self.history {
            builder = builder.push(match entry {
                HistoryEntry::User { content } => Interaction::user(content.clone()),
                HistoryEntry::Assistant { content } => Interaction::assistant(content.clone()),
            });
        }
        builder
            .push(Interaction::user(self.user.clone()))
            .tool_filter(self.tool_filter.clone())
            .json_output_schema(self.json_output_schema.clone())
            .build()
    }
}

/// Executor that answers from a [`Script`] instead of a real backend
pub struct ScriptedExecutor {
    replies: Mutex<VecDeque<ScriptReply>>,
    tools: HashMap<String, ToolScript>,
}

impl ScriptedExecutor {
    pub fn new(script: &Script) -> Self {
        Self {
            replies: Mutex::new(script.replies.iter().cloned().collect()),
            tools: script.tools.clone(),
        }
    }

    /// Replies not yet consumed
    #[cfg(test)]
    pub fn remaining(&self) -> usize {
        self.replies.lock().len()
    }

    fn next_reply(&self, request: &Request) -> parley_ai::Result<ScriptReply> {
        let reply = self.replies.lock().pop_front().ok_or_else(|| {
            ProviderError::Other(format!(
                "script has no reply left for {:?} request",
                request.kind
            ))
        })?;
        tracing::debug!(kind = ?request.kind, items = reply.items.len(), "Replaying scripted reply");
        match reply.error {
            Some(message) => Err(ProviderError::Other(message)),
            None => Ok(reply),
        }
    }
}

fn arguments_text(arguments: &Value) -> String {
    match arguments {
        Value::String(raw) => raw.clone(),
        Value::Null => "{}".to_string(),
        other => other.to_string(),
    }
}

fn interactions_for(reply: &ScriptReply) -> Vec<Interaction> {
    reply
        .items
        .iter()
        .map(|item| match item {
            ScriptItem::Text {
                content,
                reasoning: Some(reasoning),
            } => Interaction::assistant_with_reasoning(content.clone(), reasoning.clone()),
            ScriptItem::Text { content, .. } => Interaction::assistant(content.clone()),
            ScriptItem::ToolCall {
                id,
                name,
                arguments,
            } => Interaction::tool_call(id.clone(), name.clone(), arguments_text(arguments)),
        })
        .collect()
}

/// Cumulative deltas: every text delta carries the whole text so far, one word
/// further along. The text items of one reply stream as a single message.
fn deltas_for(reply: &ScriptReply) -> Vec<Interaction> {
    let mut deltas = Vec::new();
    let mut so_far = String::new();
    for item in &reply.items {
        match item {
            ScriptItem::Text { content, reasoning } => {
                if let Some(reasoning) = reasoning {
                    deltas.push(Interaction::assistant_with_reasoning("", reasoning.clone()));
                }
                for word in content.split_inclusive(' ') {
                    so_far.push_str(word);
                    deltas.push(Interaction::assistant(so_far.clone()));
                }
            }
            ScriptItem::ToolCall {
                id,
                name,
                arguments,
            } => deltas.push(Interaction::tool_call(
                id.clone(),
                name.clone(),
                arguments_text(arguments),
            )),
        }
    }
    if let (Some(metrics), Some(last)) = (reply.metrics, deltas.last_mut()) {
        last.metrics = Some(metrics);
    }
    deltas
}

#[async_trait]
impl ProviderExecutor for ScriptedExecutor {
    async fn exec(
        &self,
        request: &Request,
        _cancel: CancellationToken,
    ) -> parley_ai::Result<ProviderReply> {
        let reply = self.next_reply(request)?;
        let out = ProviderReply::new(interactions_for(&reply));
        Ok(match reply.metrics {
            Some(metrics) => out.with_metrics(metrics),
            None => out,
        })
    }

    async fn exec_stream(
        &self,
        request: &Request,
        _cancel: CancellationToken,
    ) -> parley_ai::Result<DeltaStream> {
        let reply = self.next_reply(request)?;
        let deltas = deltas_for(&reply);
        Ok(Box::pin(futures::stream::iter(deltas.into_iter().map(Ok))))
    }

    async fn exec_tool(
        &self,
        request: &ToolRequest,
        _cancel: CancellationToken,
    ) -> Result<ToolReturn, ToolError> {
        let script = self
            .tools
            .get(&request.name)
            .ok_or_else(|| ToolError::NotFound(request.name.clone()))?;
        Ok(match (&script.error, &script.result) {
            (Some(error), _) => ToolReturn::failed(error.clone()),
            (None, Some(result)) => ToolReturn::ok(result.clone()),
            (None, None) => ToolReturn {
                success: true,
                ..Default::default()
            },
        })
    }
}
