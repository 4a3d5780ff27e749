//! Session lifecycle events and observers

use std::sync::Arc;

use parley_ai::{Interaction, Request, RequestKind, TurnId};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::context::SummaryReason;
use crate::error::{ErrorKind, SessionError};
use crate::outcome::Return;

/// Receives lifecycle notifications while a session runs.
///
/// Callbacks are invoked synchronously, in the order the events happen, before
/// the loop moves on. Every method has a no-op default.
pub trait Observer: Send + Sync {
    /// A provider request is about to be sent
    fn on_start(&self, _request: &Request) {}

    /// A raw streamed fragment arrived
    fn on_delta(&self, _delta: &Interaction) {}

    /// A provider interaction was committed to history
    fn on_interaction_completed(&self, _interaction: &Interaction) {}

    /// A tool call is about to execute
    fn on_tool_call(&self, _call: &Interaction) {}

    /// A tool result was committed to history
    fn on_tool_result(&self, _result: &Interaction) {}

    fn on_summarization_start(&self, _reason: SummaryReason) {}

    fn on_summarization_end(&self, _tokens_before: u32, _tokens_after: u32) {}

    /// The run reached its terminal state
    fn on_final(&self, _ret: &Return) {}

    fn on_error(&self, _error: &SessionError) {}
}

/// Observer that ignores everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl Observer for NoopObserver {}

/// Fans notifications out to several observers, in registration order
#[derive(Clone, Default)]
pub struct ObserverSet(Vec<Arc<dyn Observer>>);

impl ObserverSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, observer: Arc<dyn Observer>) {
        self.0.push(observer);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Observer for ObserverSet {
    fn on_start(&self, request: &Request) {
        self.0.iter().for_each(|o| o.on_start(request));
    }

    fn on_delta(&self, delta: &Interaction) {
        self.0.iter().for_each(|o| o.on_delta(delta));
    }

    fn on_interaction_completed(&self, interaction: &Interaction) {
        self.0
            .iter()
            .for_each(|o| o.on_interaction_completed(interaction));
    }

    fn on_tool_call(&self, call: &Interaction) {
        self.0.iter().for_each(|o| o.on_tool_call(call));
    }

    fn on_tool_result(&self, result: &Interaction) {
        self.0.iter().for_each(|o| o.on_tool_result(result));
    }

    fn on_summarization_start(&self, reason: SummaryReason) {
        self.0.iter().for_each(|o| o.on_summarization_start(reason));
    }

    fn on_summarization_end(&self, tokens_before: u32, tokens_after: u32) {
        self.0
            .iter()
            .for_each(|o| o.on_summarization_end(tokens_before, tokens_after));
    }

    fn on_final(&self, ret: &Return) {
        self.0.iter().for_each(|o| o.on_final(ret));
    }

    fn on_error(&self, error: &SessionError) {
        self.0.iter().for_each(|o| o.on_error(error));
    }
}

/// Events emitted during session execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// A provider request is about to be sent
    RequestStart {
        kind: RequestKind,
        turn_id: TurnId,
        interactions: usize,
    },

    /// Streamed fragment
    Delta { interaction: Interaction },

    /// Interaction committed to history
    InteractionCompleted { interaction: Interaction },

    /// Tool execution started
    ToolCall { interaction: Interaction },

    /// Tool execution completed
    ToolResult { interaction: Interaction },

    /// Summarization started
    SummarizationStart { reason: SummaryReason },

    /// Summarization completed
    SummarizationEnd {
        tokens_before: u32,
        tokens_after: u32,
    },

    /// The run finished
    Final {
        success: bool,
        stable: bool,
        turns: u32,
        tool_passes: u32,
        messages: Vec<String>,
    },

    /// Error occurred
    Error { kind: ErrorKind, message: String },
}

impl SessionEvent {
    /// Check if this is a terminal event
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionEvent::Final { .. })
    }
}

/// Publishes [`SessionEvent`]s on a broadcast channel
#[derive(Clone)]
pub struct ChannelObserver {
    tx: broadcast::Sender<SessionEvent>,
}

impl ChannelObserver {
    /// Create an observer and a first receiver
    pub fn new(capacity: usize) -> (Self, broadcast::Receiver<SessionEvent>) {
        let (tx, rx) = broadcast::channel(capacity);
        (Self { tx }, rx)
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.tx.send(event);
    }
}

impl Observer for ChannelObserver {
    fn on_start(&self, request: &Request) {
        self.emit(SessionEvent::RequestStart {
            kind: request.kind,
            turn_id: request.turn_id.clone(),
            interactions: request.interactions.len(),
        });
    }

    fn on_delta(&self, delta: &Interaction) {
        self.emit(SessionEvent::Delta {
            interaction: delta.clone(),
        });
    }

    fn on_interaction_completed(&self, interaction: &Interaction) {
        self.emit(SessionEvent::InteractionCompleted {
            interaction: interaction.clone(),
        });
    }

    fn on_tool_call(&self, call: &Interaction) {
        self.emit(SessionEvent::ToolCall {
            interaction: call.clone(),
        });
    }

    fn on_tool_result(&self, result: &Interaction) {
        self.emit(SessionEvent::ToolResult {
            interaction: result.clone(),
        });
    }

    fn on_summarization_start(&self, reason: SummaryReason) {
        self.emit(SessionEvent::SummarizationStart { reason });
    }

    fn on_summarization_end(&self, tokens_before: u32, tokens_after: u32) {
        self.emit(SessionEvent::SummarizationEnd {
            tokens_before,
            tokens_after,
        });
    }

    fn on_final(&self, ret: &Return) {
        self.emit(SessionEvent::Final {
            success: ret.success,
            stable: ret.stable,
            turns: ret.turns,
            tool_passes: ret.tool_passes,
            messages: ret.messages.clone(),
        });
    }

    fn on_error(&self, error: &SessionError) {
        self.emit(SessionEvent::Error {
            kind: error.kind(),
            message: error.to_string(),
        });
    }
}

/// Writes a diagnostic transcript of the session through `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn on_start(&self, request: &Request) {
        tracing::debug!(
            kind = ?request.kind,
            turn = %request.turn_id,
            interactions = request.interactions.len(),
            "Sending request"
        );
    }

    fn on_delta(&self, delta: &Interaction) {
        tracing::trace!(agent = %delta.agent, "Delta");
    }

    fn on_interaction_completed(&self, interaction: &Interaction) {
        tracing::debug!(
            agent = %interaction.agent,
            turn = %interaction.turn_id,
            "Interaction completed"
        );
    }

    fn on_tool_call(&self, call: &Interaction) {
        tracing::info!(
            tool = call.tool_name().unwrap_or_default(),
            id = call.tool_call_id().unwrap_or_default(),
            "Executing tool"
        );
    }

    fn on_tool_result(&self, result: &Interaction) {
        tracing::debug!(
            tool = result.tool_name().unwrap_or_default(),
            id = result.tool_result_id().unwrap_or_default(),
            is_error = result.is_error(),
            "Tool finished"
        );
    }

    fn on_summarization_start(&self, reason: SummaryReason) {
        tracing::info!(?reason, "Summarizing history");
    }

    fn on_summarization_end(&self, tokens_before: u32, tokens_after: u32) {
        tracing::info!(tokens_before, tokens_after, "Summarization complete");
    }

    fn on_final(&self, ret: &Return) {
        tracing::info!(
            success = ret.success,
            stable = ret.stable,
            turns = ret.turns,
            tool_passes = ret.tool_passes,
            "Run finished"
        );
    }

    fn on_error(&self, error: &SessionError) {
        tracing::warn!(kind = ?error.kind(), "Session error: {}", error);
    }
}
