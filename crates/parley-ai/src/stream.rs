//! Streaming deltas and the coalescer that folds them into stable interactions

use std::pin::Pin;
use tokio_stream::Stream;

use crate::error::Result;
use crate::types::{Agent, Interaction, Metrics, Payload, TurnId};

/// A stream of partial interactions emitted by a streaming provider
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<Interaction>> + Send>>;

/// Merge an incoming text fragment into the accumulated text.
///
/// - `incoming` extends `accumulated` (cumulative provider): replace.
/// - `incoming` is a prefix of `accumulated` (stale resend): ignore.
/// - otherwise (incremental provider): append.
///
/// Returns whether `accumulated` changed. Length never decreases.
pub fn coalesce(accumulated: &mut String, incoming: &str) -> bool {
    if incoming.len() >= accumulated.len() && incoming.starts_with(accumulated.as_str()) {
        if incoming.len() == accumulated.len() {
            return false;
        }
        accumulated.clear();
        accumulated.push_str(incoming);
        true
    } else if accumulated.starts_with(incoming) {
        false
    } else {
        accumulated.push_str(incoming);
        true
    }
}

/// Merge tool call argument fragments.
///
/// Complete JSON snapshots replace the stored arguments only when they are not
/// shorter, so an out-of-order duplicate cannot roll arguments back. Partial
/// fragments follow [`coalesce`].
pub fn coalesce_arguments(stored: &mut String, incoming: &str) -> bool {
    if stored.is_empty() {
        stored.push_str(incoming);
        return !incoming.is_empty();
    }
    if is_complete_object(stored) && is_complete_object(incoming) {
        if incoming.len() >= stored.len() && incoming != stored.as_str() {
            stored.clear();
            stored.push_str(incoming);
            return true;
        }
        return false;
    }
    coalesce(stored, incoming)
}

fn is_complete_object(text: &str) -> bool {
    serde_json::from_str::<serde_json::Map<String, serde_json::Value>>(text).is_ok()
}

#[derive(Debug)]
struct ToolCallBuffer {
    id: String,
    name: String,
    arguments: String,
}

/// Accumulates streamed deltas into exactly one interaction per logical unit
#[derive(Debug, Default)]
pub struct StreamCoalescer {
    content: String,
    reasoning: String,
    saw_text: bool,
    tool_calls: Vec<ToolCallBuffer>,
    metrics: Option<Metrics>,
    error: Option<String>,
    deltas: usize,
}

impl StreamCoalescer {
    /// Create an empty coalescer
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one delta into the accumulated state
    pub fn process(&mut self, delta: &Interaction) {
        self.deltas += 1;
        if let Some(metrics) = delta.metrics {
            self.metrics = Some(metrics);
        }

        match &delta.payload {
            Payload::Text { content, reasoning } => {
                self.saw_text = true;
                coalesce(&mut self.content, content);
                if let Some(reasoning) = reasoning {
                    coalesce(&mut self.reasoning, reasoning);
                }
            }
            Payload::ToolCall {
                id,
                name,
                arguments,
            } => self.process_tool_call(id, name, arguments),
            Payload::Error { content } => {
                let error = self.error.get_or_insert_with(String::new);
                coalesce(error, content);
            }
            Payload::ToolResult { .. } => {
                tracing::debug!("Ignoring tool result delta from provider stream");
            }
        }
    }

    fn process_tool_call(&mut self, id: &str, name: &str, arguments: &str) {
        // Fragments without an id continue the most recent call
        let existing = if id.is_empty() {
            self.tool_calls.last_mut()
        } else {
            self.tool_calls.iter_mut().find(|c| c.id == id)
        };

        match existing {
            Some(buffer) => {
                if buffer.name.is_empty() && !name.is_empty() {
                    buffer.name = name.to_string();
                }
                coalesce_arguments(&mut buffer.arguments, arguments);
            }
            None => self.tool_calls.push(ToolCallBuffer {
                id: id.to_string(),
                name: name.to_string(),
                arguments: arguments.to_string(),
            }),
        }
    }

    /// Text accumulated so far
    pub fn content(&self) -> &str {
        &self.content
    }

    /// Reasoning accumulated so far
    pub fn reasoning(&self) -> &str {
        &self.reasoning
    }

    /// Error text reported inside the stream, if any
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Number of deltas processed
    pub fn delta_count(&self) -> usize {
        self.deltas
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty() && self.reasoning.is_empty() && self.tool_calls.is_empty()
    }

    /// Produce the final interactions: text first, then tool calls in first-seen order.
    ///
    /// Metrics reported during the stream attach to the first interaction.
    pub fn finish(self, turn_id: &TurnId) -> Vec<Interaction> {
        let mut out = Vec::new();

        if self.saw_text && !(self.content.is_empty() && self.reasoning.is_empty()) {
            let reasoning = (!self.reasoning.is_empty()).then_some(self.reasoning);
            out.push(interaction_for(
                Agent::Assistant,
                Payload::Text {
                    content: self.content,
                    reasoning,
                },
                turn_id,
            ));
        }

        for call in self.tool_calls {
            out.push(interaction_for(
                Agent::ToolCall,
                Payload::ToolCall {
                    id: call.id,
                    name: call.name,
                    arguments: call.arguments,
                },
                turn_id,
            ));
        }

        if let (Some(metrics), Some(first)) = (self.metrics, out.first_mut()) {
            first.metrics = Some(metrics);
        }
        out
    }
}

fn interaction_for(agent: Agent, payload: Payload, turn_id: &TurnId) -> Interaction {
    Interaction {
        agent,
        turn_id: turn_id.clone(),
        timestamp: chrono::Utc::now().timestamp_millis(),
        metrics: None,
        payload,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> Interaction {
        Interaction::assistant(s)
    }

    #[test]
    fn test_coalesce_incremental() {
        let mut acc = String::new();
        for fragment in ["Hel", "lo, ", "world"] {
            coalesce(&mut acc, fragment);
        }
        assert_eq!(acc, "Hello, world");
    }

    #[test]
    fn test_coalesce_cumulative() {
        let mut acc = String::new();
        for fragment in ["Hel", "Hello", "Hello, world"] {
            coalesce(&mut acc, fragment);
        }
        assert_eq!(acc, "Hello, world");
    }

    #[test]
    fn test_coalesce_discards_stale_prefix() {
        let mut acc = "Hello, world".to_string();
        assert!(!coalesce(&mut acc, "Hello"));
        assert_eq!(acc, "Hello, world");
    }

    #[test]
    fn test_coalesce_same_fragment_twice_is_idempotent() {
        let mut acc = String::new();
        coalesce(&mut acc, "Hello");
        assert!(!coalesce(&mut acc, "Hello"));
        assert_eq!(acc, "Hello");
    }

    #[test]
    fn test_coalesce_is_monotonic() {
        let mut acc = String::new();
        let mut last_len = 0;
        for fragment in ["a", "ab", "a", "", "abc", "x", "abcx", "ab"] {
            coalesce(&mut acc, fragment);
            assert!(acc.len() >= last_len, "length decreased at {:?}", fragment);
            last_len = acc.len();
        }
    }

    #[test]
    fn test_arguments_fragments_and_snapshots() {
        let mut args = String::new();
        coalesce_arguments(&mut args, r#"{"x":"#);
        coalesce_arguments(&mut args, "1}");
        assert_eq!(args, r#"{"x":1}"#);

        coalesce_arguments(&mut args, r#"{"x":1,"y":2}"#);
        assert_eq!(args, r#"{"x":1,"y":2}"#);

        // Out-of-order duplicate of an older, shorter snapshot
        assert!(!coalesce_arguments(&mut args, r#"{"x":1}"#));
        assert_eq!(args, r#"{"x":1,"y":2}"#);
    }

    #[test]
    fn test_coalescer_text_and_reasoning() {
        let mut c = StreamCoalescer::new();
        c.process(&Interaction::assistant_with_reasoning("", "think"));
        c.process(&Interaction::assistant_with_reasoning("Hi", "thinking"));
        c.process(&text(" there"));
        c.process(&text("Hi"));

        let turn = TurnId::from("t1");
        let out = c.finish(&turn);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].text(), Some("Hi there"));
        assert_eq!(out[0].reasoning(), Some("thinking"));
        assert_eq!(out[0].turn_id, turn);
    }

    #[test]
    fn test_coalescer_tool_calls_keyed_by_id() {
        let mut c = StreamCoalescer::new();
        c.process(&Interaction::tool_call("a", "move", r#"{"dx":"#));
        c.process(&Interaction::tool_call("b", "lock", "{}"));
        c.process(&Interaction::tool_call("a", "", "3}"));
        c.process(&Interaction::tool_call("a", "move", r#"{"dx":3}"#));

        let out = c.finish(&TurnId::new());
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].tool_call_id(), Some("a"));
        assert_eq!(out[0].arguments_json(), Some(serde_json::json!({"dx": 3})));
        assert_eq!(out[1].tool_call_id(), Some("b"));
    }

    #[test]
    fn test_coalescer_attaches_last_metrics_to_first_interaction() {
        let mut c = StreamCoalescer::new();
        c.process(&text("a").with_metrics(Metrics::new(5, 1)));
        c.process(&text("ab").with_metrics(Metrics::new(5, 2)));
        c.process(&Interaction::tool_call("a", "x", "{}"));

        let out = c.finish(&TurnId::new());
        assert_eq!(out[0].metrics, Some(Metrics::new(5, 2)));
        assert_eq!(out[1].metrics, None);
    }

    #[test]
    fn test_coalescer_empty_stream_produces_nothing() {
        let c = StreamCoalescer::new();
        assert!(c.is_empty());
        assert!(c.finish(&TurnId::new()).is_empty());
    }

    #[test]
    fn test_coalescer_records_stream_error() {
        let mut c = StreamCoalescer::new();
        c.process(&Interaction::error("context length exceeded"));
        assert_eq!(c.error(), Some("context length exceeded"));
    }
}
