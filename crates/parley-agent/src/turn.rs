//! Per-turn and per-run bookkeeping

use parley_ai::{Interaction, Payload, TurnId};
use tokio::sync::mpsc;

use crate::options::StreamingOptions;
use crate::outcome::Return;

/// State of one turn: the first provider call plus any follow-ups
#[derive(Debug)]
pub(crate) struct TurnState {
    pub number: u32,
    /// Shared by every interaction the turn produces
    pub turn_id: TurnId,
    /// At most one summarization per turn
    pub summarized: bool,
    pub tool_passes: u32,
    pub provider_calls: u32,
}

impl TurnState {
    pub fn new(number: u32) -> Self {
        Self {
            number,
            turn_id: TurnId::new(),
            summarized: false,
            tool_passes: 0,
            provider_calls: 0,
        }
    }
}

/// State of one run across turns
pub(crate) struct RunState {
    pub turns: u32,
    pub tool_passes: u32,
    /// Provider replies are consumed as delta streams
    pub stream: bool,
    streaming: StreamingOptions,
    /// Where intermediate returns go when the caller is streaming
    pub updates: Option<mpsc::UnboundedSender<Return>>,
}

impl RunState {
    pub fn blocking() -> Self {
        Self {
            turns: 0,
            tool_passes: 0,
            stream: false,
            streaming: StreamingOptions::default(),
            updates: None,
        }
    }

    pub fn streaming(options: StreamingOptions, updates: mpsc::UnboundedSender<Return>) -> Self {
        Self {
            turns: 0,
            tool_passes: 0,
            stream: true,
            streaming: options,
            updates: Some(updates),
        }
    }

    /// Whether a raw delta should be surfaced to the caller
    pub fn wants_delta(&self, delta: &Interaction) -> bool {
        if !self.streaming.emit_deltas {
            return false;
        }
        match &delta.payload {
            Payload::Text { content, reasoning } if content.is_empty() => {
                self.streaming.emit_reasoning || reasoning.as_deref().is_none_or(str::is_empty)
            }
            _ => true,
        }
    }
}
