//! The result type surfaced by every run

use parley_ai::{Agent, Body, Interaction};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, SessionError};

/// Where in the loop a [`Return`] was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// A raw streamed fragment
    Delta,
    /// A provider interaction was committed to history
    InteractionCompleted,
    /// A tool call is about to execute
    ToolCall,
    /// A tool result was committed to history
    ToolResult,
    /// Terminal element of a run
    Final,
}

/// Outcome of a run, or an intermediate update while streaming
#[derive(Debug, Clone)]
pub struct Return {
    pub success: bool,
    /// No pending tool calls and no unconsumed tool results
    pub stable: bool,
    pub stage: Stage,
    /// Snapshot of the conversation when this was produced
    pub body: Body,
    /// The delta or interaction this update is about
    pub interaction: Option<Interaction>,
    /// Error interaction for failed runs
    pub error: Option<Interaction>,
    pub error_kind: Option<ErrorKind>,
    pub messages: Vec<String>,
    /// Turns consumed so far
    pub turns: u32,
    /// Tool passes executed so far
    pub tool_passes: u32,
}

impl Return {
    pub(crate) fn update(
        stage: Stage,
        body: Body,
        interaction: Option<Interaction>,
        turns: u32,
        tool_passes: u32,
    ) -> Self {
        let stable = body.is_stable();
        Self {
            success: true,
            stable,
            stage,
            body,
            interaction,
            error: None,
            error_kind: None,
            messages: vec![],
            turns,
            tool_passes,
        }
    }

    pub(crate) fn finished(body: Body, turns: u32, tool_passes: u32) -> Self {
        Self::update(Stage::Final, body, None, turns, tool_passes)
    }

    pub(crate) fn failure(body: Body, error: &SessionError, turns: u32, tool_passes: u32) -> Self {
        let message = error.to_string();
        Self {
            success: false,
            stable: body.is_stable(),
            stage: Stage::Final,
            body,
            interaction: None,
            error: Some(Interaction::error(message.clone())),
            error_kind: Some(error.kind()),
            messages: vec![message],
            turns,
            tool_passes,
        }
    }

    pub(crate) fn with_message(mut self, message: impl Into<String>) -> Self {
        self.messages.push(message.into());
        self
    }

    /// Whether this is the terminal element of a run
    pub fn is_final(&self) -> bool {
        self.stage == Stage::Final
    }

    pub fn is_cancelled(&self) -> bool {
        self.error_kind == Some(ErrorKind::Cancelled)
    }

    /// Interactions added during the run that produced this return
    pub fn new_interactions(&self) -> Vec<&Interaction> {
        self.body.new_interactions()
    }

    /// Text of the last assistant interaction
    pub fn last_text(&self) -> Option<&str> {
        self.body
            .iter()
            .rev()
            .find(|i| i.agent == Agent::Assistant)
            .and_then(Interaction::text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_carries_error_interaction() {
        let body = Body::from_interactions([Interaction::user("hi")]);
        let ret = Return::failure(body, &SessionError::Cancelled, 1, 0);
        assert!(!ret.success);
        assert!(ret.is_final());
        assert!(ret.is_cancelled());
        assert_eq!(ret.error.as_ref().and_then(Interaction::text), Some("Cancelled"));
        assert_eq!(ret.messages, vec!["Cancelled".to_string()]);
    }

    #[test]
    fn test_finished_reports_stability() {
        let body = Body::from_interactions([
            Interaction::user("go"),
            Interaction::tool_call("c1", "x", "{}"),
        ]);
        let ret = Return::finished(body, 1, 0);
        assert!(ret.success);
        assert!(!ret.stable);
    }

    #[test]
    fn test_last_text() {
        let body = Body::from_interactions([
            Interaction::user("q"),
            Interaction::assistant("first"),
            Interaction::user("q2"),
            Interaction::assistant("second"),
        ]);
        assert_eq!(Return::finished(body, 2, 0).last_text(), Some("second"));
    }
}
