//! Context window tracking and history summarization
//!
//! When a conversation approaches the model's context window, everything before
//! the last user message is summarized and replaced by a single summary
//! interaction. System interactions and the last user message survive verbatim.

use parley_ai::{
    Agent, Body, Interaction, Payload, ProviderError, ProviderReply, Request, RequestConfig,
    RequestKind, ToolFilter, TurnId,
};
use serde::{Deserialize, Serialize};

use crate::error::SessionError;

/// Configuration for context management
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Whether pre-emptive summarization is enabled
    pub enabled: bool,
    /// Summarize before a turn once usage reaches this percentage of the window
    pub threshold_percent: f64,
    /// Output budget for the summarization sub-request
    pub summary_max_tokens: u32,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold_percent: 80.0,
            summary_max_tokens: 4096,
        }
    }
}

/// Reason for summarization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummaryReason {
    /// Usage crossed the configured threshold before a turn
    Threshold,
    /// The provider rejected a request as too large
    Overflow,
    /// Requested by the caller
    Manual,
}

/// Context window usage of a body
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContextUsage {
    pub tokens: u32,
    pub context_window: Option<u32>,
    /// Percentage of the window in use, when the window is known
    pub percent: Option<f64>,
}

// --- Token Estimation ---

/// Estimate token count for a single interaction (chars/4 heuristic)
pub fn estimate_tokens(interaction: &Interaction) -> u32 {
    let char_count = match &interaction.payload {
        Payload::Text { content, reasoning } => {
            content.len() + reasoning.as_ref().map_or(0, String::len)
        }
        Payload::ToolCall {
            name, arguments, ..
        } => name.len() + arguments.len(),
        Payload::ToolResult { name, result, .. } => name.len() + result.to_string().len(),
        Payload::Error { content } => content.len(),
    };
    (char_count / 4) as u32
}

/// Reported token usage when available, estimated otherwise
pub fn interaction_tokens(interaction: &Interaction) -> u32 {
    interaction
        .metrics
        .map(|m| m.total_tokens())
        .unwrap_or_else(|| estimate_tokens(interaction))
}

/// Token usage of a whole body
pub fn body_tokens(body: &Body) -> u32 {
    body.iter().map(interaction_tokens).sum()
}

/// Decides when a body needs summarizing
#[derive(Debug, Clone)]
pub struct ContextTracker {
    config: ContextConfig,
    context_window: Option<u32>,
}

impl ContextTracker {
    pub fn new(config: ContextConfig, context_window: Option<u32>) -> Self {
        Self {
            config,
            context_window,
        }
    }

    pub fn usage(&self, body: &Body) -> ContextUsage {
        let tokens = body_tokens(body);
        let percent = match self.context_window {
            Some(window) if window > 0 => Some(tokens as f64 / window as f64 * 100.0),
            _ => None,
        };
        ContextUsage {
            tokens,
            context_window: self.context_window,
            percent,
        }
    }

    /// Whether usage has reached the configured threshold
    pub fn needs_summarization(&self, body: &Body) -> bool {
        if !self.config.enabled {
            return false;
        }
        self.usage(body)
            .percent
            .is_some_and(|p| p >= self.config.threshold_percent)
    }
}

// --- Planning ---

/// Which part of a body a summary replaces
#[derive(Debug, Clone)]
pub struct SummaryPlan {
    /// Index of the last user interaction, the first one kept
    pub last_user_index: usize,
    /// System interactions preceding the last user message
    pub preserved: Vec<Interaction>,
    /// Interactions that will be summarized
    pub summarized: Vec<Interaction>,
}

/// Work out what a summary would replace.
///
/// Fails when there is no user message or fewer than two interactions precede it.
pub fn plan_summary(body: &Body) -> Result<SummaryPlan, SessionError> {
    let last_user_index = body
        .iter()
        .enumerate()
        .rev()
        .find(|(_, i)| i.agent == Agent::User && !i.is_summary())
        .map(|(idx, _)| idx)
        .ok_or_else(|| SessionError::Summarization("no user message to anchor on".into()))?;

    let mut preserved = Vec::new();
    let mut summarized = Vec::new();
    for interaction in body.iter().take(last_user_index) {
        match interaction.agent {
            Agent::System => preserved.push(interaction.clone()),
            Agent::Context => {}
            _ => summarized.push(interaction.clone()),
        }
    }

    if summarized.len() < 2 {
        return Err(SessionError::Summarization(format!(
            "not enough history to summarize ({} interactions)",
            summarized.len()
        )));
    }

    Ok(SummaryPlan {
        last_user_index,
        preserved,
        summarized,
    })
}

// --- Serialization ---

const MAX_TOOL_RESULT_CHARS: usize = 2000;

/// Serialize interactions to plain text for the summarization prompt.
/// Uses a human-readable format to prevent the model from trying to "continue" the conversation.
pub fn serialize_for_summary(interactions: &[Interaction]) -> String {
    let mut out = String::new();

    for interaction in interactions {
        match &interaction.payload {
            Payload::Text { content, reasoning } => {
                let label = match interaction.agent {
                    Agent::User => "User",
                    Agent::Assistant => "Assistant",
                    Agent::System => "System",
                    _ => interaction.agent.name(),
                };
                if let Some(reasoning) = reasoning.as_deref().filter(|r| !r.is_empty()) {
                    out.push_str(&format!("[{} thinking]: {}\n", label, reasoning));
                }
                if !content.is_empty() {
                    out.push_str(&format!("[{}]: {}\n", label, content));
                }
            }
            Payload::ToolCall {
                name, arguments, ..
            } => {
                out.push_str(&format!("[Assistant tool call]: {}({})\n", name, arguments));
            }
            Payload::ToolResult {
                name,
                result,
                is_error,
                ..
            } => {
                let text = match result {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                let label = if *is_error { "Tool error" } else { "Tool result" };
                out.push_str(&format!("[{} ({})]: ", label, name));
                out.push_str(&truncate(&text, MAX_TOOL_RESULT_CHARS));
                out.push('\n');
            }
            Payload::Error { content } => {
                out.push_str(&format!("[Error]: {}\n", content));
            }
        }
    }

    out
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...(truncated)", &text[..end])
}

// --- Summarization Prompts ---

const SUMMARIZATION_SYSTEM_PROMPT: &str = "\
You are a specialized summarization model. Your task is to create a comprehensive \
yet concise summary of a conversation. This summary will replace the original \
interactions in the conversation context, so it must capture all essential information \
needed to continue the conversation effectively.";

const SUMMARIZATION_PROMPT: &str = "\
Please provide a detailed summary of this conversation so far. The summary should:

1. **Goal**: What is the user's primary objective?
2. **Progress**: What has been accomplished so far?
3. **Key Decisions**: What important decisions were made and why?
4. **Tool Activity**: Which tools were called and what did they return?
5. **Critical Context**: Any constraints, preferences, or facts that would otherwise be lost.

Format your response as a structured summary using the headers above. Be thorough but concise.

<conversation>
{conversation}
</conversation>";

const UPDATE_SUMMARIZATION_PROMPT: &str = "\
Below is an existing summary of an earlier portion of this conversation, followed by \
new interactions that occurred after that summary. Please create an updated, comprehensive \
summary that integrates both.

<previous-summary>
{previous_summary}
</previous-summary>

The updated summary should cover the goal, progress, key decisions, tool activity \
and critical context, including both previous and new information.

<new-messages>
{conversation}
</new-messages>";

/// Build the tool-disabled sub-request asking for a summary
pub fn summary_request(plan: &SummaryPlan, config: &RequestConfig, max_tokens: u32) -> Request {
    let (previous, rest) = match plan.summarized.split_first() {
        Some((first, rest)) if first.is_summary() => (first.text(), rest),
        _ => (None, plan.summarized.as_slice()),
    };
    let conversation = serialize_for_summary(rest);

    let prompt = match previous {
        Some(previous_summary) => UPDATE_SUMMARIZATION_PROMPT
            .replace("{previous_summary}", previous_summary)
            .replace("{conversation}", &conversation),
        None => SUMMARIZATION_PROMPT.replace("{conversation}", &conversation),
    };

    let mut config = config.clone();
    config.max_tokens = Some(max_tokens);

    Request::new(
        config,
        RequestKind::Summary,
        TurnId::new(),
        vec![
            Interaction::system(SUMMARIZATION_SYSTEM_PROMPT),
            Interaction::user(prompt),
        ],
    )
    .with_tool_filter(ToolFilter::None)
}

/// Extract the summary text from a summarization reply
pub fn summary_text(
    reply: std::result::Result<ProviderReply, ProviderError>,
) -> Result<String, SessionError> {
    let interactions = reply
        .and_then(ProviderReply::into_interactions)
        .map_err(|e| SessionError::Summarization(e.to_string()))?;

    let summary = interactions
        .iter()
        .filter(|i| i.agent == Agent::Assistant)
        .filter_map(Interaction::text)
        .collect::<Vec<_>>()
        .join("");

    if summary.trim().is_empty() {
        return Err(SessionError::Summarization(
            "provider returned an empty summary".into(),
        ));
    }
    Ok(summary)
}

/// Replace the planned prefix of `body` with a summary interaction
pub fn apply_summary(body: &Body, plan: &SummaryPlan, summary: &str) -> Body {
    let mut replacement = plan.preserved.clone();
    replacement.push(Interaction::summary(summary));
    if let Some(last_user) = body.get(plan.last_user_index) {
        replacement.push(last_user.clone());
    }
    body.to_builder()
        .replace_range(0..plan.last_user_index + 1, replacement)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_ai::Metrics;

    fn history() -> Body {
        Body::from_interactions([
            Interaction::system("be brief"),
            Interaction::user("first question"),
            Interaction::assistant("first answer"),
            Interaction::tool_call("c1", "lookup", r#"{"q":"x"}"#),
            Interaction::tool_result("c1", "lookup", serde_json::json!("found"), false),
            Interaction::user("second question"),
        ])
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(&Interaction::user("abcdefgh")), 2);
        assert_eq!(estimate_tokens(&Interaction::user("abc")), 0);
    }

    #[test]
    fn test_reported_metrics_win_over_estimate() {
        let i = Interaction::assistant("abcdefgh").with_metrics(Metrics::new(40, 10));
        assert_eq!(interaction_tokens(&i), 50);
    }

    #[test]
    fn test_threshold() {
        let body = Body::from_interactions([
            Interaction::user("q"),
            Interaction::assistant("a").with_metrics(Metrics::new(80, 5)),
        ]);
        let tracker = ContextTracker::new(ContextConfig::default(), Some(100));
        assert!(tracker.needs_summarization(&body));

        let roomy = ContextTracker::new(ContextConfig::default(), Some(1000));
        assert!(!roomy.needs_summarization(&body));

        let unknown = ContextTracker::new(ContextConfig::default(), None);
        assert!(!unknown.needs_summarization(&body));
        assert_eq!(unknown.usage(&body).percent, None);
    }

    #[test]
    fn test_disabled_never_summarizes() {
        let body = Body::from_interactions([
            Interaction::user("q").with_metrics(Metrics::new(500, 0)),
        ]);
        let config = ContextConfig {
            enabled: false,
            ..Default::default()
        };
        assert!(!ContextTracker::new(config, Some(100)).needs_summarization(&body));
    }

    #[test]
    fn test_plan_keeps_system_and_last_user() {
        let plan = plan_summary(&history()).unwrap();
        assert_eq!(plan.last_user_index, 5);
        assert_eq!(plan.preserved.len(), 1);
        assert_eq!(plan.summarized.len(), 4);
    }

    #[test]
    fn test_plan_requires_two_interactions() {
        let body = Body::from_interactions([
            Interaction::system("s"),
            Interaction::user("only one"),
            Interaction::user("last"),
        ]);
        assert!(matches!(
            plan_summary(&body),
            Err(SessionError::Summarization(_))
        ));
    }

    #[test]
    fn test_apply_summary() {
        let body = history();
        let plan = plan_summary(&body).unwrap();
        let out = apply_summary(&body, &plan, "we looked things up");

        assert_eq!(out.len(), 3);
        assert_eq!(out.get(0).and_then(Interaction::text), Some("be brief"));
        assert!(out.get(1).is_some_and(Interaction::is_summary));
        assert_eq!(
            out.get(2).and_then(Interaction::text),
            Some("second question")
        );
    }

    #[test]
    fn test_summary_request_is_tool_free() {
        let plan = plan_summary(&history()).unwrap();
        let request = summary_request(&plan, &RequestConfig::new("p", "m"), 1024);
        assert_eq!(request.kind, RequestKind::Summary);
        assert!(request.tool_filter.is_disabled());
        assert_eq!(request.config.max_tokens, Some(1024));
        let prompt = request.last_user_text().unwrap();
        assert!(prompt.contains("[User]: first question"));
        assert!(prompt.contains("[Tool result (lookup)]: found"));
    }

    #[test]
    fn test_summary_request_updates_previous_summary() {
        let body = Body::from_interactions([
            Interaction::summary("earlier work"),
            Interaction::assistant("more"),
            Interaction::user("next"),
        ]);
        let plan = plan_summary(&body).unwrap();
        let request = summary_request(&plan, &RequestConfig::default(), 1024);
        let prompt = request.last_user_text().unwrap();
        assert!(prompt.contains("<previous-summary>"));
        assert!(prompt.contains("earlier work"));
    }

    #[test]
    fn test_summary_text_rejects_blank() {
        let reply = ProviderReply::new(vec![Interaction::assistant("  ")]);
        assert!(summary_text(Ok(reply)).is_err());
        let reply = ProviderReply::new(vec![Interaction::assistant("short")]);
        assert_eq!(summary_text(Ok(reply)).unwrap(), "short");
    }

    #[test]
    fn test_truncate_respects_char_boundary() {
        let s = "é".repeat(1500);
        let t = truncate(&s, 2001);
        assert!(t.ends_with("...(truncated)"));
    }
}
