//! Conversation history as immutable snapshots with a copy-on-write builder
//!
//! A [`Body`] is never mutated in place. Every change goes through a
//! [`BodyBuilder`] and produces a new snapshot, so a reader holding an older
//! `Body` never observes a half-applied update. Interactions are shared
//! between snapshots behind `Arc`, which keeps `to_builder()` cheap.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::ops::Range;
use std::sync::Arc;

use crate::types::{Agent, Interaction, Metrics, Payload};

/// Which tools the provider may call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "tools", rename_all = "snake_case")]
pub enum ToolFilter {
    /// Every tool is available
    #[default]
    All,
    /// Tools are disabled for this request
    None,
    /// Only the named tools are available
    Only(Vec<String>),
}

impl ToolFilter {
    /// Check whether a tool may be invoked
    pub fn allows(&self, name: &str) -> bool {
        match self {
            ToolFilter::All => true,
            ToolFilter::None => false,
            ToolFilter::Only(names) => names.iter().any(|n| n == name),
        }
    }

    pub fn is_disabled(&self) -> bool {
        matches!(self, ToolFilter::None)
    }
}

/// Keys selecting what an external [`ContextProvider`] should inject
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextFilter(Vec<String>);

impl ContextFilter {
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(keys.into_iter().map(Into::into).collect())
    }

    pub fn keys(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Source of dynamic context injected ahead of history at read time
pub trait ContextProvider: Send + Sync {
    /// Produce context text for the given filter, or `None` if there is nothing to inject
    fn context(&self, filter: &ContextFilter) -> Option<String>;
}

/// An immutable snapshot of conversation history plus request-scoped settings
#[derive(Debug, Clone, Default)]
pub struct Body {
    history: Arc<Vec<Arc<Interaction>>>,
    new_marks: Arc<BTreeSet<usize>>,
    tool_filter: ToolFilter,
    context_filter: Option<ContextFilter>,
    json_output_schema: Option<serde_json::Value>,
}

impl Body {
    /// Create an empty body
    pub fn new() -> Self {
        Self::default()
    }

    /// Start building a body from scratch
    pub fn builder() -> BodyBuilder {
        BodyBuilder::default()
    }

    /// Create a body holding the given interactions, none marked new
    pub fn from_interactions(interactions: impl IntoIterator<Item = Interaction>) -> Self {
        interactions
            .into_iter()
            .fold(Self::builder(), BodyBuilder::push)
            .build()
    }

    /// Copy this snapshot into a builder for modification
    pub fn to_builder(&self) -> BodyBuilder {
        BodyBuilder {
            history: self.history.as_ref().clone(),
            new_marks: self.new_marks.as_ref().clone(),
            tool_filter: self.tool_filter.clone(),
            context_filter: self.context_filter.clone(),
            json_output_schema: self.json_output_schema.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Interaction> {
        self.history.get(index).map(Arc::as_ref)
    }

    pub fn last(&self) -> Option<&Interaction> {
        self.history.last().map(Arc::as_ref)
    }

    /// Iterate over persisted history in order
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Interaction> + ExactSizeIterator {
        self.history.iter().map(Arc::as_ref)
    }

    /// Clone persisted history out of the snapshot
    pub fn to_vec(&self) -> Vec<Interaction> {
        self.iter().cloned().collect()
    }

    /// Whether the interaction at `index` was added during the current turn
    pub fn is_new(&self, index: usize) -> bool {
        self.new_marks.contains(&index)
    }

    /// Interactions marked new, in history order
    pub fn new_interactions(&self) -> Vec<&Interaction> {
        self.new_marks
            .iter()
            .filter_map(|&i| self.get(i))
            .collect()
    }

    pub fn tool_filter(&self) -> &ToolFilter {
        &self.tool_filter
    }

    pub fn context_filter(&self) -> Option<&ContextFilter> {
        self.context_filter.as_ref()
    }

    pub fn json_output_schema(&self) -> Option<&serde_json::Value> {
        self.json_output_schema.as_ref()
    }

    /// Sum of all per-interaction metrics
    pub fn metrics(&self) -> Metrics {
        self.iter()
            .filter_map(|i| i.metrics.as_ref())
            .fold(Metrics::default(), |mut acc, m| {
                acc.accumulate(m);
                acc
            })
    }

    /// Index of the last interaction produced by `agent`
    pub fn last_index_of(&self, agent: Agent) -> Option<usize> {
        self.history.iter().rposition(|i| i.agent == agent)
    }

    /// Find a tool call by id
    pub fn find_tool_call(&self, id: &str) -> Option<(usize, &Interaction)> {
        self.iter()
            .enumerate()
            .find(|(_, i)| i.tool_call_id() == Some(id))
    }

    /// Tool calls that have no matching tool result yet, in call order
    pub fn pending_tool_calls(&self) -> Vec<&Interaction> {
        let answered: HashSet<&str> = self.iter().filter_map(|i| i.tool_result_id()).collect();
        self.iter()
            .filter(|i| i.tool_call_id().is_some_and(|id| !answered.contains(id)))
            .collect()
    }

    /// Whether the provider still has to see the latest tool results
    pub fn has_unconsumed_tool_results(&self) -> bool {
        self.last().is_some_and(Interaction::is_tool_result)
    }

    /// No pending tool calls and nothing waiting on the provider
    pub fn is_stable(&self) -> bool {
        self.pending_tool_calls().is_empty() && !self.has_unconsumed_tool_results()
    }

    /// Check that every tool result follows a tool call with the same id
    pub fn results_follow_calls(&self) -> bool {
        let mut seen_calls: HashSet<&str> = HashSet::new();
        for interaction in self.iter() {
            match &interaction.payload {
                Payload::ToolCall { id, .. } => {
                    seen_calls.insert(id.as_str());
                }
                Payload::ToolResult { id, .. } if !seen_calls.contains(id.as_str()) => {
                    return false;
                }
                _ => {}
            }
        }
        true
    }

    /// History as a provider should see it, with dynamic context injected first
    pub fn view(&self, provider: Option<&dyn ContextProvider>) -> Vec<Interaction> {
        let injected = match (provider, &self.context_filter) {
            (Some(provider), Some(filter)) => provider.context(filter),
            _ => None,
        };
        injected
            .map(Interaction::context)
            .into_iter()
            .chain(self.iter().cloned())
            .collect()
    }
}

/// Builder producing new [`Body`] snapshots
#[derive(Debug, Clone, Default)]
pub struct BodyBuilder {
    history: Vec<Arc<Interaction>>,
    new_marks: BTreeSet<usize>,
    tool_filter: ToolFilter,
    context_filter: Option<ContextFilter>,
    json_output_schema: Option<serde_json::Value>,
}

impl BodyBuilder {
    /// Append an interaction to history
    pub fn push(mut self, interaction: Interaction) -> Self {
        self.append(interaction, false);
        self
    }

    /// Append an interaction and mark it as new for this turn
    pub fn push_new(mut self, interaction: Interaction) -> Self {
        self.append(interaction, true);
        self
    }

    fn append(&mut self, interaction: Interaction, mark_new: bool) {
        if interaction.agent == Agent::Context {
            tracing::debug!("Dropping injected context interaction from history");
            return;
        }
        if let Some(id) = interaction.tool_result_id() {
            if !self.history.iter().any(|i| i.tool_call_id() == Some(id)) {
                tracing::warn!("Dropping tool result '{}' with no preceding tool call", id);
                return;
            }
        }
        if mark_new {
            self.new_marks.insert(self.history.len());
        }
        self.history.push(Arc::new(interaction));
    }

    /// Forget which interactions were new
    pub fn clear_new(mut self) -> Self {
        self.new_marks.clear();
        self
    }

    /// Record a tool call exactly once, keyed by id.
    ///
    /// An existing call is replaced in place when the incoming snapshot is at
    /// least as complete; otherwise the stored one is kept.
    pub fn upsert_tool_call(mut self, call: Interaction) -> Self {
        let Some(id) = call.tool_call_id() else {
            return self.push_new(call);
        };
        let existing = self
            .history
            .iter()
            .position(|i| i.tool_call_id() == Some(id));

        match existing {
            Some(index) => {
                if argument_len(&call) >= argument_len(&self.history[index]) {
                    self.history[index] = Arc::new(call);
                }
                self
            }
            None => self.push_new(call),
        }
    }

    /// Replace `range` of history with `replacement`.
    ///
    /// New marks inside the range are dropped; marks after it are shifted.
    pub fn replace_range(mut self, range: Range<usize>, replacement: Vec<Interaction>) -> Self {
        let end = range.end.min(self.history.len());
        let start = range.start.min(end);
        let inserted = replacement
            .into_iter()
            .filter(|i| i.agent != Agent::Context)
            .map(Arc::new)
            .collect::<Vec<_>>();
        let inserted_len = inserted.len();
        self.history.splice(start..end, inserted);

        self.new_marks = self
            .new_marks
            .iter()
            .filter_map(|&i| {
                if i < start {
                    Some(i)
                } else if i >= end {
                    Some(i - (end - start) + inserted_len)
                } else {
                    None
                }
            })
            .collect();
        self
    }

    pub fn tool_filter(mut self, filter: ToolFilter) -> Self {
        self.tool_filter = filter;
        self
    }

    pub fn context_filter(mut self, filter: Option<ContextFilter>) -> Self {
        self.context_filter = filter;
        self
    }

    pub fn json_output_schema(mut self, schema: Option<serde_json::Value>) -> Self {
        self.json_output_schema = schema;
        self
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    /// Freeze into an immutable snapshot
    pub fn build(self) -> Body {
        Body {
            history: Arc::new(self.history),
            new_marks: Arc::new(self.new_marks),
            tool_filter: self.tool_filter,
            context_filter: self.context_filter,
            json_output_schema: self.json_output_schema,
        }
    }
}

fn argument_len(interaction: &Interaction) -> usize {
    match &interaction.payload {
        Payload::ToolCall { arguments, .. } => arguments.len(),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct FixedContext(&'static str);

    impl ContextProvider for FixedContext {
        fn context(&self, filter: &ContextFilter) -> Option<String> {
            Some(format!("{} [{}]", self.0, filter.keys().join(",")))
        }
    }

    #[test]
    fn test_iter_walks_backwards_with_indices() {
        let body = Body::from_interactions([
            Interaction::user("first"),
            Interaction::assistant("reply"),
            Interaction::user("second"),
        ]);
        assert_eq!(body.iter().len(), 3);
        let last_user = body
            .iter()
            .enumerate()
            .rev()
            .find(|(_, i)| i.agent == Agent::User)
            .map(|(index, _)| index);
        assert_eq!(last_user, Some(2));
        assert_eq!(body.iter().next_back().and_then(Interaction::text), Some("second"));
    }

    #[test]
    fn test_builder_does_not_touch_old_snapshot() {
        let before = Body::from_interactions([Interaction::user("hi")]);
        let after = before
            .to_builder()
            .push_new(Interaction::assistant("hello"))
            .build();

        assert_eq!(before.len(), 1);
        assert_eq!(after.len(), 2);
        assert!(before.new_interactions().is_empty());
        assert_eq!(after.new_interactions().len(), 1);
    }

    #[test]
    fn test_context_interactions_are_never_persisted() {
        let body = Body::builder()
            .push(Interaction::context("ambient"))
            .push(Interaction::user("hi"))
            .build();
        assert_eq!(body.len(), 1);
        assert_eq!(body.get(0).unwrap().agent, Agent::User);
    }

    #[test]
    fn test_view_injects_leading_context() {
        let body = Body::builder()
            .context_filter(Some(ContextFilter::new(["canvas"])))
            .push(Interaction::user("hi"))
            .build();

        let view = body.view(Some(&FixedContext("selection")));
        assert_eq!(view.len(), 2);
        assert_eq!(view[0].agent, Agent::Context);
        assert_eq!(view[0].text(), Some("selection [canvas]"));
        assert_eq!(body.len(), 1);

        let no_provider = body.view(None);
        assert_eq!(no_provider.len(), 1);
    }

    #[test]
    fn test_orphan_tool_result_is_rejected() {
        let body = Body::builder()
            .push(Interaction::user("hi"))
            .push(Interaction::tool_result("missing", "x", json!({}), false))
            .build();
        assert_eq!(body.len(), 1);
        assert!(body.results_follow_calls());
    }

    #[test]
    fn test_pending_tool_calls() {
        let body = Body::builder()
            .push(Interaction::user("go"))
            .push(Interaction::tool_call("a", "x", "{}"))
            .push(Interaction::tool_call("b", "y", "{}"))
            .push(Interaction::tool_result("a", "x", json!({"ok": true}), false))
            .build();

        let pending = body.pending_tool_calls();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].tool_call_id(), Some("b"));
        assert!(!body.is_stable());
    }

    #[test]
    fn test_unconsumed_results_are_not_stable() {
        let body = Body::builder()
            .push(Interaction::user("go"))
            .push(Interaction::tool_call("a", "x", "{}"))
            .push(Interaction::tool_result("a", "x", json!({}), false))
            .build();
        assert!(body.pending_tool_calls().is_empty());
        assert!(!body.is_stable());

        let consumed = body
            .to_builder()
            .push(Interaction::assistant("done"))
            .build();
        assert!(consumed.is_stable());
    }

    #[test]
    fn test_upsert_tool_call_is_idempotent() {
        let body = Body::builder()
            .push(Interaction::user("go"))
            .upsert_tool_call(Interaction::tool_call("a", "x", r#"{"v":"#))
            .upsert_tool_call(Interaction::tool_call("a", "x", r#"{"v":1}"#))
            .upsert_tool_call(Interaction::tool_call("a", "x", r#"{}"#))
            .build();

        assert_eq!(body.len(), 2);
        let (_, call) = body.find_tool_call("a").unwrap();
        assert_eq!(call.arguments_json(), Some(json!({"v": 1})));
    }

    #[test]
    fn test_replace_range_shifts_new_marks() {
        let body = Body::builder()
            .push(Interaction::system("sys"))
            .push_new(Interaction::user("a"))
            .push_new(Interaction::assistant("b"))
            .push(Interaction::user("c"))
            .push_new(Interaction::assistant("d"))
            .build();

        let replaced = body
            .to_builder()
            .replace_range(1..3, vec![Interaction::summary("a and b")])
            .build();

        assert_eq!(replaced.len(), 4);
        assert!(replaced.get(1).unwrap().is_summary());
        let new: Vec<_> = replaced
            .new_interactions()
            .iter()
            .filter_map(|i| i.text())
            .collect();
        assert_eq!(new, vec!["d"]);
    }

    #[test]
    fn test_metrics_sum() {
        let body = Body::from_interactions([
            Interaction::user("a").with_metrics(Metrics::new(10, 0)),
            Interaction::assistant("b").with_metrics(Metrics::new(0, 15)),
            Interaction::assistant("c"),
        ]);
        assert_eq!(body.metrics().total_tokens(), 25);
    }

    #[test]
    fn test_tool_filter() {
        assert!(ToolFilter::All.allows("x"));
        assert!(!ToolFilter::None.allows("x"));
        let only = ToolFilter::Only(vec!["move".into()]);
        assert!(only.allows("move"));
        assert!(!only.allows("lock"));
    }
}
