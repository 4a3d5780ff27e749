//! Session state management and execution

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parley_ai::{
    Agent, Body, ContextProvider, Interaction, ProviderError, ProviderExecutor, ProviderReply,
    Request, RequestConfig, RequestKind, StreamCoalescer, ToolFilter, TurnId,
};
use tokio::sync::mpsc;
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;

use crate::context::{self, ContextConfig, ContextTracker, ContextUsage, SummaryReason};
use crate::error::SessionError;
use crate::events::{Observer, ObserverSet};
use crate::handle::{CancelScope, RunningGuard, SessionHandle};
use crate::options::{RetryConfig, SessionOptions, StreamingOptions};
use crate::outcome::{Return, Stage};
use crate::tools;
use crate::turn::{RunState, TurnState};
use crate::validation;

/// How long [`Session::greet`] waits by default
pub const DEFAULT_GREETING_TIMEOUT: Duration = Duration::from_secs(30);

/// A conversation driven against one provider until it is stable
pub struct Session {
    config: RequestConfig,
    body: Body,
    executor: Arc<dyn ProviderExecutor>,
    observers: ObserverSet,
    context_provider: Option<Arc<dyn ContextProvider>>,
    context_config: ContextConfig,
    handle: SessionHandle,
    last_stable: Option<Return>,
}

enum Step {
    Update(Return),
    Done(Return),
}

impl Session {
    pub fn new(config: RequestConfig, body: Body, executor: Arc<dyn ProviderExecutor>) -> Self {
        Self {
            config,
            body,
            executor,
            observers: ObserverSet::new(),
            context_provider: None,
            context_config: ContextConfig::default(),
            handle: SessionHandle::new(),
            last_stable: None,
        }
    }

    /// Register an observer; observers are notified in registration order
    pub fn with_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Supply dynamic context injected ahead of history on every request
    pub fn with_context_provider(mut self, provider: Arc<dyn ContextProvider>) -> Self {
        self.context_provider = Some(provider);
        self
    }

    pub fn with_context_config(mut self, config: ContextConfig) -> Self {
        self.context_config = config;
        self
    }

    /// Current conversation snapshot
    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn config(&self) -> &RequestConfig {
        &self.config
    }

    /// Replace the conversation, e.g. to resume a stored one
    pub fn set_body(&mut self, body: Body) {
        self.body = body;
    }

    /// Append an interaction (usually the next user message) before a run
    pub fn push(&mut self, interaction: Interaction) {
        self.body = self.body.to_builder().push(interaction).build();
    }

    /// The most recent stable result, if any
    pub fn last_stable_return(&self) -> Option<&Return> {
        self.last_stable.as_ref()
    }

    /// Get a cloneable handle for poking the session from external code
    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    /// Cancel the current run
    pub fn cancel(&self) {
        self.handle.cancel();
    }

    /// Clear a previous cancellation so the session can run again
    pub fn reset_cancellation(&self) {
        self.handle.reset();
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_running()
    }

    pub fn context_usage(&self) -> ContextUsage {
        self.tracker().usage(&self.body)
    }

    fn tracker(&self) -> ContextTracker {
        ContextTracker::new(self.context_config.clone(), self.config.context_window)
    }

    /// Drive the conversation until it is stable, fails, or is cancelled.
    ///
    /// Failures are reported through the returned value, never as a panic or `Err`.
    pub async fn run_to_stable_result(
        &mut self,
        options: &SessionOptions,
        cancel: CancellationToken,
    ) -> Return {
        self.drive(options, cancel, RunState::blocking()).await
    }

    /// Drive the conversation, yielding intermediate updates as they happen.
    ///
    /// The last element is always the terminal [`Return`] with [`Stage::Final`].
    pub fn stream(
        &mut self,
        options: SessionOptions,
        streaming: StreamingOptions,
        cancel: CancellationToken,
    ) -> impl Stream<Item = Return> + '_ {
        async_stream::stream! {
            let (tx, mut rx) = mpsc::unbounded_channel();
            let drive = self.drive(&options, cancel, RunState::streaming(streaming, tx));
            tokio::pin!(drive);

            let final_return = loop {
                let step = tokio::select! {
                    biased;
                    Some(update) = rx.recv() => Step::Update(update),
                    ret = &mut drive => Step::Done(ret),
                };
                match step {
                    Step::Update(update) => yield update,
                    Step::Done(ret) => break ret,
                }
            };

            while let Ok(update) = rx.try_recv() {
                yield update;
            }
            yield final_return;
        }
    }

    /// Summarize history now, independent of the threshold
    pub async fn summarize(&mut self) -> crate::error::Result<()> {
        let scope = CancelScope::new(self.handle.cancel_token(), CancellationToken::new());
        self.summarize_history(SummaryReason::Manual, &scope).await
    }

    /// Ask the provider for an opening message, without tools.
    ///
    /// Returns `None` on failure or timeout; on timeout the in-flight call is
    /// cancelled and abandoned.
    pub async fn greet(
        &mut self,
        instruction: impl Into<String>,
        timeout: Duration,
    ) -> Option<Interaction> {
        let mut interactions = self.body.view(self.context_provider.as_deref());
        interactions.push(Interaction::user(instruction));
        let turn_id = TurnId::new();
        let request = Request::new(
            self.config.clone(),
            RequestKind::Greeting,
            turn_id.clone(),
            interactions,
        )
        .with_tool_filter(ToolFilter::None);
        self.observers.on_start(&request);

        let token = self.handle.cancel_token().child_token();
        let reply = match tokio::time::timeout(timeout, self.executor.exec(&request, token.clone()))
            .await
        {
            Ok(reply) => reply,
            Err(_) => {
                token.cancel();
                tracing::warn!(timeout_ms = timeout.as_millis() as u64, "Greeting timed out");
                return None;
            }
        };

        let interactions = match reply.and_then(ProviderReply::into_interactions) {
            Ok(interactions) => interactions,
            Err(e) => {
                tracing::warn!("Greeting failed: {}", e);
                return None;
            }
        };

        let text = interactions
            .iter()
            .filter(|i| i.agent == Agent::Assistant)
            .filter_map(Interaction::text)
            .collect::<Vec<_>>()
            .join("");
        if text.trim().is_empty() {
            tracing::debug!("Greeting came back empty");
            return None;
        }

        let mut greeting = Interaction::assistant(text).with_turn(turn_id);
        greeting.metrics = interactions.iter().find_map(|i| i.metrics);
        self.body = self.body.to_builder().push_new(greeting.clone()).build();
        self.observers.on_interaction_completed(&greeting);
        Some(greeting)
    }

    // --- Run loop ---

    async fn drive(
        &mut self,
        options: &SessionOptions,
        cancel: CancellationToken,
        mut run: RunState,
    ) -> Return {
        let _running = RunningGuard::new(&self.handle);
        let scope = CancelScope::new(self.handle.cancel_token(), cancel);

        match self.drive_turns(options, &scope, &mut run).await {
            Ok(ret) => ret,
            Err(error) => self.fail(error, &run),
        }
    }

    async fn drive_turns(
        &mut self,
        options: &SessionOptions,
        scope: &CancelScope,
        run: &mut RunState,
    ) -> crate::error::Result<Return> {
        validation::validate_request(
            &self.body,
            options,
            run.stream,
            self.executor.supports_streaming(),
        )?;
        let tracker = self.tracker();

        while run.turns < options.max_turns {
            if scope.is_cancelled() {
                return Err(SessionError::Cancelled);
            }
            run.turns += 1;
            let mut turn = TurnState::new(run.turns);
            self.body = self.body.to_builder().clear_new().build();
            tracing::debug!(turn = turn.number, turn_id = %turn.turn_id, "Starting turn");

            if tracker.needs_summarization(&self.body) {
                turn.summarized = true;
                match self
                    .summarize_history(SummaryReason::Threshold, scope)
                    .await
                {
                    Ok(()) => {}
                    Err(SessionError::Cancelled) => return Err(SessionError::Cancelled),
                    Err(e) => tracing::warn!("Pre-emptive summarization skipped: {}", e),
                }
            }

            self.call_provider(RequestKind::Turn, &mut turn, options, scope, run)
                .await?;

            while options.process_tools {
                let pending: Vec<Interaction> = self
                    .body
                    .pending_tool_calls()
                    .into_iter()
                    .cloned()
                    .collect();
                if pending.is_empty() {
                    break;
                }

                self.resolve_tool_calls(pending, options, scope, run).await?;
                turn.tool_passes += 1;
                run.tool_passes += 1;

                // Results of the final pass are consumed by the next turn
                if turn.tool_passes > options.max_tool_passes {
                    tracing::debug!(
                        turn = turn.number,
                        passes = turn.tool_passes,
                        "Tool pass budget spent"
                    );
                    break;
                }
                self.call_provider(RequestKind::FollowUp, &mut turn, options, scope, run)
                    .await?;
            }

            tracing::debug!(
                turn = turn.number,
                provider_calls = turn.provider_calls,
                tool_passes = turn.tool_passes,
                "Turn finished"
            );

            if self.body.is_stable() {
                return Ok(self.finish(run));
            }
            if !options.process_tools && !self.body.pending_tool_calls().is_empty() {
                let ret = Return::finished(self.body.clone(), run.turns, run.tool_passes)
                    .with_message("tool calls pending; tool processing is disabled");
                self.observers.on_final(&ret);
                return Ok(ret);
            }
        }

        Err(SessionError::MaxTurnsExceeded(options.max_turns))
    }

    fn finish(&mut self, run: &RunState) -> Return {
        let mut ret = Return::finished(self.body.clone(), run.turns, run.tool_passes);
        if let Some(schema) = self.body.json_output_schema() {
            if let Some(problem) = validation::check_output(schema, ret.last_text()) {
                tracing::warn!("{}", problem);
                ret.messages.push(problem);
            }
        }
        self.observers.on_final(&ret);
        self.last_stable = Some(ret.clone());
        ret
    }

    fn fail(&mut self, error: SessionError, run: &RunState) -> Return {
        match &error {
            SessionError::Cancelled => tracing::info!("Run cancelled"),
            SessionError::MaxTurnsExceeded(_) => tracing::warn!("{}", error),
            _ => tracing::warn!("Run failed: {}", error),
        }
        if !matches!(error, SessionError::MaxTurnsExceeded(_)) {
            self.observers.on_error(&error);
        }
        let ret = Return::failure(self.body.clone(), &error, run.turns, run.tool_passes);
        self.observers.on_final(&ret);
        ret
    }

    fn emit(&self, run: &RunState, stage: Stage, interaction: Option<Interaction>) {
        if let Some(tx) = &run.updates {
            // Receiver gone means the caller stopped listening
            let _ = tx.send(Return::update(
                stage,
                self.body.clone(),
                interaction,
                run.turns,
                run.tool_passes,
            ));
        }
    }

    fn build_request(&self, kind: RequestKind, turn_id: &TurnId, stream: bool) -> Request {
        Request::new(
            self.config.clone(),
            kind,
            turn_id.clone(),
            self.body.view(self.context_provider.as_deref()),
        )
        .with_tool_filter(self.body.tool_filter().clone())
        .with_json_output_schema(self.body.json_output_schema().cloned())
        .with_stream(stream)
    }

    // --- Provider calls ---

    /// One provider call, with a single summarize-and-retry on context overflow
    async fn call_provider(
        &mut self,
        kind: RequestKind,
        turn: &mut TurnState,
        options: &SessionOptions,
        scope: &CancelScope,
        run: &RunState,
    ) -> crate::error::Result<()> {
        loop {
            if scope.is_cancelled() {
                return Err(SessionError::Cancelled);
            }
            let request = self.build_request(kind, &turn.turn_id, run.stream);
            self.observers.on_start(&request);
            turn.provider_calls += 1;

            let outcome = if run.stream {
                self.exec_streaming(&request, &options.retry, scope, run)
                    .await
            } else {
                self.exec_once(&request, &options.retry, scope).await
            };

            match outcome {
                Ok(interactions) => {
                    self.commit(interactions, turn, run);
                    return Ok(());
                }
                Err(SessionError::Provider(e)) if e.is_context_overflow() => {
                    if turn.summarized || !self.context_config.enabled {
                        return Err(SessionError::ContextExceeded(e.to_string()));
                    }
                    turn.summarized = true;
                    tracing::warn!(turn = turn.number, "Context overflow, summarizing: {}", e);
                    match self.summarize_history(SummaryReason::Overflow, scope).await {
                        Ok(()) => continue,
                        Err(SessionError::Cancelled) => return Err(SessionError::Cancelled),
                        Err(summary_error) => {
                            tracing::warn!("Overflow recovery failed: {}", summary_error);
                            return Err(SessionError::ContextExceeded(e.to_string()));
                        }
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn exec_once(
        &self,
        request: &Request,
        retry: &RetryConfig,
        scope: &CancelScope,
    ) -> crate::error::Result<Vec<Interaction>> {
        let mut attempt = 0;
        loop {
            let token = scope.child_token();
            let reply = scope
                .guard(&token, self.executor.exec(request, token.clone()))
                .await
                .ok_or(SessionError::Cancelled)?;

            match reply.and_then(ProviderReply::into_interactions) {
                Ok(interactions) => return Ok(interactions),
                Err(e) if should_retry(&e, retry, attempt) => {
                    self.backoff(&e, retry, attempt, scope).await?;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn exec_streaming(
        &self,
        request: &Request,
        retry: &RetryConfig,
        scope: &CancelScope,
        run: &RunState,
    ) -> crate::error::Result<Vec<Interaction>> {
        let token = scope.child_token();
        let mut attempt = 0;
        let mut deltas = loop {
            let created = scope
                .guard(&token, self.executor.exec_stream(request, token.clone()))
                .await
                .ok_or(SessionError::Cancelled)?;
            match created {
                Ok(stream) => break stream,
                Err(e) if should_retry(&e, retry, attempt) => {
                    self.backoff(&e, retry, attempt, scope).await?;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        };

        let mut coalescer = StreamCoalescer::new();
        while let Some(next) = scope
            .guard(&token, deltas.next())
            .await
            .ok_or(SessionError::Cancelled)?
        {
            let delta = next?;
            coalescer.process(&delta);
            self.observers.on_delta(&delta);
            if run.wants_delta(&delta) {
                self.emit(run, Stage::Delta, Some(delta));
            }
        }

        if let Some(error) = coalescer.error() {
            return Err(ProviderError::Failed(error.to_string()).into());
        }
        tracing::trace!(deltas = coalescer.delta_count(), "Stream complete");
        let interactions = coalescer.finish(&request.turn_id);
        if interactions.is_empty() {
            return Err(ProviderError::EmptyResponse.into());
        }
        Ok(interactions)
    }

    async fn backoff(
        &self,
        error: &ProviderError,
        retry: &RetryConfig,
        attempt: u32,
        scope: &CancelScope,
    ) -> crate::error::Result<()> {
        let delay = match error {
            ProviderError::RateLimited {
                retry_after: Some(secs),
            } => Duration::from_secs(*secs).min(Duration::from_millis(retry.max_delay_ms)),
            _ => retry.delay_for_attempt(attempt),
        };
        tracing::warn!(
            attempt = attempt + 1,
            max_retries = retry.max_retries,
            delay_ms = delay.as_millis() as u64,
            "Retrying after error: {}",
            error
        );
        let token = scope.child_token();
        scope
            .guard(&token, tokio::time::sleep(delay))
            .await
            .ok_or(SessionError::Cancelled)
    }

    /// Record provider output as new interactions of the current turn
    fn commit(&mut self, interactions: Vec<Interaction>, turn: &TurnState, run: &RunState) {
        for mut interaction in interactions {
            if interaction.agent == Agent::Context {
                tracing::debug!("Dropping context interaction returned by provider");
                continue;
            }
            if interaction.is_blank() {
                tracing::debug!(agent = %interaction.agent, "Dropping blank interaction");
                continue;
            }
            interaction.turn_id = turn.turn_id.clone();

            let builder = self.body.to_builder();
            let builder = if interaction.is_tool_call() {
                builder.upsert_tool_call(interaction.clone())
            } else {
                builder.push_new(interaction.clone())
            };
            self.body = builder.build();

            self.observers.on_interaction_completed(&interaction);
            self.emit(run, Stage::InteractionCompleted, Some(interaction));
        }
    }

    // --- Tools ---

    async fn resolve_tool_calls(
        &mut self,
        pending: Vec<Interaction>,
        options: &SessionOptions,
        scope: &CancelScope,
        run: &RunState,
    ) -> crate::error::Result<()> {
        let executor = Arc::clone(&self.executor);
        let filter = self.body.tool_filter().clone();

        if options.allow_parallel_tools && pending.len() > 1 {
            if scope.is_cancelled() {
                return Err(SessionError::Cancelled);
            }
            for call in &pending {
                self.record_tool_call(call, run);
            }
            let token = scope.child_token();
            let calls = pending
                .iter()
                .map(|call| tools::execute(executor.as_ref(), call, &filter, token.clone()));
            let results = scope
                .guard(&token, futures::future::join_all(calls))
                .await
                .ok_or(SessionError::Cancelled)?;
            for result in results {
                self.record_tool_result(result, run);
            }
            return Ok(());
        }

        for call in &pending {
            if scope.is_cancelled() {
                return Err(SessionError::Cancelled);
            }
            self.record_tool_call(call, run);
            let token = scope.child_token();
            let result = scope
                .guard(
                    &token,
                    tools::execute(executor.as_ref(), call, &filter, token.clone()),
                )
                .await
                .ok_or(SessionError::Cancelled)?;
            self.record_tool_result(result, run);
        }
        Ok(())
    }

    fn record_tool_call(&mut self, call: &Interaction, run: &RunState) {
        self.observers.on_tool_call(call);
        self.body = self.body.to_builder().upsert_tool_call(call.clone()).build();
        self.emit(run, Stage::ToolCall, Some(call.clone()));
    }

    fn record_tool_result(&mut self, result: Interaction, run: &RunState) {
        self.body = self.body.to_builder().push_new(result.clone()).build();
        self.observers.on_tool_result(&result);
        self.emit(run, Stage::ToolResult, Some(result));
    }

    // --- Summarization ---

    async fn summarize_history(
        &mut self,
        reason: SummaryReason,
        scope: &CancelScope,
    ) -> crate::error::Result<()> {
        let plan = context::plan_summary(&self.body)?;
        let tokens_before = context::body_tokens(&self.body);
        self.observers.on_summarization_start(reason);

        let request =
            context::summary_request(&plan, &self.config, self.context_config.summary_max_tokens);
        self.observers.on_start(&request);
        let token = scope.child_token();
        let reply = scope
            .guard(&token, self.executor.exec(&request, token.clone()))
            .await
            .ok_or(SessionError::Cancelled)?;
        let summary = context::summary_text(reply)?;

        self.body = context::apply_summary(&self.body, &plan, &summary);
        let tokens_after = context::body_tokens(&self.body);
        tracing::info!(
            ?reason,
            tokens_before,
            tokens_after,
            summarized = plan.summarized.len(),
            "History summarized"
        );
        self.observers.on_summarization_end(tokens_before, tokens_after);
        Ok(())
    }
}

fn should_retry(error: &ProviderError, retry: &RetryConfig, attempt: u32) -> bool {
    error.is_retryable() && !error.is_context_overflow() && attempt < retry.max_retries
}
