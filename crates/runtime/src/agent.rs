//! The orchestration loop.
//!
//! One user query runs as a small state machine:
//!
//! ```text
//! AwaitingModel ──calls──▶ ExecutingTools ──results──▶ AwaitingModel
//!      │ no calls                                          │ iteration limit
//!      ▼                                                   ▼
//!     Done ◀────────────── final answer ────────── TerminatedMaxIter
//! ```
//!
//! Transport failures, provider error events and cancellation end in
//! `Fatal`, which is returned to the caller as an [`Error`].

use crate::compaction::{Compactor, ProviderSummarizer};
use crate::config::RuntimeConfig;
use crate::executor::Executor;
use crate::history::{History, HistoryCache};
use crate::model::{Message, MessageKind, StopReason, ToolCall, ToolChoice, ToolResult, ToolSpec};
use crate::provider::{
    AssembledResponse, Provider, ProviderEvent, ProviderRequest, ResponseAssembler,
    send_with_retry, text_tool_instructions,
};
use crate::repair::repair;
use crate::session::{SessionLocks, SessionStore, TurnState};
use crate::tools::{ToolAllowList, ToolRegistry};
use crate::{Error, Result};
use futures_util::StreamExt;
use policy::Policy;
use std::sync::{Arc, Mutex, PoisonError};
use storage::SessionId;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 64;

const TOOLS_DISABLED_NOTICE: &str = "Tool use is now disabled for this request because it reached \
its step limit. Answer the user directly with what you have learned so far, and say clearly what \
is still unfinished. Do not claim results from tools you did not receive.";

const MAX_ITERATIONS_FALLBACK: &str = "I reached the limit of tool steps for this request before I \
could finish. Please narrow the request or ask me to continue.";

const EMPTY_RESPONSE_FALLBACK: &str = "The model returned an empty response.";

/// Events emitted by [`Agent::process_stream`].
///
/// `Complete` is always the last event of a successful query and `Error`
/// the last event of a failed one.
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeEvent {
    Text(String),
    ToolCall(ToolCall),
    ToolResult(ToolResult),
    Status(String),
    Error(String),
    Complete { text: String },
}

/// States of the orchestration loop.
#[derive(Debug)]
pub enum LoopState {
    AwaitingModel,
    ExecutingTools(Vec<ToolCall>),
    Done(String),
    TerminatedMaxIter,
    Fatal(Error),
}

impl LoopState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::AwaitingModel => "awaiting_model",
            Self::ExecutingTools(_) => "executing_tools",
            Self::Done(_) => "done",
            Self::TerminatedMaxIter => "terminated_max_iter",
            Self::Fatal(_) => "fatal",
        }
    }
}

#[derive(Default)]
struct Emitter {
    tx: Option<mpsc::Sender<RuntimeEvent>>,
}

impl Emitter {
    async fn emit(&self, event: RuntimeEvent) {
        if let Some(tx) = &self.tx
            && tx.send(event).await.is_err()
        {
            debug!("event receiver dropped");
        }
    }
}

// Everything one query needs while the loop runs.
struct Run<'a> {
    session_id: SessionId,
    history: History,
    turn: TurnState,
    allow: ToolAllowList,
    tools: Vec<ToolSpec>,
    instructions: Option<String>,
    emitter: &'a Emitter,
    stream: bool,
    cancel: Option<&'a CancellationToken>,
}

struct Inner<P, R, S> {
    provider: P,
    registry: R,
    store: S,
    policy: Policy,
    config: RuntimeConfig,
    locks: SessionLocks,
    histories: Mutex<HistoryCache>,
}

/// Builder for an [`Agent`].
pub struct AgentBuilder<P, R, S> {
    provider: P,
    registry: R,
    store: S,
    policy: Policy,
    config: RuntimeConfig,
}

impl<P: Provider, R: ToolRegistry, S: SessionStore> AgentBuilder<P, R, S> {
    pub fn new(provider: P, registry: R, store: S) -> Self {
        Self {
            provider,
            registry,
            store,
            policy: Policy::permissive(),
            config: RuntimeConfig::default(),
        }
    }

    pub fn policy(mut self, policy: Policy) -> Self {
        self.policy = policy;
        self
    }

    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<Agent<P, R, S>> {
        self.config.validate()?;
        self.policy.validate()?;
        Ok(Agent {
            inner: Arc::new(Inner {
                provider: self.provider,
                registry: self.registry,
                store: self.store,
                policy: self.policy,
                locks: SessionLocks::new(),
                histories: Mutex::new(HistoryCache::new(self.config.max_cached_sessions)),
                config: self.config,
            }),
        })
    }
}

/// Runs user queries against a provider, a tool registry and a session store.
///
/// Cloning is cheap; clones share sessions, locks and cached histories.
pub struct Agent<P, R, S> {
    inner: Arc<Inner<P, R, S>>,
}

impl<P, R, S> Clone for Agent<P, R, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: Provider, R: ToolRegistry, S: SessionStore> Agent<P, R, S> {
    pub fn builder(provider: P, registry: R, store: S) -> AgentBuilder<P, R, S> {
        AgentBuilder::new(provider, registry, store)
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// Tools the model may call right now.
    pub fn allow_list(&self) -> ToolAllowList {
        ToolAllowList::from_registry(&self.inner.registry, &self.inner.policy)
    }

    /// Run a query to completion and return the final answer.
    pub async fn process(&self, query: &str, session_id: SessionId) -> Result<String> {
        self.run_query(query, session_id, &Emitter::default(), false, None)
            .await
    }

    /// Like [`process`](Self::process), stopping early when `cancel` fires.
    pub async fn process_with_cancel(
        &self,
        query: &str,
        session_id: SessionId,
        cancel: &CancellationToken,
    ) -> Result<String> {
        self.run_query(query, session_id, &Emitter::default(), false, Some(cancel))
            .await
    }

    /// The repaired history of a session.
    pub async fn history(&self, session_id: SessionId) -> Result<Vec<Message>> {
        let _guard = self
            .inner
            .locks
            .acquire(session_id, self.inner.config.on_busy)
            .await?;
        let allow = self.allow_list();
        let history = self.checkout(session_id, &allow).await?;
        let messages = history.as_slice().to_vec();
        self.checkin(session_id, history);
        Ok(messages)
    }

    /// Mark a session as ended and drop its cached history.
    pub async fn end_session(&self, session_id: SessionId) -> Result<()> {
        let _guard = self
            .inner
            .locks
            .acquire(session_id, self.inner.config.on_busy)
            .await?;
        self.inner
            .histories
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take(&session_id);
        self.inner.store.end(session_id).await
    }

    async fn run_query(
        &self,
        query: &str,
        session_id: SessionId,
        emitter: &Emitter,
        stream: bool,
        cancel: Option<&CancellationToken>,
    ) -> Result<String> {
        let inner = &*self.inner;
        let _guard = inner.locks.acquire(session_id, inner.config.on_busy).await?;

        let allow = self.allow_list();
        let history = self.checkout(session_id, &allow).await?;
        let tools = allow.filter_specs(inner.registry.specs());
        let instructions = (!inner.provider.supports_native_tool_calls() && !tools.is_empty())
            .then(|| text_tool_instructions(&tools));

        let used_ids: Vec<String> = history
            .iter()
            .flat_map(|m| m.tool_calls.iter().map(|c| c.id.clone()))
            .collect();
        let mut run = Run {
            session_id,
            history,
            turn: TurnState::new(inner.config.repeat_threshold, used_ids),
            allow,
            tools,
            instructions,
            emitter,
            stream,
            cancel,
        };
        info!(session = %session_id, tools = run.tools.len(), "query started");

        let outcome = self.drive(&mut run, query).await;
        let iterations = run.turn.iteration;
        self.checkin(session_id, run.history);

        match &outcome {
            Ok(_) => info!(session = %session_id, iterations, "query finished"),
            Err(err) => warn!(session = %session_id, iterations, error = %err, "query failed"),
        }
        outcome
    }

    async fn checkout(&self, session_id: SessionId, allow: &ToolAllowList) -> Result<History> {
        let cached = self
            .inner
            .histories
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take(&session_id);
        let messages = match cached {
            Some(history) => history.into_messages(),
            None => self.inner.store.load(session_id).await?,
        };
        let (messages, report) = repair(messages, allow);
        if !report.is_clean() {
            info!(
                session = %session_id,
                synthesized = report.synthesized.len(),
                dropped_calls = report.dropped_calls.len(),
                dropped_results = report.dropped_results.len(),
                "session history repaired"
            );
        }
        Ok(History::from_messages(messages))
    }

    fn checkin(&self, session_id: SessionId, history: History) {
        self.inner
            .histories
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .put(session_id, history);
    }

    async fn drive(&self, run: &mut Run<'_>, query: &str) -> Result<String> {
        if run.history.is_empty()
            && let Some(prompt) = &self.inner.config.system_prompt
        {
            self.append(run, Message::system(prompt.clone())).await?;
        }
        self.append(run, Message::user(query)).await?;

        let mut state = LoopState::AwaitingModel;
        loop {
            debug!(state = state.name(), iteration = run.turn.iteration, "loop state");
            state = match state {
                LoopState::Done(text) => return Ok(text),
                LoopState::Fatal(err) => return Err(err),
                LoopState::AwaitingModel => self
                    .await_model(run)
                    .await
                    .unwrap_or_else(LoopState::Fatal),
                LoopState::ExecutingTools(calls) => self
                    .execute_tools(run, calls)
                    .await
                    .unwrap_or_else(LoopState::Fatal),
                LoopState::TerminatedMaxIter => self
                    .final_answer(run)
                    .await
                    .unwrap_or_else(LoopState::Fatal),
            };
        }
    }

    async fn await_model(&self, run: &mut Run<'_>) -> Result<LoopState> {
        if run.turn.iteration >= self.inner.config.max_iterations {
            return Ok(LoopState::TerminatedMaxIter);
        }
        self.compact_if_needed(run).await;
        run.turn.iteration += 1;

        let response = self.request(run, ToolChoice::Auto).await?;
        if let Some(fatal) = self.interrupted(run, &response).await? {
            return Ok(fatal);
        }

        let native = self.inner.provider.supports_native_tool_calls();
        let calls = run.turn.detector.detect(&response, native, &run.allow).calls;
        let message = Message::assistant_with_calls(response.text.clone(), calls.clone())
            .with_stop(response.stop.clone());
        self.append(run, message).await?;

        if calls.is_empty() {
            let text = self
                .non_empty(run, response.text, EMPTY_RESPONSE_FALLBACK)
                .await;
            return Ok(LoopState::Done(text));
        }
        debug!(calls = calls.len(), iteration = run.turn.iteration, "model requested tools");
        Ok(LoopState::ExecutingTools(calls))
    }

    async fn execute_tools(&self, run: &mut Run<'_>, calls: Vec<ToolCall>) -> Result<LoopState> {
        for call in &calls {
            run.emitter.emit(RuntimeEvent::ToolCall(call.clone())).await;
        }

        let inner = &*self.inner;
        let executor = Executor::new(&inner.registry, &run.allow, &inner.config);
        let results = executor.execute_batch(&calls, &mut run.turn.breaker).await;

        for result in results {
            run.emitter.emit(RuntimeEvent::ToolResult(result.clone())).await;
            self.append(run, Message::tool(result)).await?;
        }
        Ok(LoopState::AwaitingModel)
    }

    async fn final_answer(&self, run: &mut Run<'_>) -> Result<LoopState> {
        warn!(
            session = %run.session_id,
            iterations = run.turn.iteration,
            "iteration limit reached, requesting final answer without tools"
        );
        run.emitter
            .emit(RuntimeEvent::Status("iteration limit reached; tools disabled".into()))
            .await;
        let notice = Message::user(TOOLS_DISABLED_NOTICE).with_kind(MessageKind::Notice);
        self.append(run, notice).await?;
        self.compact_if_needed(run).await;

        let response = self.request(run, ToolChoice::None).await?;
        if let Some(fatal) = self.interrupted(run, &response).await? {
            return Ok(fatal);
        }
        if !response.native_calls.is_empty() {
            debug!(
                calls = response.native_calls.len(),
                "ignoring tool calls in final answer"
            );
        }

        let text = self
            .non_empty(run, response.text, MAX_ITERATIONS_FALLBACK)
            .await;
        self.append(run, Message::assistant(text.clone()).with_stop(response.stop))
            .await?;
        Ok(LoopState::Done(text))
    }

    // Records an aborted or failed response and maps it to a fatal state.
    async fn interrupted(
        &self,
        run: &mut Run<'_>,
        response: &AssembledResponse,
    ) -> Result<Option<LoopState>> {
        let err = match &response.stop {
            StopReason::Aborted => Error::Cancelled,
            StopReason::Error(detail) => Error::ProviderStream(detail.clone()),
            _ => return Ok(None),
        };
        let message = Message::assistant(response.text.clone()).with_stop(response.stop.clone());
        self.append(run, message).await?;
        Ok(Some(LoopState::Fatal(err)))
    }

    async fn non_empty(&self, run: &Run<'_>, text: String, fallback: &str) -> String {
        if !text.trim().is_empty() {
            return text;
        }
        run.emitter.emit(RuntimeEvent::Text(fallback.to_string())).await;
        fallback.to_string()
    }

    async fn request(&self, run: &Run<'_>, choice: ToolChoice) -> Result<AssembledResponse> {
        let inner = &*self.inner;
        let instructions = match choice {
            ToolChoice::Auto => run.instructions.as_deref(),
            ToolChoice::None => None,
        };
        let request = ProviderRequest {
            messages: run.history.as_slice(),
            tools: &run.tools,
            tool_choice: choice,
            stream: run.stream,
            tool_instructions: instructions,
        };

        let sending = send_with_retry(&inner.provider, request, &inner.config.retry);
        let mut events = match run.cancel {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => return Ok(ResponseAssembler::new().abort()),
                sent = sending => sent?,
            },
            None => sending.await?,
        };

        let mut assembler = ResponseAssembler::new();
        loop {
            let next = match run.cancel {
                Some(token) => tokio::select! {
                    biased;
                    _ = token.cancelled() => return Ok(assembler.abort()),
                    next = events.next() => next,
                },
                None => events.next().await,
            };
            let Some(event) = next else { break };
            let event = event.unwrap_or_else(|err| {
                warn!(error = %err, "provider stream failed");
                ProviderEvent::Error(err.to_string())
            });

            match &event {
                ProviderEvent::Text(text) => run.emitter.emit(RuntimeEvent::Text(text.clone())).await,
                ProviderEvent::Status(status) => {
                    run.emitter.emit(RuntimeEvent::Status(status.clone())).await
                }
                _ => {}
            }
            let finished = matches!(event, ProviderEvent::Error(_) | ProviderEvent::Complete { .. });
            assembler.push(&event);
            if finished {
                break;
            }
        }
        Ok(assembler.finish())
    }

    async fn compact_if_needed(&self, run: &mut Run<'_>) {
        let inner = &*self.inner;
        let compactor = Compactor::new(inner.config.context.clone());
        if !compactor.needs_compaction(&run.history) {
            return;
        }
        run.emitter
            .emit(RuntimeEvent::Status("compacting context".into()))
            .await;
        let summarizer = ProviderSummarizer::new(&inner.provider, &inner.config.retry);
        compactor
            .compact(&mut run.history, &summarizer, &run.tools, &run.allow)
            .await;
    }

    async fn append(&self, run: &mut Run<'_>, message: Message) -> Result<()> {
        self.inner.store.append(run.session_id, &message).await?;
        run.history.push(message);
        Ok(())
    }
}

impl<P, R, S> Agent<P, R, S>
where
    P: Provider + 'static,
    R: ToolRegistry + 'static,
    S: SessionStore + 'static,
{
    /// Run a query on a background task, streaming events as they happen.
    pub fn process_stream(
        &self,
        query: impl Into<String>,
        session_id: SessionId,
        cancel: Option<CancellationToken>,
    ) -> ReceiverStream<RuntimeEvent> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let agent = self.clone();
        let query = query.into();

        tokio::spawn(async move {
            let emitter = Emitter {
                tx: Some(tx.clone()),
            };
            let outcome = agent
                .run_query(&query, session_id, &emitter, true, cancel.as_ref())
                .await;
            let last = match outcome {
                Ok(text) => RuntimeEvent::Complete { text },
                Err(err) => RuntimeEvent::Error(err.to_string()),
            };
            if tx.send(last).await.is_err() {
                debug!("event receiver dropped before completion");
            }
        });

        ReceiverStream::new(rx)
    }
}
