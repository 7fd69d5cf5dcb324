//! Turn loop: stream a turn, run its tools, repeat until the model stops.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bon::Builder;
use futures::StreamExt;
use tracing::{debug, info, warn};

use crate::config::{EngineConfig, UnknownStopPolicy};
use crate::error::{EngineError, Result};
use crate::provider::{self, ProviderRequest, StreamingProvider};
use crate::tools::ToolCatalog;
use crate::types::{estimate_tokens, ModelMessage, StopReason, StreamSignal, Usage, UsageSummary};

use super::accumulator::{AccumulatedTurn, ContentBlockAccumulator, LiveDelta};
use super::approvals::ApprovalGate;
use super::citations::{Citation, CitationAccumulator};
use super::context::ExecutionContext;
use super::emitter::{EventCallback, EventEmitter};
use super::events::AgentEventPayload;
use super::files::{
    file_ids_by_name, search_cited_files, validate_attachments, CitedFile, FileResolver,
    SemanticSearch,
};
use super::persistence::{EventSink, NoopEventSink, PersistenceHandle};
use super::sequencer::{InMemorySequencer, SequenceSource};
use super::tool_phase::ToolExecutionCoordinator;
use super::types::{RunResult, RunStatus};

pub const MAX_TURNS_NOTICE: &str =
    "I reached the maximum number of steps for this request before finishing. Please ask me to continue if you need more.";
pub const TRUNCATION_NOTICE: &str =
    "My response was cut off because it reached the maximum length. Please ask me to continue.";
pub const REFUSAL_REASON: &str = "Response refused due to content policy violation";

/// Request payload to start a run.
#[derive(Clone, Builder)]
pub struct RunRequest {
    #[builder(into)]
    pub session_id: String,
    #[builder(into)]
    pub user_id: Option<String>,
    /// Prior conversation. On resume after a pause, pass the previous
    /// result's `messages` back unchanged.
    #[builder(default)]
    pub messages: Vec<ModelMessage>,
    /// New user text appended to `messages` before the first turn.
    #[builder(into)]
    pub query: Option<String>,
    /// File ids attached by the user. They must all resolve.
    #[builder(default)]
    pub attachments: Vec<String>,
    /// Overrides the configured thinking setting for this run.
    pub thinking: Option<bool>,
    pub callback: Option<EventCallback>,
}

impl RunRequest {
    /// Text used for semantic file search: the query, else the last user text.
    fn search_text(&self, messages: &[ModelMessage]) -> String {
        if let Some(query) = self.query.as_ref().filter(|q| !q.trim().is_empty()) {
            return query.clone();
        }
        messages
            .iter()
            .rev()
            .find(|m| m.role == crate::types::Role::User && !m.text().is_empty())
            .map(ModelMessage::text)
            .unwrap_or_default()
    }
}

/// One streamed provider turn, fully accumulated.
struct StreamedTurn {
    message_id: String,
    content: AccumulatedTurn,
    stop_reason: Option<StopReason>,
    usage: Usage,
}

/// How a run ended, before the result is assembled.
enum TurnState {
    Done {
        message_id: String,
        text: String,
    },
    Paused {
        message_id: String,
        text: String,
    },
    Failed(EngineError),
}

/// Streaming tool-orchestration engine.
///
/// The durable-sink worker runs on the tokio runtime of the first
/// [`run`](Self::run) (or [`start`](Self::start)). If that runtime shuts
/// down, the next run spawns a fresh worker on its own runtime; jobs queued
/// to the old worker but not yet written are lost.
pub struct TurnLoop {
    config: EngineConfig,
    provider: Arc<dyn StreamingProvider>,
    coordinator: ToolExecutionCoordinator,
    sequencer: Arc<dyn SequenceSource>,
    sink: Arc<dyn EventSink>,
    persistence: Mutex<Option<PersistenceHandle>>,
    files: Option<Arc<dyn FileResolver>>,
    search: Option<Arc<dyn SemanticSearch>>,
}

impl TurnLoop {
    pub fn new(config: EngineConfig, provider: Arc<dyn StreamingProvider>, catalog: ToolCatalog) -> Self {
        let coordinator = ToolExecutionCoordinator::new(Arc::new(catalog))
            .with_approval_timeout(Duration::from_secs(config.approval_timeout_secs));
        Self {
            config,
            provider,
            coordinator,
            sequencer: Arc::new(InMemorySequencer::new()),
            sink: Arc::new(NoopEventSink),
            persistence: Mutex::new(None),
            files: None,
            search: None,
        }
    }

    /// Build with the provider selected by configuration.
    pub fn from_config(config: EngineConfig, catalog: ToolCatalog) -> Result<Self> {
        config.validate()?;
        let provider = provider::create_provider(&config)?;
        Ok(Self::new(config, provider, catalog))
    }

    pub fn with_approval_gate(mut self, gate: Arc<dyn ApprovalGate>) -> Self {
        self.coordinator = self.coordinator.with_gate(gate);
        self
    }

    pub fn with_sequencer(mut self, sequencer: Arc<dyn SequenceSource>) -> Self {
        self.sequencer = sequencer;
        self
    }

    /// Durable sink. Must be set before the first run.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self.persistence = Mutex::new(None);
        self
    }

    pub fn with_file_resolver(mut self, files: Arc<dyn FileResolver>) -> Self {
        self.files = Some(files);
        self
    }

    pub fn with_semantic_search(mut self, search: Arc<dyn SemanticSearch>) -> Self {
        self.search = Some(search);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Spawn the durable-sink worker on the current runtime if it is not
    /// running yet. Must be called from within a tokio runtime.
    pub fn start(&self) {
        let _ = self.persistence();
    }

    fn persistence(&self) -> PersistenceHandle {
        let mut slot = self
            .persistence
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(handle) = slot.as_ref().filter(|handle| !handle.is_closed()) {
            return handle.clone();
        }
        if slot.is_some() {
            warn!("persistence worker stopped; spawning a new one");
        }
        let handle = PersistenceHandle::spawn(self.sink.clone());
        *slot = Some(handle.clone());
        handle
    }

    /// Run the loop to completion, pause, or failure.
    pub async fn run(&self, request: RunRequest) -> RunResult {
        let mut messages = request.messages.clone();
        if let Some(query) = request.query.as_ref().filter(|q| !q.trim().is_empty()) {
            messages.push(ModelMessage::user(query.clone()));
        }

        let session_id = request.session_id.trim().to_string();
        if session_id.is_empty() {
            warn!("run rejected: missing session id");
            return RunResult::failed(EngineError::MissingSession.to_string(), messages);
        }

        let emitter = EventEmitter::new(
            session_id.clone(),
            self.sequencer.clone(),
            request.callback.clone(),
            self.persistence(),
        );
        let mut ctx = ExecutionContext::new(session_id, request.user_id.clone(), emitter);
        let thinking = request.thinking.unwrap_or(self.config.thinking.enabled);
        info!(
            session_id = %ctx.session_id,
            provider = self.provider.provider_name(),
            model = %self.config.model,
            thinking,
            "run started"
        );

        let manual_files = match self.validate_manual_attachments(&request, &ctx).await {
            Ok(files) => files,
            Err(err) => return self.fail(&ctx, err, messages).await,
        };

        let mut usage = UsageSummary::default();
        let mut citations = CitationAccumulator::new();
        let mut executed_tools = Vec::new();

        let state = loop {
            ctx.turns += 1;
            let turn = match self.stream_turn(&ctx, &messages, thinking).await {
                Ok(turn) => turn,
                Err(err) => break TurnState::Failed(err),
            };
            let reasoning_tokens = estimate_tokens(&turn.content.reasoning_text());
            usage.add_turn(&turn.usage, reasoning_tokens);
            let text = turn.content.text();
            citations.push_text(&text);
            citations.extend_fragments(turn.content.citations.iter().cloned());

            let assistant = turn.content.to_assistant_message();
            if !assistant.content.is_empty() {
                messages.push(assistant);
            }

            let stop = match turn.stop_reason.clone() {
                Some(stop) => stop,
                None => {
                    warn!(
                        session_id = %ctx.session_id,
                        turn = ctx.turns,
                        "stream ended without a stop reason; treating as end_turn"
                    );
                    StopReason::EndTurn
                }
            };
            debug!(
                session_id = %ctx.session_id,
                turn = ctx.turns,
                stop_reason = %stop,
                blocks = turn.content.blocks.len(),
                "turn finished"
            );

            match stop {
                StopReason::EndTurn | StopReason::StopSequence => {
                    self.emit_message(&ctx, &turn.message_id, text.clone(), stop)
                        .await;
                    break TurnState::Done {
                        message_id: turn.message_id,
                        text,
                    };
                }
                StopReason::MaxTokens => {
                    self.emit_message(&ctx, &turn.message_id, TRUNCATION_NOTICE.to_string(), stop)
                        .await;
                    break TurnState::Done {
                        message_id: turn.message_id,
                        text: TRUNCATION_NOTICE.to_string(),
                    };
                }
                StopReason::Refusal => {
                    self.emit_message(&ctx, &turn.message_id, text.clone(), stop)
                        .await;
                    warn!(session_id = %ctx.session_id, turn = ctx.turns, "model refused the request");
                    self.emit(
                        &ctx,
                        AgentEventPayload::ContentRefused {
                            message_id: turn.message_id.clone(),
                            reason: REFUSAL_REASON.to_string(),
                            content: text.clone(),
                        },
                    )
                    .await;
                    break TurnState::Done {
                        message_id: turn.message_id,
                        text,
                    };
                }
                StopReason::PauseTurn => {
                    self.emit(
                        &ctx,
                        AgentEventPayload::TurnPaused {
                            message_id: turn.message_id.clone(),
                            turn: ctx.turns,
                        },
                    )
                    .await;
                    break TurnState::Paused {
                        message_id: turn.message_id,
                        text,
                    };
                }
                StopReason::ToolUse => {
                    let invocations = turn.content.tool_invocations();
                    if invocations.is_empty() {
                        warn!(
                            session_id = %ctx.session_id,
                            turn = ctx.turns,
                            "tool_use stop without tool blocks; treating as end_turn"
                        );
                        self.emit_message(&ctx, &turn.message_id, text.clone(), StopReason::EndTurn)
                            .await;
                        break TurnState::Done {
                            message_id: turn.message_id,
                            text,
                        };
                    }
                    let outcome = self.coordinator.execute_batch(&invocations, &mut ctx).await;
                    executed_tools.extend(outcome.executed);
                    messages.push(ModelMessage::tool_results(outcome.results));

                    if ctx.turns >= self.config.max_turns {
                        warn!(
                            session_id = %ctx.session_id,
                            max_turns = self.config.max_turns,
                            "maximum turns reached; stopping"
                        );
                        self.emit_message(&ctx, &turn.message_id, MAX_TURNS_NOTICE.to_string(), stop)
                            .await;
                        break TurnState::Done {
                            message_id: turn.message_id,
                            text: MAX_TURNS_NOTICE.to_string(),
                        };
                    }
                }
                StopReason::Other(raw) => match self.config.unknown_stop_reason {
                    UnknownStopPolicy::EndTurn => {
                        warn!(
                            session_id = %ctx.session_id,
                            turn = ctx.turns,
                            stop_reason = %raw,
                            "unrecognised stop reason; treating as end_turn"
                        );
                        self.emit_message(&ctx, &turn.message_id, text.clone(), StopReason::EndTurn)
                            .await;
                        break TurnState::Done {
                            message_id: turn.message_id,
                            text,
                        };
                    }
                    UnknownStopPolicy::Fail => {
                        break TurnState::Failed(EngineError::UnknownStopReason(raw));
                    }
                },
            }
        };

        let mut result = match state {
            TurnState::Failed(err) => self.fail(&ctx, err, messages).await,
            TurnState::Paused { message_id, text } => {
                info!(session_id = %ctx.session_id, turns = ctx.turns, "run paused");
                let mut result = RunResult::new(RunStatus::Paused, messages);
                result.message_id = Some(message_id);
                result.text = text;
                result
            }
            TurnState::Done { message_id, text } => {
                let (citations, cited_files) = self
                    .resolve_cited_files(&ctx, &request, &messages, manual_files, &citations)
                    .await;
                self.emit(
                    &ctx,
                    AgentEventPayload::Complete {
                        message_id: Some(message_id.clone()),
                        turns: ctx.turns,
                        usage,
                        citations: citations.clone(),
                        cited_files: cited_files.clone(),
                    },
                )
                .await;
                info!(
                    session_id = %ctx.session_id,
                    turns = ctx.turns,
                    tools = executed_tools.len(),
                    output_tokens = usage.output_tokens,
                    "run completed"
                );
                let mut result = RunResult::new(RunStatus::Completed, messages);
                result.message_id = Some(message_id);
                result.text = text;
                result.citations = citations;
                result.cited_files = cited_files;
                result
            }
        };
        result.usage = usage;
        result.turns = ctx.turns;
        result.executed_tools = executed_tools;
        result
    }

    async fn validate_manual_attachments(
        &self,
        request: &RunRequest,
        ctx: &ExecutionContext,
    ) -> Result<Vec<CitedFile>> {
        if request.attachments.is_empty() {
            return Ok(Vec::new());
        }
        let Some(files) = &self.files else {
            return Err(EngineError::Validation(
                "attachments supplied but no file resolver is configured".into(),
            ));
        };
        let resolved =
            validate_attachments(files.as_ref(), &request.attachments, ctx.user_id.as_deref())
                .await?;
        debug!(session_id = %ctx.session_id, attachments = resolved.len(), "attachments validated");
        Ok(resolved)
    }

    /// Manual attachments win outright. Otherwise semantic search supplies
    /// the files when enabled and a user is known.
    async fn resolve_cited_files(
        &self,
        ctx: &ExecutionContext,
        request: &RunRequest,
        messages: &[ModelMessage],
        manual_files: Vec<CitedFile>,
        citations: &CitationAccumulator,
    ) -> (Vec<Citation>, Option<Vec<CitedFile>>) {
        let files = if !manual_files.is_empty() {
            manual_files
        } else {
            match (
                self.config.file_search.enabled,
                ctx.user_id.as_deref(),
                &self.search,
                &self.files,
            ) {
                (true, Some(user_id), Some(search), Some(resolver)) => {
                    let query = request.search_text(messages);
                    search_cited_files(
                        search.as_ref(),
                        resolver.as_ref(),
                        user_id,
                        &query,
                        &self.config.file_search,
                    )
                    .await
                }
                (true, Some(_), _, _) => {
                    warn!(
                        session_id = %ctx.session_id,
                        "file search enabled but no search service is configured"
                    );
                    Vec::new()
                }
                _ => Vec::new(),
            }
        };
        let resolution = citations.resolve(&file_ids_by_name(&files));
        let cited_files = (!files.is_empty()).then_some(files);
        (resolution.citations, cited_files)
    }

    async fn stream_turn(
        &self,
        ctx: &ExecutionContext,
        messages: &[ModelMessage],
        thinking: bool,
    ) -> Result<StreamedTurn> {
        let request = ProviderRequest::builder()
            .model(self.config.model.clone())
            .messages(messages.to_vec())
            .tools(self.coordinator.catalog().definitions())
            .max_tokens(self.config.max_tokens)
            .maybe_system_prompt(self.config.system_prompt.clone())
            .maybe_thinking_budget(thinking.then_some(self.config.thinking.budget_tokens))
            .prompt_caching(self.config.prompt_caching)
            .build();

        let mut stream = self.provider.stream(&request).await?;
        let mut accumulator = ContentBlockAccumulator::new();
        let mut message_id: Option<String> = None;
        let mut stop_reason = None;
        let mut usage = Usage::default();

        while let Some(signal) = stream.next().await {
            match signal? {
                StreamSignal::StreamStart {
                    message_id: id,
                    usage: initial,
                } => {
                    let id = id.filter(|id| !id.trim().is_empty());
                    let Some(id) = id else {
                        return Err(EngineError::MissingMessageId { turn: ctx.turns });
                    };
                    message_id = Some(id);
                    usage.absorb(&initial);
                }
                StreamSignal::BlockStart { index, block } => accumulator.start(index, block),
                StreamSignal::BlockDelta { index, delta } => {
                    let Some(id) = message_id.as_deref() else {
                        return Err(EngineError::MissingMessageId { turn: ctx.turns });
                    };
                    match accumulator.delta(index, delta) {
                        Some(LiveDelta::Text(text)) => {
                            self.emit(
                                ctx,
                                AgentEventPayload::MessageChunk {
                                    message_id: id.to_string(),
                                    text,
                                },
                            )
                            .await;
                        }
                        Some(LiveDelta::Reasoning(text)) if thinking => {
                            self.emit(
                                ctx,
                                AgentEventPayload::ThinkingChunk {
                                    message_id: id.to_string(),
                                    text,
                                },
                            )
                            .await;
                        }
                        Some(LiveDelta::Reasoning(_)) | None => {}
                    }
                }
                StreamSignal::BlockStop { index } => accumulator.stop(index),
                StreamSignal::TurnDelta {
                    stop_reason: reason,
                    stop_sequence,
                    usage: delta,
                } => {
                    if reason.is_some() {
                        stop_reason = reason;
                    }
                    if let Some(sequence) = stop_sequence {
                        debug!(session_id = %ctx.session_id, stop_sequence = %sequence, "stop sequence hit");
                    }
                    usage.absorb(&delta);
                }
                StreamSignal::StreamEnd => break,
            }
        }

        let message_id = message_id.ok_or(EngineError::MissingMessageId { turn: ctx.turns })?;
        Ok(StreamedTurn {
            message_id,
            content: accumulator.finish(),
            stop_reason,
            usage,
        })
    }

    async fn emit_message(&self, ctx: &ExecutionContext, message_id: &str, content: String, stop: StopReason) {
        self.emit(
            ctx,
            AgentEventPayload::Message {
                message_id: message_id.to_string(),
                content,
                stop_reason: Some(stop),
            },
        )
        .await;
    }

    async fn emit(&self, ctx: &ExecutionContext, payload: AgentEventPayload) {
        let event_type = payload.event_type();
        if let Err(err) = ctx.emitter.emit(payload).await {
            warn!(
                session_id = %ctx.session_id,
                event_type,
                error = %err,
                "could not sequence event"
            );
        }
    }

    async fn fail(&self, ctx: &ExecutionContext, err: EngineError, messages: Vec<ModelMessage>) -> RunResult {
        warn!(
            session_id = %ctx.session_id,
            turn = ctx.turns,
            category = %err.category(),
            error = %err,
            "run failed"
        );
        self.emit(
            ctx,
            AgentEventPayload::Error {
                message: err.to_string(),
                category: err.category(),
            },
        )
        .await;
        let mut result = RunResult::failed(err.to_string(), messages);
        result.turns = ctx.turns;
        result
    }
}

#[cfg(test)]
mod tests;
