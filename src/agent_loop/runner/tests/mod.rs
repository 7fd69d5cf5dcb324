mod support;

use std::sync::Arc;

use pretty_assertions::assert_eq;

use super::{RunRequest, TurnLoop, MAX_TURNS_NOTICE, REFUSAL_REASON, TRUNCATION_NOTICE};
use crate::agent_loop::approvals::DenyAll;
use crate::agent_loop::events::{AgentEventPayload, PersistenceState};
use crate::agent_loop::files::InMemoryFileStore;
use crate::agent_loop::persistence::InMemoryEventSink;
use crate::agent_loop::tool_phase::{CANCELLED_BY_USER, DUPLICATE_SKIPPED};
use crate::agent_loop::types::RunStatus;
use crate::config::{EngineConfig, UnknownStopPolicy};
use crate::error::{EngineError, ErrorCategory};
use crate::types::{ContentPart, ModelMessage, Role, StopReason, StreamSignal};

use support::*;

fn engine(provider: Arc<ScriptedProvider>) -> TurnLoop {
    TurnLoop::new(EngineConfig::default(), provider, order_tools())
}

fn request(capture: &Capture) -> RunRequest {
    RunRequest::builder()
        .session_id("sess-1")
        .user_id("user-1")
        .query("What are my open orders?")
        .callback(capture.callback())
        .build()
}

fn is_strictly_increasing(values: &[u64]) -> bool {
    values.windows(2).all(|w| w[0] < w[1])
}

#[tokio::test]
async fn text_turn_streams_chunks_then_message_and_complete() {
    let provider = Arc::new(ScriptedProvider::new());
    provider.queue_text("msg_1", "You have two open orders.", StopReason::EndTurn);
    let capture = Capture::default();

    let result = engine(provider.clone()).run(request(&capture)).await;

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.text, "You have two open orders.");
    assert_eq!(capture.types(), vec!["message_chunk", "message", "complete"]);
    assert_eq!(capture.sequences(), vec![1, 2, 3]);
    let events = capture.events();
    assert_eq!(events[0].persistence, PersistenceState::Transient);
    assert_eq!(events[1].persistence, PersistenceState::Pending);
    assert_eq!(result.usage.input_tokens, 100);
    assert_eq!(result.usage.output_tokens, 20);
    assert_eq!(result.usage.message_tokens, 20);
    assert_eq!(result.turns, 1);
}

#[tokio::test]
async fn tool_use_runs_tools_and_feeds_results_back() {
    let provider = Arc::new(ScriptedProvider::new());
    provider
        .queue_tool_call("msg_1", "toolu_a", "list_orders", r#"{"limit": 2}"#)
        .queue_text("msg_2", "SO-1 and SO-2 are open.", StopReason::EndTurn);
    let capture = Capture::default();

    let result = engine(provider.clone()).run(request(&capture)).await;

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.executed_tools, vec!["list_orders"]);
    assert_eq!(
        capture.durable_types(),
        vec!["tool_use", "tool_result", "message", "complete"]
    );
    assert!(is_strictly_increasing(&capture.sequences()));

    let events = capture.events();
    let use_event = events.iter().find(|e| e.event_type() == "tool_use").unwrap();
    let result_event = events.iter().find(|e| e.event_type() == "tool_result").unwrap();
    assert_eq!(result_event.sequence, use_event.sequence + 1);
    assert_eq!(result_event.timestamp, use_event.timestamp);

    let second = &provider.requests()[1];
    let last = second.messages.last().unwrap();
    assert_eq!(last.role, Role::User);
    match &last.content[0] {
        ContentPart::ToolResult(part) => {
            assert_eq!(part.tool_use_id, "toolu_a");
            assert!(!part.is_error);
        }
        other => panic!("expected tool result, got {other:?}"),
    }
    assert_eq!(second.messages[1].tool_calls()[0].input["limit"], 2);
    assert_eq!(result.turns, 2);
}

#[tokio::test]
async fn safety_bound_stops_after_max_turns() {
    let provider = Arc::new(ScriptedProvider::repeating_tool("list_orders"));
    let capture = Capture::default();

    let result = engine(provider.clone()).run(request(&capture)).await;

    assert_eq!(provider.calls(), 20);
    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.turns, 20);
    assert_eq!(result.executed_tools.len(), 20);
    let events = capture.events();
    let message = events
        .iter()
        .rev()
        .find_map(|e| match &e.payload {
            AgentEventPayload::Message { content, .. } => Some(content.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(message, MAX_TURNS_NOTICE);
    assert_eq!(capture.types().last(), Some(&"complete"));
}

#[tokio::test]
async fn lower_max_turns_is_honoured() {
    let provider = Arc::new(ScriptedProvider::repeating_tool("list_orders"));
    let config = EngineConfig {
        max_turns: 3,
        ..EngineConfig::default()
    };
    let engine = TurnLoop::new(config, provider.clone(), order_tools());

    let result = engine.run(request(&Capture::default())).await;

    assert_eq!(provider.calls(), 3);
    assert_eq!(result.text, MAX_TURNS_NOTICE);
}

#[tokio::test]
async fn refusal_emits_content_refused() {
    let provider = Arc::new(ScriptedProvider::new());
    provider.queue_text("msg_1", "I cannot help with that", StopReason::Refusal);
    let capture = Capture::default();

    let result = engine(provider).run(request(&capture)).await;

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(
        capture.durable_types(),
        vec!["message", "content_refused", "complete"]
    );
    let refused = capture
        .events()
        .into_iter()
        .find_map(|e| match e.payload {
            AgentEventPayload::ContentRefused { reason, content, .. } => Some((reason, content)),
            _ => None,
        })
        .unwrap();
    assert_eq!(refused.0, REFUSAL_REASON);
    assert!(refused.0.contains("policy violation"));
    assert_eq!(refused.1, "I cannot help with that");
}

#[tokio::test]
async fn max_tokens_substitutes_truncation_notice() {
    let provider = Arc::new(ScriptedProvider::new());
    provider.queue_text("msg_1", "Here is a very long", StopReason::MaxTokens);
    let capture = Capture::default();

    let result = engine(provider).run(request(&capture)).await;

    assert_eq!(result.text, TRUNCATION_NOTICE);
    let content = capture
        .events()
        .into_iter()
        .find_map(|e| match e.payload {
            AgentEventPayload::Message { content, stop_reason, .. } => {
                assert_eq!(stop_reason, Some(StopReason::MaxTokens));
                Some(content)
            }
            _ => None,
        })
        .unwrap();
    assert_eq!(content, TRUNCATION_NOTICE);
}

#[tokio::test]
async fn pause_then_resume_continues_sequence() {
    let provider = Arc::new(ScriptedProvider::new());
    provider
        .queue_text("msg_1", "Searching the catalogue", StopReason::PauseTurn)
        .queue_text("msg_2", "Found it.", StopReason::EndTurn);
    let engine = engine(provider.clone());
    let capture = Capture::default();

    let paused = engine.run(request(&capture)).await;
    assert_eq!(paused.status, RunStatus::Paused);
    assert_eq!(capture.durable_types(), vec!["turn_paused"]);

    let resumed = engine
        .run(
            RunRequest::builder()
                .session_id("sess-1")
                .messages(paused.messages.clone())
                .callback(capture.callback())
                .build(),
        )
        .await;

    assert_eq!(resumed.status, RunStatus::Completed);
    assert!(is_strictly_increasing(&capture.sequences()));
    let resume_request = &provider.requests()[1];
    assert_eq!(resume_request.messages.len(), paused.messages.len());
    assert_eq!(resume_request.messages.last().unwrap().role, Role::Assistant);
}

#[tokio::test]
async fn unknown_stop_reason_defaults_to_end_turn() {
    let provider = Arc::new(ScriptedProvider::new());
    provider.queue_text("msg_1", "done", StopReason::Other("model_context_window_exceeded".into()));
    let capture = Capture::default();

    let result = engine(provider).run(request(&capture)).await;

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(capture.durable_types(), vec!["message", "complete"]);
}

#[tokio::test]
async fn unknown_stop_reason_can_be_fatal() {
    let provider = Arc::new(ScriptedProvider::new());
    provider.queue_text("msg_1", "done", StopReason::Other("brand_new".into()));
    let config = EngineConfig {
        unknown_stop_reason: UnknownStopPolicy::Fail,
        ..EngineConfig::default()
    };
    let capture = Capture::default();

    let result = TurnLoop::new(config, provider, order_tools())
        .run(request(&capture))
        .await;

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(capture.durable_types(), vec!["error"]);
}

#[tokio::test]
async fn missing_stop_reason_is_treated_as_end_turn() {
    let provider = Arc::new(ScriptedProvider::new());
    let mut signals = vec![start("msg_1")];
    signals.extend(text_block(0, "ok"));
    signals.push(StreamSignal::StreamEnd);
    provider.queue_signals(signals);

    let result = engine(provider).run(request(&Capture::default())).await;

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.text, "ok");
}

#[tokio::test]
async fn missing_message_id_fails_before_turn_events() {
    let provider = Arc::new(ScriptedProvider::new());
    let mut signals = vec![StreamSignal::StreamStart {
        message_id: None,
        usage: Default::default(),
    }];
    signals.extend(text_block(0, "never shown"));
    provider.queue_signals(signals);
    let capture = Capture::default();

    let result = engine(provider).run(request(&capture)).await;

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(capture.types(), vec!["error"]);
}

#[tokio::test]
async fn stream_setup_failure_is_one_error_event() {
    let provider = Arc::new(ScriptedProvider::new());
    provider.queue_setup_error("connection refused");
    let capture = Capture::default();

    let result = engine(provider.clone()).run(request(&capture)).await;

    assert_eq!(result.status, RunStatus::Failed);
    assert!(result.error.unwrap().contains("connection refused"));
    assert_eq!(provider.calls(), 1);
    match &capture.events()[0].payload {
        AgentEventPayload::Error { category, .. } => assert_eq!(*category, ErrorCategory::Provider),
        other => panic!("expected error event, got {other:?}"),
    }
}

#[tokio::test]
async fn failed_run_keeps_usage_and_tools_from_earlier_turns() {
    let provider = Arc::new(ScriptedProvider::new());
    provider
        .queue_tool_call("msg_1", "toolu_a", "list_orders", "{}")
        .queue_setup_error("connection reset");
    let capture = Capture::default();

    let result = engine(provider.clone()).run(request(&capture)).await;

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.turns, 2);
    assert_eq!(result.executed_tools, vec!["list_orders".to_string()]);
    assert_eq!(result.usage.input_tokens, 100);
    assert!(result.usage.output_tokens > 0);
    assert_eq!(capture.durable_types(), vec!["tool_use", "tool_result", "error"]);
}

#[tokio::test]
async fn mid_stream_error_fails_the_run() {
    let provider = Arc::new(ScriptedProvider::new());
    provider.queue_items(vec![
        Ok(start("msg_1")),
        Err(EngineError::Stream("overloaded_error".into())),
    ]);
    let capture = Capture::default();

    let result = engine(provider).run(request(&capture)).await;

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(capture.types(), vec!["error"]);
}

#[tokio::test]
async fn missing_session_fails_without_calling_provider() {
    let provider = Arc::new(ScriptedProvider::new());
    let capture = Capture::default();

    let result = engine(provider.clone())
        .run(
            RunRequest::builder()
                .session_id("  ")
                .query("hi")
                .callback(capture.callback())
                .build(),
        )
        .await;

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(provider.calls(), 0);
    assert!(capture.events().is_empty());
}

fn thinking_turn() -> Vec<StreamSignal> {
    let mut signals = vec![start("msg_1")];
    signals.extend(thinking_block(0, "The user wants open orders only."));
    signals.extend(text_block(1, "Two open orders."));
    signals.extend(finish(StopReason::EndTurn, 40));
    signals
}

#[tokio::test]
async fn thinking_chunks_only_when_enabled() {
    let provider = Arc::new(ScriptedProvider::new());
    provider.queue_signals(thinking_turn());
    let capture = Capture::default();
    let mut req = request(&capture);
    req.thinking = Some(true);

    let result = engine(provider.clone()).run(req).await;

    assert_eq!(
        capture.types(),
        vec!["thinking_chunk", "message_chunk", "message", "complete"]
    );
    assert_eq!(capture.events()[0].persistence, PersistenceState::Transient);
    assert_eq!(provider.requests()[0].thinking_budget, Some(4_096));
    // 32 chars of reasoning
    assert_eq!(result.usage.reasoning_tokens, 8);
    assert_eq!(result.usage.message_tokens, 32);

    let provider = Arc::new(ScriptedProvider::new());
    provider.queue_signals(thinking_turn());
    let capture = Capture::default();
    engine(provider.clone()).run(request(&capture)).await;

    assert!(!capture.types().contains(&"thinking_chunk"));
    assert_eq!(provider.requests()[0].thinking_budget, None);
}

#[tokio::test]
async fn denied_mutating_tool_is_reported_as_cancelled() {
    let provider = Arc::new(ScriptedProvider::new());
    provider
        .queue_tool_call("msg_1", "toolu_a", "create_order", r#"{"sku": "W-1"}"#)
        .queue_text("msg_2", "I did not create the order.", StopReason::EndTurn);
    let capture = Capture::default();

    let result = engine(provider)
        .with_approval_gate(Arc::new(DenyAll))
        .run(request(&capture))
        .await;

    assert!(result.executed_tools.is_empty());
    let (success, error) = capture
        .events()
        .into_iter()
        .find_map(|e| match e.payload {
            AgentEventPayload::ToolResult { success, error, .. } => Some((success, error)),
            _ => None,
        })
        .unwrap();
    assert!(!success);
    assert_eq!(error.as_deref(), Some(CANCELLED_BY_USER));
}

#[tokio::test]
async fn repeated_invocation_id_is_skipped_across_turns() {
    let provider = Arc::new(ScriptedProvider::new());
    provider
        .queue_tool_call("msg_1", "toolu_a", "list_orders", "{}")
        .queue_tool_call("msg_2", "toolu_a", "list_orders", "{}")
        .queue_text("msg_3", "Done.", StopReason::EndTurn);
    let capture = Capture::default();

    let result = engine(provider.clone()).run(request(&capture)).await;

    assert_eq!(result.executed_tools, vec!["list_orders"]);
    let tool_uses = capture.types().iter().filter(|t| **t == "tool_use").count();
    assert_eq!(tool_uses, 1);
    let third = &provider.requests()[2];
    match &third.messages.last().unwrap().content[0] {
        ContentPart::ToolResult(part) => {
            assert!(part.is_error);
            assert_eq!(part.content["error"], DUPLICATE_SKIPPED);
        }
        other => panic!("expected tool result, got {other:?}"),
    }
}

#[tokio::test]
async fn pending_events_reach_the_durable_sink_in_order() {
    let provider = Arc::new(ScriptedProvider::new());
    provider
        .queue_tool_call("msg_1", "toolu_a", "list_orders", "{}")
        .queue_text("msg_2", "Done.", StopReason::EndTurn);
    let sink = Arc::new(InMemoryEventSink::new());

    engine(provider)
        .with_event_sink(sink.clone())
        .run(request(&Capture::default()))
        .await;
    settle().await;

    let stored = sink.events();
    let types: Vec<&str> = stored.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(types, vec!["tool_use", "tool_result", "message", "complete"]);
    let sequences: Vec<u64> = stored.iter().filter_map(|e| e.sequence()).collect();
    assert!(is_strictly_increasing(&sequences));
    let batches = sink.tool_batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].1[0].tool_name, "list_orders");
}

#[test]
fn durable_worker_survives_runtime_restart() {
    let provider = Arc::new(ScriptedProvider::new());
    provider
        .queue_text("msg_1", "First.", StopReason::EndTurn)
        .queue_text("msg_2", "Second.", StopReason::EndTurn);
    let sink = Arc::new(InMemoryEventSink::new());
    let engine = engine(provider).with_event_sink(sink.clone());

    for session in ["sess-a", "sess-b"] {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let mut req = request(&Capture::default());
            req.session_id = session.to_string();
            engine.run(req).await;
            settle().await;
        });
    }

    let sessions: Vec<String> = sink
        .events()
        .into_iter()
        .filter(|e| e.event_type == "complete")
        .map(|e| e.session_id)
        .collect();
    assert_eq!(sessions, vec!["sess-a".to_string(), "sess-b".to_string()]);
}

#[tokio::test]
async fn failing_sink_does_not_affect_the_run() {
    let provider = Arc::new(ScriptedProvider::new());
    provider.queue_text("msg_1", "All good.", StopReason::EndTurn);
    let capture = Capture::default();

    let result = engine(provider)
        .with_event_sink(Arc::new(InMemoryEventSink::failing("db offline")))
        .run(request(&capture))
        .await;
    settle().await;

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(capture.durable_types(), vec!["message", "complete"]);
}

fn files() -> Arc<InMemoryFileStore> {
    Arc::new(
        InMemoryFileStore::new()
            .with_file("file-1", "report.pdf")
            .with_file("file-2", "prices.xlsx"),
    )
}

fn search_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.file_search.enabled = true;
    config
}

fn cited_files(capture: &Capture) -> Option<Vec<(String, String)>> {
    capture.events().into_iter().find_map(|e| match e.payload {
        AgentEventPayload::Complete { cited_files, .. } => Some(
            cited_files
                .unwrap_or_default()
                .into_iter()
                .map(|f| (f.file_id, f.file_name))
                .collect(),
        ),
        _ => None,
    })
}

#[tokio::test]
async fn manual_attachments_win_and_skip_search() {
    let provider = Arc::new(ScriptedProvider::new());
    provider.queue_text("msg_1", "Per [report.pdf], prices rose.", StopReason::EndTurn);
    let search = Arc::new(CountingSearch::returning(&["file-2"]));
    let capture = Capture::default();
    let mut req = request(&capture);
    req.attachments = vec!["file-1".into(), "file-2".into()];

    let result = TurnLoop::new(search_config(), provider, order_tools())
        .with_file_resolver(files())
        .with_semantic_search(search.clone())
        .run(req)
        .await;

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(search.calls(), 0);
    assert_eq!(
        cited_files(&capture).unwrap(),
        vec![
            ("file-1".to_string(), "report.pdf".to_string()),
            ("file-2".to_string(), "prices.xlsx".to_string()),
        ]
    );
    assert_eq!(result.citations[0].file_id.as_deref(), Some("file-1"));
}

#[tokio::test]
async fn unresolvable_search_hit_is_dropped() {
    let provider = Arc::new(ScriptedProvider::new());
    provider.queue_text("msg_1", "See [prices.xlsx].", StopReason::EndTurn);
    let search = Arc::new(CountingSearch::returning(&["file-2", "file-deleted"]));
    let capture = Capture::default();

    let result = TurnLoop::new(search_config(), provider, order_tools())
        .with_file_resolver(files())
        .with_semantic_search(search.clone())
        .run(request(&capture))
        .await;

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(search.calls(), 1);
    assert_eq!(
        cited_files(&capture).unwrap(),
        vec![("file-2".to_string(), "prices.xlsx".to_string())]
    );
}

#[tokio::test]
async fn blank_query_searches_with_last_user_text() {
    let provider = Arc::new(ScriptedProvider::new());
    provider.queue_text("msg_1", "See [prices.xlsx].", StopReason::EndTurn);
    let search = Arc::new(CountingSearch::returning(&["file-2"]));
    let capture = Capture::default();
    let mut req = request(&capture);
    req.messages = vec![ModelMessage::user("Show me the price list")];
    req.query = Some("   ".into());

    let result = TurnLoop::new(search_config(), provider.clone(), order_tools())
        .with_file_resolver(files())
        .with_semantic_search(search.clone())
        .run(req)
        .await;

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(search.queries(), vec!["Show me the price list".to_string()]);
    assert_eq!(provider.requests()[0].messages.len(), 1);
}

#[tokio::test]
async fn cited_files_absent_when_nothing_used() {
    let provider = Arc::new(ScriptedProvider::new());
    provider.queue_text("msg_1", "No files here.", StopReason::EndTurn);
    let capture = Capture::default();

    let result = engine(provider).run(request(&capture)).await;

    assert!(result.cited_files.is_none());
    let complete = capture.events().into_iter().last().unwrap();
    let json = serde_json::to_value(&complete).unwrap();
    assert!(json.get("cited_files").is_none());
}

#[tokio::test]
async fn invalid_attachment_fails_before_provider_call() {
    let provider = Arc::new(ScriptedProvider::new());
    let capture = Capture::default();
    let mut req = request(&capture);
    req.attachments = vec!["file-missing".into()];

    let result = engine(provider.clone())
        .with_file_resolver(files())
        .run(req)
        .await;

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(provider.calls(), 0);
    assert_eq!(capture.types(), vec!["error"]);
}
