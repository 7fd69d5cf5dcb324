//! Scripted provider and capture helpers for turn loop tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;

use crate::agent_loop::emitter::EventCallback;
use crate::agent_loop::events::AgentEvent;
use crate::agent_loop::files::{FileMatch, SemanticSearch};
use crate::error::{EngineError, Result};
use crate::provider::{ProviderRequest, SignalStream, StreamingProvider};
use crate::tools::{FnTool, ToolCatalog, ToolClass, ToolOutput, ToolParameters};
use crate::types::{BlockDeltaKind, BlockSeed, StopReason, StreamSignal, Usage};

pub enum TurnScript {
    Items(Vec<Result<StreamSignal>>),
    SetupError(String),
}

/// Provider that replays queued turns. With `repeat_tool` set, it answers
/// every call past the queue with a fresh `tool_use` turn.
#[derive(Default)]
pub struct ScriptedProvider {
    scripts: Mutex<VecDeque<TurnScript>>,
    requests: Mutex<Vec<ProviderRequest>>,
    calls: AtomicUsize,
    repeat_tool: Option<String>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn repeating_tool(name: &str) -> Self {
        Self {
            repeat_tool: Some(name.to_string()),
            ..Self::default()
        }
    }

    pub fn queue_signals(&self, signals: Vec<StreamSignal>) -> &Self {
        self.queue(TurnScript::Items(signals.into_iter().map(Ok).collect()))
    }

    pub fn queue_items(&self, items: Vec<Result<StreamSignal>>) -> &Self {
        self.queue(TurnScript::Items(items))
    }

    pub fn queue_setup_error(&self, message: &str) -> &Self {
        self.queue(TurnScript::SetupError(message.to_string()))
    }

    pub fn queue_text(&self, message_id: &str, text: &str, stop: StopReason) -> &Self {
        self.queue_signals(text_turn(message_id, text, stop))
    }

    pub fn queue_tool_call(&self, message_id: &str, tool_id: &str, name: &str, input: &str) -> &Self {
        self.queue_signals(tool_turn(message_id, tool_id, name, input))
    }

    fn queue(&self, script: TurnScript) -> &Self {
        self.scripts.lock().unwrap().push_back(script);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl StreamingProvider for ScriptedProvider {
    fn provider_name(&self) -> &str {
        "scripted"
    }

    async fn stream(&self, request: &ProviderRequest) -> Result<SignalStream> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.requests.lock().unwrap().push(request.clone());
        let next = self.scripts.lock().unwrap().pop_front();
        let script = match (next, &self.repeat_tool) {
            (Some(script), _) => script,
            (None, Some(name)) => TurnScript::Items(
                tool_turn(
                    &format!("msg_{call}"),
                    &format!("toolu_{call}"),
                    name,
                    "{}",
                )
                .into_iter()
                .map(Ok)
                .collect(),
            ),
            (None, None) => return Err(EngineError::Provider("script exhausted".into())),
        };
        match script {
            TurnScript::Items(items) => Ok(futures::stream::iter(items).boxed()),
            TurnScript::SetupError(message) => Err(EngineError::Provider(message)),
        }
    }
}

pub fn start(message_id: &str) -> StreamSignal {
    StreamSignal::StreamStart {
        message_id: Some(message_id.to_string()),
        usage: Usage {
            input_tokens: 100,
            output_tokens: 1,
            ..Default::default()
        },
    }
}

pub fn text_block(index: usize, text: &str) -> Vec<StreamSignal> {
    vec![
        StreamSignal::BlockStart {
            index,
            block: BlockSeed::Text {
                text: String::new(),
            },
        },
        StreamSignal::BlockDelta {
            index,
            delta: BlockDeltaKind::Text(text.to_string()),
        },
        StreamSignal::BlockStop { index },
    ]
}

pub fn thinking_block(index: usize, text: &str) -> Vec<StreamSignal> {
    vec![
        StreamSignal::BlockStart {
            index,
            block: BlockSeed::Thinking {
                thinking: String::new(),
            },
        },
        StreamSignal::BlockDelta {
            index,
            delta: BlockDeltaKind::Thinking(text.to_string()),
        },
        StreamSignal::BlockDelta {
            index,
            delta: BlockDeltaKind::Signature("sig".to_string()),
        },
        StreamSignal::BlockStop { index },
    ]
}

pub fn tool_block(index: usize, tool_id: &str, name: &str, input: &str) -> Vec<StreamSignal> {
    vec![
        StreamSignal::BlockStart {
            index,
            block: BlockSeed::ToolUse {
                id: Some(tool_id.to_string()),
                name: name.to_string(),
                input: serde_json::json!({}),
            },
        },
        StreamSignal::BlockDelta {
            index,
            delta: BlockDeltaKind::InputJson(input.to_string()),
        },
        StreamSignal::BlockStop { index },
    ]
}

pub fn finish(stop: StopReason, output_tokens: u32) -> Vec<StreamSignal> {
    vec![
        StreamSignal::TurnDelta {
            stop_reason: Some(stop),
            stop_sequence: None,
            usage: Usage {
                output_tokens,
                ..Default::default()
            },
        },
        StreamSignal::StreamEnd,
    ]
}

pub fn text_turn(message_id: &str, text: &str, stop: StopReason) -> Vec<StreamSignal> {
    let mut signals = vec![start(message_id)];
    signals.extend(text_block(0, text));
    signals.extend(finish(stop, 20));
    signals
}

pub fn tool_turn(message_id: &str, tool_id: &str, name: &str, input: &str) -> Vec<StreamSignal> {
    let mut signals = vec![start(message_id)];
    signals.extend(tool_block(0, tool_id, name, input));
    signals.extend(finish(StopReason::ToolUse, 15));
    signals
}

/// Collects every event handed to the live callback.
#[derive(Clone, Default)]
pub struct Capture {
    events: Arc<Mutex<Vec<AgentEvent>>>,
}

impl Capture {
    pub fn callback(&self) -> EventCallback {
        let events = self.events.clone();
        Arc::new(move |event| events.lock().unwrap().push(event))
    }

    pub fn events(&self) -> Vec<AgentEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn types(&self) -> Vec<&'static str> {
        self.events().iter().map(AgentEvent::event_type).collect()
    }

    /// Event types without streaming chunks.
    pub fn durable_types(&self) -> Vec<&'static str> {
        self.types()
            .into_iter()
            .filter(|t| !t.ends_with("_chunk"))
            .collect()
    }

    pub fn sequences(&self) -> Vec<u64> {
        self.events().iter().map(|e| e.sequence).collect()
    }
}

/// Search that returns fixed hits and records the queries it was asked.
#[derive(Default)]
pub struct CountingSearch {
    pub hits: Vec<String>,
    pub calls: AtomicUsize,
    queries: Mutex<Vec<String>>,
}

impl CountingSearch {
    pub fn returning(hits: &[&str]) -> Self {
        Self {
            hits: hits.iter().map(|h| h.to_string()).collect(),
            calls: AtomicUsize::new(0),
            queries: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl SemanticSearch for CountingSearch {
    async fn search(&self, _: &str, query: &str, _: usize, _: f32) -> Result<Vec<FileMatch>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.queries.lock().unwrap().push(query.to_string());
        Ok(self
            .hits
            .iter()
            .map(|id| FileMatch {
                file_id: id.clone(),
                score: 0.91,
            })
            .collect())
    }
}

/// Catalog with one read-only and one mutating tool.
pub fn order_tools() -> ToolCatalog {
    let list = FnTool::new(
        "list_orders",
        "List recent orders",
        ToolParameters::object().number("limit", "Max orders", false).build(),
        |_| async { Ok(ToolOutput::ok(serde_json::json!({ "orders": ["SO-1", "SO-2"] }))) },
    );
    let create = FnTool::new(
        "create_order",
        "Create a sales order",
        ToolParameters::object().string("sku", "Item SKU", true).build(),
        |input| async move { Ok(ToolOutput::ok(serde_json::json!({ "created": input["sku"] }))) },
    );
    ToolCatalog::new()
        .with(Arc::new(list), ToolClass::ReadOnly)
        .with(Arc::new(create), ToolClass::Mutating)
}

/// Give the persistence worker a moment to drain.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(25)).await;
}
