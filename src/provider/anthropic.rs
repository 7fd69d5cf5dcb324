//! Anthropic Messages API streaming provider.

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::EngineError;
use crate::types::{
    BlockDeltaKind, BlockSeed, CitationFragment, ContentPart, ModelMessage, Role, StopReason,
    StreamSignal, Usage,
};

use super::http::{
    anthropic_headers, parse_sse_data, shared_client, status_to_error, SseLineBuffer,
};
use super::{ProviderRequest, SignalStream, StreamingProvider};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const API_VERSION: &str = "2023-06-01";
const BETA_FLAGS: &str = "interleaved-thinking-2025-05-14";

pub struct AnthropicProvider {
    api_key: String,
    base_url: String,
}

impl AnthropicProvider {
    pub fn new(api_key: String, base_url: Option<String>) -> Self {
        Self {
            api_key,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        }
    }

    fn build_headers(&self, request: &ProviderRequest) -> reqwest::header::HeaderMap {
        let beta = request.thinking_budget.map(|_| BETA_FLAGS);
        anthropic_headers(&self.api_key, API_VERSION, beta)
    }
}

#[async_trait]
impl StreamingProvider for AnthropicProvider {
    fn provider_name(&self) -> &str {
        "anthropic"
    }

    async fn stream(&self, request: &ProviderRequest) -> Result<SignalStream, EngineError> {
        let body = build_request_body(request);
        let url = format!("{}/messages", self.base_url);

        debug!(model = %request.model, messages = request.messages.len(), "anthropic stream");

        let resp = shared_client()
            .post(&url)
            .headers(self.build_headers(request))
            .json(&body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if status != 200 {
            let body_text = resp.text().await.unwrap_or_default();
            return Err(status_to_error(status, &body_text));
        }

        let byte_stream = resp.bytes_stream();

        let stream = async_stream::stream! {
            let mut lines = SseLineBuffer::new();
            futures::pin_mut!(byte_stream);

            while let Some(chunk_result) = byte_stream.next().await {
                let chunk = match chunk_result {
                    Ok(c) => c,
                    Err(e) => {
                        yield Err(EngineError::Network(e));
                        break;
                    }
                };

                for line in lines.push(&chunk) {
                    if line.is_empty() || line.starts_with(':') {
                        continue;
                    }
                    let Some(data) = parse_sse_data(&line) else {
                        continue;
                    };
                    let event = match serde_json::from_str::<Value>(data) {
                        Ok(event) => event,
                        Err(err) => {
                            debug!(error = %err, "skipping unparseable SSE payload");
                            continue;
                        }
                    };
                    if let Some(signal) = parse_stream_event(&event) {
                        let is_err = signal.is_err();
                        yield signal;
                        if is_err {
                            return;
                        }
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

/// Translate one SSE JSON payload into a stream signal.
///
/// Returns `None` for keep-alives and event types the engine does not consume.
pub fn parse_stream_event(event: &Value) -> Option<Result<StreamSignal, EngineError>> {
    let kind = event.get("type").and_then(Value::as_str).unwrap_or("");
    let index = || event.get("index").and_then(Value::as_u64).map(|i| i as usize);

    match kind {
        "message_start" => {
            let message = event.get("message");
            let message_id = message
                .and_then(|m| m.get("id"))
                .and_then(Value::as_str)
                .map(str::to_string);
            let usage = message
                .and_then(|m| m.get("usage"))
                .map(parse_usage)
                .unwrap_or_default();
            Some(Ok(StreamSignal::StreamStart { message_id, usage }))
        }
        "content_block_start" => {
            let block = event.get("content_block")?;
            let seed = match block.get("type").and_then(Value::as_str)? {
                "text" => BlockSeed::Text {
                    text: str_field(block, "text"),
                },
                "thinking" => BlockSeed::Thinking {
                    thinking: str_field(block, "thinking"),
                },
                "redacted_thinking" => BlockSeed::RedactedThinking {
                    data: str_field(block, "data"),
                },
                "tool_use" => BlockSeed::ToolUse {
                    id: block.get("id").and_then(Value::as_str).map(str::to_string),
                    name: str_field(block, "name"),
                    input: block.get("input").cloned().unwrap_or(Value::Null),
                },
                other => {
                    debug!(block_type = other, "ignoring unsupported content block");
                    return None;
                }
            };
            Some(Ok(StreamSignal::BlockStart {
                index: index()?,
                block: seed,
            }))
        }
        "content_block_delta" => {
            let delta = event.get("delta")?;
            let kind = match delta.get("type").and_then(Value::as_str)? {
                "text_delta" => BlockDeltaKind::Text(str_field(delta, "text")),
                "thinking_delta" => BlockDeltaKind::Thinking(str_field(delta, "thinking")),
                "signature_delta" => BlockDeltaKind::Signature(str_field(delta, "signature")),
                "input_json_delta" => BlockDeltaKind::InputJson(str_field(delta, "partial_json")),
                "citations_delta" => {
                    let citation = delta.get("citation").cloned().unwrap_or(Value::Null);
                    BlockDeltaKind::Citation(CitationFragment {
                        document_title: citation
                            .get("document_title")
                            .and_then(Value::as_str)
                            .map(str::to_string),
                        cited_text: citation
                            .get("cited_text")
                            .and_then(Value::as_str)
                            .map(str::to_string),
                        document_index: citation
                            .get("document_index")
                            .and_then(Value::as_u64)
                            .map(|i| i as usize),
                    })
                }
                _ => return None,
            };
            Some(Ok(StreamSignal::BlockDelta {
                index: index()?,
                delta: kind,
            }))
        }
        "content_block_stop" => Some(Ok(StreamSignal::BlockStop { index: index()? })),
        "message_delta" => {
            let delta = event.get("delta");
            let stop_reason = delta
                .and_then(|d| d.get("stop_reason"))
                .and_then(Value::as_str)
                .map(StopReason::parse);
            let stop_sequence = delta
                .and_then(|d| d.get("stop_sequence"))
                .and_then(Value::as_str)
                .map(str::to_string);
            let usage = event.get("usage").map(parse_usage).unwrap_or_default();
            Some(Ok(StreamSignal::TurnDelta {
                stop_reason,
                stop_sequence,
                usage,
            }))
        }
        "message_stop" => Some(Ok(StreamSignal::StreamEnd)),
        "error" => {
            let message = event
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("stream error")
                .to_string();
            Some(Err(EngineError::Stream(message)))
        }
        _ => None,
    }
}

/// Build the Messages API body for a streaming request.
pub fn build_request_body(request: &ProviderRequest) -> Value {
    let messages: Vec<Value> = request
        .messages
        .iter()
        .filter(|m| !m.content.is_empty())
        .map(|m| {
            json!({
                "role": match m.role {
                    Role::User => "user",
                    Role::Assistant => "assistant",
                },
                "content": build_content(m, request.thinking_budget.is_some()),
            })
        })
        .collect();

    let mut body = json!({
        "model": request.model,
        "max_tokens": request.max_tokens,
        "messages": messages,
        "stream": true,
    });

    if let Some(system) = &request.system_prompt {
        body["system"] = if request.prompt_caching {
            json!([{
                "type": "text",
                "text": system,
                "cache_control": { "type": "ephemeral" },
            }])
        } else {
            json!(system)
        };
    }

    if !request.tools.is_empty() {
        let mut tools: Vec<Value> = request
            .tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.input_schema,
                })
            })
            .collect();
        if request.prompt_caching {
            if let Some(last) = tools.last_mut() {
                last["cache_control"] = json!({ "type": "ephemeral" });
            }
        }
        body["tools"] = json!(tools);
    }

    if let Some(budget) = request.thinking_budget {
        body["thinking"] = json!({ "type": "enabled", "budget_tokens": budget });
    }

    body
}

fn build_content(message: &ModelMessage, thinking: bool) -> Value {
    let blocks: Vec<Value> = message
        .content
        .iter()
        .filter_map(|part| match part {
            ContentPart::Text { text } => Some(json!({ "type": "text", "text": text })),
            ContentPart::Thinking { thinking: text, signature } if thinking => {
                let mut block = json!({ "type": "thinking", "thinking": text });
                if let Some(sig) = signature {
                    block["signature"] = json!(sig);
                }
                Some(block)
            }
            ContentPart::RedactedThinking { data } if thinking => {
                Some(json!({ "type": "redacted_thinking", "data": data }))
            }
            ContentPart::Thinking { .. } | ContentPart::RedactedThinking { .. } => None,
            ContentPart::ToolCall(call) => Some(json!({
                "type": "tool_use",
                "id": call.id,
                "name": call.name,
                "input": if call.input.is_object() { call.input.clone() } else { json!({}) },
            })),
            ContentPart::ToolResult(result) => Some(json!({
                "type": "tool_result",
                "tool_use_id": result.tool_use_id,
                "content": match &result.content {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                },
                "is_error": result.is_error,
            })),
        })
        .collect();
    json!(blocks)
}

fn parse_usage(raw: &Value) -> Usage {
    let field = |name: &str| raw.get(name).and_then(Value::as_u64).map(|v| v as u32);
    Usage {
        input_tokens: field("input_tokens").unwrap_or(0),
        output_tokens: field("output_tokens").unwrap_or(0),
        cache_read_tokens: field("cache_read_input_tokens"),
        cache_creation_tokens: field("cache_creation_input_tokens"),
    }
}

fn str_field(value: &Value, name: &str) -> String {
    value
        .get(name)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}
