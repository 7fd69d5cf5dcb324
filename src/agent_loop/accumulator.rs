//! Content block accumulation for a single provider turn.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::types::{
    BlockDeltaKind, BlockSeed, CitationFragment, ContentPart, ModelMessage, Role, ToolCallPart,
};

use super::types::ToolInvocation;

/// A finalized block of an assistant turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        index: usize,
        text: String,
        #[serde(default)]
        citations: Vec<CitationFragment>,
    },
    Reasoning {
        index: usize,
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    RedactedReasoning {
        index: usize,
        data: String,
    },
    ToolInvocation {
        index: usize,
        invocation: ToolInvocation,
    },
}

impl ContentBlock {
    pub fn index(&self) -> usize {
        match self {
            Self::Text { index, .. }
            | Self::Reasoning { index, .. }
            | Self::RedactedReasoning { index, .. }
            | Self::ToolInvocation { index, .. } => *index,
        }
    }
}

/// Live content produced by a delta, for forwarding to the event stream.
#[derive(Debug, Clone, PartialEq)]
pub enum LiveDelta {
    Text(String),
    Reasoning(String),
}

/// A signal the accumulator could not apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamAnomaly {
    pub index: usize,
    pub signal: &'static str,
    pub detail: String,
}

#[derive(Debug)]
enum OpenBlock {
    Text {
        text: String,
        citations: Vec<CitationFragment>,
    },
    Reasoning {
        text: String,
        signature: Option<String>,
    },
    RedactedReasoning {
        data: String,
    },
    Tool {
        id: String,
        name: String,
        seed_input: serde_json::Value,
        raw_input: String,
    },
}

#[derive(Debug)]
struct Slot {
    block: OpenBlock,
    stopped: bool,
}

/// Builds the blocks of one turn from block start, delta and stop signals.
#[derive(Debug, Default)]
pub struct ContentBlockAccumulator {
    slots: BTreeMap<usize, Slot>,
    anomalies: Vec<StreamAnomaly>,
}

impl ContentBlockAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self, index: usize, seed: BlockSeed) {
        let block = match seed {
            BlockSeed::Text { text } => OpenBlock::Text {
                text,
                citations: Vec::new(),
            },
            BlockSeed::Thinking { thinking } => OpenBlock::Reasoning {
                text: thinking,
                signature: None,
            },
            BlockSeed::RedactedThinking { data } => OpenBlock::RedactedReasoning { data },
            BlockSeed::ToolUse { id, name, input } => {
                let id = match id.map(|s| s.trim().to_string()).filter(|s| !s.is_empty()) {
                    Some(id) => id,
                    None => {
                        let fallback = fallback_tool_id(index);
                        warn!(
                            index,
                            tool_name = %name,
                            tool_use_id = %fallback,
                            "tool_use block without id; assigned fallback id"
                        );
                        fallback
                    }
                };
                OpenBlock::Tool {
                    id,
                    name,
                    seed_input: input,
                    raw_input: String::new(),
                }
            }
        };
        if self.slots.contains_key(&index) {
            self.anomaly(index, "block_start", "index already open; replacing block");
        }
        self.slots.insert(
            index,
            Slot {
                block,
                stopped: false,
            },
        );
    }

    /// Apply a delta. Returns the live content to forward, if any.
    pub fn delta(&mut self, index: usize, delta: BlockDeltaKind) -> Option<LiveDelta> {
        let Some(slot) = self.slots.get_mut(&index) else {
            self.anomaly(index, "block_delta", "unknown block index");
            return None;
        };
        if slot.stopped {
            self.anomaly(index, "block_delta", "delta after block stop");
            return None;
        }
        let applied = match (&mut slot.block, delta) {
            (OpenBlock::Text { text, .. }, BlockDeltaKind::Text(chunk)) => {
                text.push_str(&chunk);
                Ok((!chunk.is_empty()).then_some(LiveDelta::Text(chunk)))
            }
            (OpenBlock::Text { citations, .. }, BlockDeltaKind::Citation(fragment)) => {
                citations.push(fragment);
                Ok(None)
            }
            (OpenBlock::Reasoning { text, .. }, BlockDeltaKind::Thinking(chunk)) => {
                text.push_str(&chunk);
                Ok((!chunk.is_empty()).then_some(LiveDelta::Reasoning(chunk)))
            }
            (OpenBlock::Reasoning { signature, .. }, BlockDeltaKind::Signature(sig)) => {
                signature.get_or_insert_with(String::new).push_str(&sig);
                Ok(None)
            }
            (OpenBlock::Tool { raw_input, .. }, BlockDeltaKind::InputJson(part)) => {
                raw_input.push_str(&part);
                Ok(None)
            }
            (_, other) => Err(format!("delta {other:?} does not fit block")),
        };
        match applied {
            Ok(live) => live,
            Err(detail) => {
                self.anomaly(index, "block_delta", detail);
                None
            }
        }
    }

    pub fn stop(&mut self, index: usize) {
        match self.slots.get_mut(&index) {
            Some(slot) => slot.stopped = true,
            None => self.anomaly(index, "block_stop", "unknown block index"),
        }
    }

    pub fn anomalies(&self) -> &[StreamAnomaly] {
        &self.anomalies
    }

    /// Finalize every block in index order.
    pub fn finish(self) -> AccumulatedTurn {
        let mut blocks = Vec::with_capacity(self.slots.len());
        let mut citations = Vec::new();
        for (index, slot) in self.slots {
            if !slot.stopped {
                warn!(index, "block never stopped; finalizing as-is");
            }
            let block = match slot.block {
                OpenBlock::Text {
                    text,
                    citations: block_citations,
                } => {
                    citations.extend(block_citations.iter().cloned());
                    ContentBlock::Text {
                        index,
                        text,
                        citations: block_citations,
                    }
                }
                OpenBlock::Reasoning { text, signature } => ContentBlock::Reasoning {
                    index,
                    text,
                    signature,
                },
                OpenBlock::RedactedReasoning { data } => {
                    ContentBlock::RedactedReasoning { index, data }
                }
                OpenBlock::Tool {
                    id,
                    name,
                    seed_input,
                    raw_input,
                } => {
                    let input = parse_tool_input(&id, &raw_input, seed_input);
                    ContentBlock::ToolInvocation {
                        index,
                        invocation: ToolInvocation { id, name, input },
                    }
                }
            };
            blocks.push(block);
        }
        AccumulatedTurn {
            blocks,
            citations,
            anomalies: self.anomalies,
        }
    }

    fn anomaly(&mut self, index: usize, signal: &'static str, detail: impl Into<String>) {
        let detail = detail.into();
        warn!(index, signal, detail = %detail, "dropping stream signal");
        self.anomalies.push(StreamAnomaly {
            index,
            signal,
            detail,
        });
    }
}

fn fallback_tool_id(index: usize) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("toolu_local_{index}_{}", &suffix[..8])
}

fn parse_tool_input(id: &str, raw: &str, seed: serde_json::Value) -> serde_json::Value {
    if raw.trim().is_empty() {
        return match seed {
            serde_json::Value::Null => serde_json::json!({}),
            other => other,
        };
    }
    match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(err) => {
            warn!(tool_use_id = %id, error = %err, "tool input is not valid JSON; passing raw text");
            serde_json::Value::String(raw.to_string())
        }
    }
}

/// The finalized content of one turn.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccumulatedTurn {
    pub blocks: Vec<ContentBlock>,
    /// Citation fragments from every text block, in block order.
    pub citations: Vec<CitationFragment>,
    pub anomalies: Vec<StreamAnomaly>,
}

impl AccumulatedTurn {
    /// Concatenated answer text.
    pub fn text(&self) -> String {
        self.blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Concatenated reasoning text.
    pub fn reasoning_text(&self) -> String {
        self.blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Reasoning { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn tool_invocations(&self) -> Vec<ToolInvocation> {
        self.blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolInvocation { invocation, .. } => Some(invocation.clone()),
                _ => None,
            })
            .collect()
    }

    /// The turn as an assistant message for the next request. Reasoning is
    /// kept with its signature; empty text blocks are dropped.
    pub fn to_assistant_message(&self) -> ModelMessage {
        let content = self
            .blocks
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text, .. } if text.is_empty() => None,
                ContentBlock::Text { text, .. } => Some(ContentPart::Text { text: text.clone() }),
                ContentBlock::Reasoning {
                    text, signature, ..
                } => Some(ContentPart::Thinking {
                    thinking: text.clone(),
                    signature: signature.clone(),
                }),
                ContentBlock::RedactedReasoning { data, .. } => {
                    Some(ContentPart::RedactedThinking { data: data.clone() })
                }
                ContentBlock::ToolInvocation { invocation, .. } => {
                    Some(ContentPart::ToolCall(ToolCallPart {
                        id: invocation.id.clone(),
                        name: invocation.name.clone(),
                        input: invocation.input.clone(),
                    }))
                }
            })
            .collect();
        ModelMessage {
            role: Role::Assistant,
            content,
            timestamp: Some(chrono::Utc::now()),
        }
    }
}
