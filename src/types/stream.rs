//! Signals produced by a streaming provider.

use std::fmt;

use serde::{Deserialize, Serialize};
use strum::EnumString;

use super::usage::Usage;

/// One incremental signal from the provider stream, in arrival order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamSignal {
    /// The provider opened a message. `message_id` is required before any
    /// event referencing the turn may be emitted.
    StreamStart {
        message_id: Option<String>,
        #[serde(default)]
        usage: Usage,
    },
    BlockStart {
        index: usize,
        block: BlockSeed,
    },
    BlockDelta {
        index: usize,
        delta: BlockDeltaKind,
    },
    BlockStop {
        index: usize,
    },
    /// Terminal metadata for the turn.
    TurnDelta {
        stop_reason: Option<StopReason>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stop_sequence: Option<String>,
        #[serde(default)]
        usage: Usage,
    },
    StreamEnd,
}

/// Initial content of a block announced by `BlockStart`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlockSeed {
    Text {
        #[serde(default)]
        text: String,
    },
    Thinking {
        #[serde(default)]
        thinking: String,
    },
    RedactedThinking {
        data: String,
    },
    ToolUse {
        #[serde(default)]
        id: Option<String>,
        name: String,
        #[serde(default)]
        input: serde_json::Value,
    },
}

/// Partial content for an open block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum BlockDeltaKind {
    Text(String),
    Thinking(String),
    Signature(String),
    InputJson(String),
    Citation(CitationFragment),
}

/// A citation attached to a text block by the provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CitationFragment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cited_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_index: Option<usize>,
}

/// Why the provider ended a turn.
#[derive(Debug, Clone, PartialEq, Eq, Hash, EnumString, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
#[strum(serialize_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    StopSequence,
    MaxTokens,
    Refusal,
    PauseTurn,
    ToolUse,
    #[strum(default)]
    Other(String),
}

impl StopReason {
    /// Parse a wire value. Unrecognised values land in [`StopReason::Other`].
    pub fn parse(raw: &str) -> Self {
        raw.parse().unwrap_or_else(|_| Self::Other(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::EndTurn => "end_turn",
            Self::StopSequence => "stop_sequence",
            Self::MaxTokens => "max_tokens",
            Self::Refusal => "refusal",
            Self::PauseTurn => "pause_turn",
            Self::ToolUse => "tool_use",
            Self::Other(raw) => raw,
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for StopReason {
    fn from(raw: String) -> Self {
        Self::parse(&raw)
    }
}

impl From<StopReason> for String {
    fn from(reason: StopReason) -> Self {
        reason.as_str().to_string()
    }
}
