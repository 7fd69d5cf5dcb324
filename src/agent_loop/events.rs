//! Agent events delivered to the live callback and the durable log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::error::ErrorCategory;
use crate::types::{StopReason, UsageSummary};

use super::citations::Citation;
use super::files::CitedFile;

/// Whether an event is headed for the durable log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PersistenceState {
    /// Will be appended to the durable log.
    Pending,
    /// Live channel only.
    Transient,
}

/// Event payloads emitted by the turn loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEventPayload {
    ToolUse {
        tool_use_id: String,
        tool_name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        tool_name: String,
        success: bool,
        result: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    ThinkingChunk {
        message_id: String,
        text: String,
    },
    MessageChunk {
        message_id: String,
        text: String,
    },
    Message {
        message_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stop_reason: Option<StopReason>,
    },
    TurnPaused {
        message_id: String,
        turn: usize,
    },
    ContentRefused {
        message_id: String,
        reason: String,
        content: String,
    },
    Complete {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
        turns: usize,
        usage: UsageSummary,
        #[serde(default)]
        citations: Vec<Citation>,
        /// Present only when at least one file was used.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cited_files: Option<Vec<CitedFile>>,
    },
    Error {
        message: String,
        category: ErrorCategory,
    },
}

impl AgentEventPayload {
    /// Wire name of the variant, as used for the durable log's event type.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ToolUse { .. } => "tool_use",
            Self::ToolResult { .. } => "tool_result",
            Self::ThinkingChunk { .. } => "thinking_chunk",
            Self::MessageChunk { .. } => "message_chunk",
            Self::Message { .. } => "message",
            Self::TurnPaused { .. } => "turn_paused",
            Self::ContentRefused { .. } => "content_refused",
            Self::Complete { .. } => "complete",
            Self::Error { .. } => "error",
        }
    }

    /// Default persistence for the variant. Streaming chunks are live-only.
    pub fn default_persistence(&self) -> PersistenceState {
        match self {
            Self::ThinkingChunk { .. } | Self::MessageChunk { .. } => PersistenceState::Transient,
            Self::ToolUse { .. }
            | Self::ToolResult { .. }
            | Self::Message { .. }
            | Self::TurnPaused { .. }
            | Self::ContentRefused { .. }
            | Self::Complete { .. }
            | Self::Error { .. } => PersistenceState::Pending,
        }
    }
}

/// A sequenced event. Serialises flat: envelope fields sit beside the
/// payload's `type` tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentEvent {
    pub event_id: Uuid,
    pub session_id: String,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub persistence: PersistenceState,
    #[serde(flatten)]
    pub payload: AgentEventPayload,
}

impl AgentEvent {
    pub fn event_type(&self) -> &'static str {
        self.payload.event_type()
    }
}
