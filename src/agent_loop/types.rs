//! Core run types for the turn loop.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ModelMessage, UsageSummary};

use super::citations::Citation;
use super::files::CitedFile;

/// A tool call requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
}

/// Terminal status of a run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    /// The provider paused the turn; call again with the returned messages to resume.
    Paused,
    Failed,
}

/// Result of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    /// Text of the final `message` event (or the pause point's partial text).
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub usage: UsageSummary,
    pub turns: usize,
    /// Tools actually executed, across all turns, in execution order.
    #[serde(default)]
    pub executed_tools: Vec<String>,
    #[serde(default)]
    pub citations: Vec<Citation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cited_files: Option<Vec<CitedFile>>,
    /// Full conversation including this run's assistant turns and tool results.
    #[serde(default)]
    pub messages: Vec<ModelMessage>,
    pub finished_at: DateTime<Utc>,
}

impl RunResult {
    pub(crate) fn new(status: RunStatus, messages: Vec<ModelMessage>) -> Self {
        Self {
            status,
            message_id: None,
            text: String::new(),
            error: None,
            usage: UsageSummary::default(),
            turns: 0,
            executed_tools: Vec::new(),
            citations: Vec::new(),
            cited_files: None,
            messages,
            finished_at: Utc::now(),
        }
    }

    pub fn failed(error: impl Into<String>, messages: Vec<ModelMessage>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::new(RunStatus::Failed, messages)
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == RunStatus::Completed
    }
}
