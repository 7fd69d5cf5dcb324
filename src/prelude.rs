//! Convenience re-exports for common use.

pub use crate::agent_loop::{
    AgentEvent, AgentEventPayload, ApprovalDecision, ApprovalGate, EventCallback, EventSink,
    RunRequest, RunResult, RunStatus, TurnLoop,
};
pub use crate::config::EngineConfig;
pub use crate::error::{EngineError, Result};
pub use crate::provider::StreamingProvider;
pub use crate::tools::{FnTool, Tool, ToolCatalog, ToolClass, ToolOutput, ToolParameters};
pub use crate::types::{ContentPart, ModelMessage, Role, StopReason, Usage, UsageSummary};
