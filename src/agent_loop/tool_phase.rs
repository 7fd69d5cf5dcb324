//! Tool execution for one assistant turn: dedup, approval, invoke, emit.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use tracing::{debug, info, warn};

use crate::tools::{ToolCatalog, ToolClass, ToolOutput};
use crate::types::ToolResultPart;

use super::approvals::{resolve_approval, ApprovalGate, AutoApprove};
use super::context::ExecutionContext;
use super::events::AgentEventPayload;
use super::persistence::ToolExecutionRecord;
use super::types::ToolInvocation;

pub(crate) const CANCELLED_BY_USER: &str = "Tool execution cancelled by user";
pub(crate) const DUPLICATE_SKIPPED: &str = "Duplicate tool invocation skipped";

/// Everything a tool phase produced.
#[derive(Debug, Clone, Default)]
pub struct ToolPhaseOutcome {
    /// Names of tools that actually ran, in input order.
    pub executed: Vec<String>,
    /// One result per input invocation, duplicates included, for the
    /// conversation sent back to the provider.
    pub results: Vec<ToolResultPart>,
    /// Records handed to the durable sink.
    pub records: Vec<ToolExecutionRecord>,
}

/// Runs the tool calls of a turn in order.
#[derive(Clone)]
pub struct ToolExecutionCoordinator {
    catalog: Arc<ToolCatalog>,
    gate: Arc<dyn ApprovalGate>,
    approval_timeout: Duration,
}

impl ToolExecutionCoordinator {
    pub fn new(catalog: Arc<ToolCatalog>) -> Self {
        Self {
            catalog,
            gate: Arc::new(AutoApprove),
            approval_timeout: Duration::from_secs(crate::config::DEFAULT_APPROVAL_TIMEOUT_SECS),
        }
    }

    pub fn with_gate(mut self, gate: Arc<dyn ApprovalGate>) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_approval_timeout(mut self, timeout: Duration) -> Self {
        self.approval_timeout = timeout;
        self
    }

    pub fn catalog(&self) -> &ToolCatalog {
        &self.catalog
    }

    /// Execute the invocations and return the names of the tools that ran.
    /// `None` or an empty slice does nothing.
    pub async fn process_executions(
        &self,
        executions: Option<&[ToolInvocation]>,
        ctx: &mut ExecutionContext,
    ) -> Vec<String> {
        self.execute_batch(executions.unwrap_or_default(), ctx)
            .await
            .executed
    }

    /// Execute the invocations, emitting a `tool_use`/`tool_result` pair for
    /// each unique id and queuing one persistence call for the whole batch.
    pub async fn execute_batch(
        &self,
        executions: &[ToolInvocation],
        ctx: &mut ExecutionContext,
    ) -> ToolPhaseOutcome {
        let mut outcome = ToolPhaseOutcome::default();
        if executions.is_empty() {
            return outcome;
        }

        for invocation in executions {
            let dedup = ctx.check_and_mark(&invocation.id);
            if dedup.is_duplicate {
                debug!(
                    session_id = %ctx.session_id,
                    tool_use_id = %invocation.id,
                    first_seen_at = %dedup.first_seen_at,
                    "skipping duplicate tool invocation"
                );
                outcome.results.push(ToolResultPart {
                    tool_use_id: invocation.id.clone(),
                    content: serde_json::json!({ "error": DUPLICATE_SKIPPED }),
                    is_error: true,
                });
                continue;
            }

            let (output, ran) = self.run_one(invocation, &ctx.session_id).await;
            if ran {
                outcome.executed.push(invocation.name.clone());
            }

            let pair = vec![
                AgentEventPayload::ToolUse {
                    tool_use_id: invocation.id.clone(),
                    tool_name: invocation.name.clone(),
                    input: invocation.input.clone(),
                },
                AgentEventPayload::ToolResult {
                    tool_use_id: invocation.id.clone(),
                    tool_name: invocation.name.clone(),
                    success: output.success,
                    result: output.result.clone(),
                    error: output.error.clone(),
                },
            ];
            let executed_at = match ctx.emitter.emit_batch(pair).await {
                Ok(events) => events.first().map(|e| e.timestamp).unwrap_or_else(Utc::now),
                Err(err) => {
                    warn!(
                        session_id = %ctx.session_id,
                        tool_use_id = %invocation.id,
                        error = %err,
                        "could not sequence tool events"
                    );
                    Utc::now()
                }
            };

            outcome.results.push(ToolResultPart {
                tool_use_id: invocation.id.clone(),
                content: output.result.clone(),
                is_error: !output.success,
            });
            outcome.records.push(ToolExecutionRecord {
                tool_use_id: invocation.id.clone(),
                tool_name: invocation.name.clone(),
                input: invocation.input.clone(),
                result: output.result,
                success: output.success,
                error: output.error,
                executed_at,
            });
        }

        ctx.emitter
            .persistence()
            .persist_tool_events(&ctx.session_id, outcome.records.clone());
        outcome
    }

    /// Returns the normalised output and whether the handler actually ran.
    async fn run_one(&self, invocation: &ToolInvocation, session_id: &str) -> (ToolOutput, bool) {
        let name = invocation.name.as_str();
        if self.catalog.get(name).is_none() {
            warn!(session_id = %session_id, tool_name = name, "model requested unknown tool");
            return (ToolOutput::failed(format!("Tool '{name}' not found")), false);
        }

        if self.catalog.classify(name) == ToolClass::Mutating {
            let decision = resolve_approval(
                self.gate.as_ref(),
                self.approval_timeout,
                session_id,
                name,
                &invocation.input,
            )
            .await;
            if !decision.is_approved() {
                info!(
                    session_id = %session_id,
                    tool_use_id = %invocation.id,
                    tool_name = name,
                    "tool call denied"
                );
                return (ToolOutput::failed(CANCELLED_BY_USER), false);
            }
        }

        let call = self.catalog.invoke(name, &invocation.input);
        match AssertUnwindSafe(call).catch_unwind().await {
            Ok(output) => (output, true),
            Err(_) => {
                warn!(
                    session_id = %session_id,
                    tool_use_id = %invocation.id,
                    tool_name = name,
                    "tool handler panicked"
                );
                (ToolOutput::failed(format!("Tool '{name}' panicked")), true)
            }
        }
    }
}
