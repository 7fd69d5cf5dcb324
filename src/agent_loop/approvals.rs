//! Approval gate for mutating tool calls.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::error::{EngineError, Result};

/// Decision returned by an approval gate.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approve,
    Deny,
}

impl ApprovalDecision {
    pub fn is_approved(self) -> bool {
        matches!(self, Self::Approve)
    }
}

impl From<bool> for ApprovalDecision {
    fn from(approved: bool) -> Self {
        if approved {
            Self::Approve
        } else {
            Self::Deny
        }
    }
}

/// Asks an external party whether a mutating tool call may run.
#[async_trait]
pub trait ApprovalGate: Send + Sync {
    async fn request(
        &self,
        session_id: &str,
        tool_name: &str,
        arguments: &serde_json::Value,
    ) -> Result<ApprovalDecision>;
}

/// Approves everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoApprove;

#[async_trait]
impl ApprovalGate for AutoApprove {
    async fn request(&self, _: &str, _: &str, _: &serde_json::Value) -> Result<ApprovalDecision> {
        Ok(ApprovalDecision::Approve)
    }
}

/// Denies everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct DenyAll;

#[async_trait]
impl ApprovalGate for DenyAll {
    async fn request(&self, _: &str, _: &str, _: &serde_json::Value) -> Result<ApprovalDecision> {
        Ok(ApprovalDecision::Deny)
    }
}

/// A pending approval, delivered to the consumer of a [`ChannelApprovalGate`].
#[derive(Debug)]
pub struct ApprovalRequest {
    pub session_id: String,
    pub tool_name: String,
    pub arguments: serde_json::Value,
    responder: oneshot::Sender<ApprovalDecision>,
}

impl ApprovalRequest {
    /// Send the decision back. Returns false if the gate stopped waiting.
    pub fn respond(self, decision: ApprovalDecision) -> bool {
        self.responder.send(decision).is_ok()
    }

    pub fn approve(self) -> bool {
        self.respond(ApprovalDecision::Approve)
    }

    pub fn deny(self) -> bool {
        self.respond(ApprovalDecision::Deny)
    }
}

/// Forwards approval requests over a channel to whoever holds the receiver,
/// typically a UI bridge.
#[derive(Debug, Clone)]
pub struct ChannelApprovalGate {
    tx: mpsc::Sender<ApprovalRequest>,
}

impl ChannelApprovalGate {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<ApprovalRequest>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ApprovalGate for ChannelApprovalGate {
    async fn request(
        &self,
        session_id: &str,
        tool_name: &str,
        arguments: &serde_json::Value,
    ) -> Result<ApprovalDecision> {
        let (responder, decision) = oneshot::channel();
        self.tx
            .send(ApprovalRequest {
                session_id: session_id.to_string(),
                tool_name: tool_name.to_string(),
                arguments: arguments.clone(),
                responder,
            })
            .await
            .map_err(|_| EngineError::Approval("approval channel closed".into()))?;
        decision
            .await
            .map_err(|_| EngineError::Approval("approval responder dropped".into()))
    }
}

/// Ask the gate, bounded by `timeout`. A timeout or gate error is a denial.
pub async fn resolve_approval(
    gate: &dyn ApprovalGate,
    timeout: Duration,
    session_id: &str,
    tool_name: &str,
    arguments: &serde_json::Value,
) -> ApprovalDecision {
    match tokio::time::timeout(timeout, gate.request(session_id, tool_name, arguments)).await {
        Ok(Ok(decision)) => decision,
        Ok(Err(err)) => {
            warn!(
                session_id = %session_id,
                tool_name = %tool_name,
                error = %err,
                "approval gate failed; treating as denial"
            );
            ApprovalDecision::Deny
        }
        Err(_) => {
            warn!(
                session_id = %session_id,
                tool_name = %tool_name,
                timeout_secs = timeout.as_secs(),
                "approval timed out; treating as denial"
            );
            ApprovalDecision::Deny
        }
    }
}
