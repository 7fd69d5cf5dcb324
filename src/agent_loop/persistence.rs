//! Durable persistence collaborators and the fire-and-forget worker.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{EngineError, Result};

use super::events::{AgentEvent, PersistenceState};

/// Normalised record of one tool execution, as handed to the durable sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolExecutionRecord {
    pub tool_use_id: String,
    pub tool_name: String,
    pub input: serde_json::Value,
    pub result: serde_json::Value,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub executed_at: DateTime<Utc>,
}

/// Durable store for tool executions and agent events.
///
/// Both calls may fail; the engine logs failures and moves on.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn persist_tool_events(
        &self,
        session_id: &str,
        executions: Vec<ToolExecutionRecord>,
    ) -> Result<()>;

    async fn append_event(
        &self,
        session_id: &str,
        event_type: &str,
        data: serde_json::Value,
    ) -> Result<()>;
}

/// Sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventSink;

#[async_trait]
impl EventSink for NoopEventSink {
    async fn persist_tool_events(&self, _: &str, _: Vec<ToolExecutionRecord>) -> Result<()> {
        Ok(())
    }

    async fn append_event(&self, _: &str, _: &str, _: serde_json::Value) -> Result<()> {
        Ok(())
    }
}

/// An event row as stored by [`InMemoryEventSink`].
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEvent {
    pub session_id: String,
    pub event_type: String,
    pub data: serde_json::Value,
}

impl StoredEvent {
    pub fn sequence(&self) -> Option<u64> {
        self.data.get("sequence").and_then(serde_json::Value::as_u64)
    }
}

/// Sink that keeps everything in memory. Can be told to fail every call.
#[derive(Debug, Default)]
pub struct InMemoryEventSink {
    events: Mutex<Vec<StoredEvent>>,
    tool_batches: Mutex<Vec<(String, Vec<ToolExecutionRecord>)>>,
    fail_with: Option<String>,
}

impl InMemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink whose every call returns a persistence error.
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            fail_with: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn events(&self) -> Vec<StoredEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn tool_batches(&self) -> Vec<(String, Vec<ToolExecutionRecord>)> {
        self.tool_batches
            .lock()
            .map(|b| b.clone())
            .unwrap_or_default()
    }

    fn check(&self) -> Result<()> {
        match &self.fail_with {
            Some(message) => Err(EngineError::Persistence(message.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl EventSink for InMemoryEventSink {
    async fn persist_tool_events(
        &self,
        session_id: &str,
        executions: Vec<ToolExecutionRecord>,
    ) -> Result<()> {
        self.check()?;
        self.tool_batches
            .lock()
            .map_err(|_| EngineError::Persistence("tool batch lock poisoned".into()))?
            .push((session_id.to_string(), executions));
        Ok(())
    }

    async fn append_event(
        &self,
        session_id: &str,
        event_type: &str,
        data: serde_json::Value,
    ) -> Result<()> {
        self.check()?;
        self.events
            .lock()
            .map_err(|_| EngineError::Persistence("event lock poisoned".into()))?
            .push(StoredEvent {
                session_id: session_id.to_string(),
                event_type: event_type.to_string(),
                data,
            });
        Ok(())
    }
}

enum PersistJob {
    ToolEvents {
        session_id: String,
        executions: Vec<ToolExecutionRecord>,
    },
    Event {
        session_id: String,
        event_type: &'static str,
        data: serde_json::Value,
    },
}

/// Handle to a background task that drains persistence jobs in order.
///
/// Enqueueing never blocks and never fails from the caller's point of view.
/// The worker exits once every handle is dropped and the queue is empty.
#[derive(Clone)]
pub struct PersistenceHandle {
    tx: mpsc::UnboundedSender<PersistJob>,
}

impl PersistenceHandle {
    /// Spawn the worker on the current tokio runtime.
    pub fn spawn(sink: Arc<dyn EventSink>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<PersistJob>();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                run_job(sink.as_ref(), job).await;
            }
            debug!("persistence worker drained");
        });
        Self { tx }
    }

    /// Whether the worker has stopped, for instance because the runtime it
    /// was spawned on shut down.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Queue a batch of tool executions for the durable sink.
    pub fn persist_tool_events(&self, session_id: &str, executions: Vec<ToolExecutionRecord>) {
        if executions.is_empty() {
            return;
        }
        self.enqueue(PersistJob::ToolEvents {
            session_id: session_id.to_string(),
            executions,
        });
    }

    /// Queue an event for the durable log. Transient events are ignored.
    pub fn append_event(&self, event: &AgentEvent) {
        if event.persistence != PersistenceState::Pending {
            return;
        }
        let data = match serde_json::to_value(event) {
            Ok(data) => data,
            Err(err) => {
                warn!(
                    session_id = %event.session_id,
                    sequence = event.sequence,
                    error = %err,
                    "failed to serialise event for persistence"
                );
                return;
            }
        };
        self.enqueue(PersistJob::Event {
            session_id: event.session_id.clone(),
            event_type: event.event_type(),
            data,
        });
    }

    fn enqueue(&self, job: PersistJob) {
        if self.tx.send(job).is_err() {
            warn!("persistence worker is gone; dropping job");
        }
    }
}

async fn run_job(sink: &dyn EventSink, job: PersistJob) {
    let (session_id, what, fut) = match job {
        PersistJob::ToolEvents {
            session_id,
            executions,
        } => {
            let what = format!("{} tool executions", executions.len());
            let sid = session_id.clone();
            let fut = async move { sink.persist_tool_events(&sid, executions).await }.boxed();
            (session_id, what, fut)
        }
        PersistJob::Event {
            session_id,
            event_type,
            data,
        } => {
            let sid = session_id.clone();
            let fut = async move { sink.append_event(&sid, event_type, data).await }.boxed();
            (session_id, format!("{event_type} event"), fut)
        }
    };
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            warn!(session_id = %session_id, job = %what, error = %err, "persistence failed");
        }
        Err(_) => {
            warn!(session_id = %session_id, job = %what, "persistence sink panicked");
        }
    }
}
