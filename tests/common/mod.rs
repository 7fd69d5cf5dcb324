//! Shared test helpers.

use std::sync::{Arc, Mutex};

use toolstream::agent_loop::{
    AgentEvent, EventCallback, EventEmitter, ExecutionContext, InMemoryEventSink,
    InMemorySequencer, PersistenceHandle, ToolInvocation,
};

/// Collects every event delivered to the live callback.
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
}

/// A fresh execution context wired to an in-memory sequencer and sink.
pub fn context(session_id: &str, capture: &Capture, sink: Arc<InMemoryEventSink>) -> ExecutionContext {
    let emitter = EventEmitter::new(
        session_id,
        Arc::new(InMemorySequencer::new()),
        Some(capture.callback()),
        PersistenceHandle::spawn(sink),
    );
    ExecutionContext::new(session_id, Some("user-1".to_string()), emitter)
}

pub fn invocation(id: &str, name: &str, input: serde_json::Value) -> ToolInvocation {
    ToolInvocation {
        id: id.to_string(),
        name: name.to_string(),
        input,
    }
}

/// Give the persistence worker a moment to drain.
pub async fn settle() {
    tokio::time::sleep(std::time::Duration::from_millis(25)).await;
}
