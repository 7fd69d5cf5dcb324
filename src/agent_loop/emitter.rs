//! Sequenced event emission to the live callback and the durable log.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use chrono::Utc;
use tracing::warn;
use uuid::Uuid;

use crate::error::{EngineError, Result};

use super::events::{AgentEvent, AgentEventPayload};
use super::persistence::PersistenceHandle;
use super::sequencer::{SequenceReservation, SequenceSource};

/// Callback used for streaming agent events to a live consumer.
pub type EventCallback = Arc<dyn Fn(AgentEvent) + Send + Sync>;

/// Builds sequenced events for one session and hands them out in order.
///
/// Every event is delivered to the callback first, then queued for the
/// durable log when its persistence state is pending.
pub struct EventEmitter {
    session_id: String,
    sequencer: Arc<dyn SequenceSource>,
    callback: Option<EventCallback>,
    persistence: PersistenceHandle,
}

impl EventEmitter {
    pub fn new(
        session_id: impl Into<String>,
        sequencer: Arc<dyn SequenceSource>,
        callback: Option<EventCallback>,
        persistence: PersistenceHandle,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            sequencer,
            callback,
            persistence,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn persistence(&self) -> &PersistenceHandle {
        &self.persistence
    }

    /// Reserve `count` contiguous sequence numbers for this session.
    pub async fn reserve(&self, count: usize) -> Result<SequenceReservation> {
        self.sequencer.reserve(&self.session_id, count).await
    }

    /// Sequence and deliver a single event.
    pub async fn emit(&self, payload: AgentEventPayload) -> Result<AgentEvent> {
        self.emit_batch(vec![payload])
            .await?
            .pop()
            .ok_or_else(|| EngineError::Persistence("sequencer returned an empty reservation".into()))
    }

    /// Sequence a batch with one reservation and deliver it in order.
    ///
    /// All events in the batch share one timestamp.
    pub async fn emit_batch(&self, payloads: Vec<AgentEventPayload>) -> Result<Vec<AgentEvent>> {
        if payloads.is_empty() {
            return Ok(Vec::new());
        }
        let reservation = self.reserve(payloads.len()).await?;
        let timestamp = Utc::now();
        let events: Vec<AgentEvent> = payloads
            .into_iter()
            .zip(reservation.sequences)
            .map(|(payload, sequence)| AgentEvent {
                event_id: Uuid::new_v4(),
                session_id: self.session_id.clone(),
                sequence,
                timestamp,
                persistence: payload.default_persistence(),
                payload,
            })
            .collect();
        for event in &events {
            self.deliver(event);
        }
        Ok(events)
    }

    fn deliver(&self, event: &AgentEvent) {
        if let Some(callback) = &self.callback {
            let owned = event.clone();
            if catch_unwind(AssertUnwindSafe(|| callback(owned))).is_err() {
                warn!(
                    session_id = %self.session_id,
                    sequence = event.sequence,
                    event_type = event.event_type(),
                    "event callback panicked; continuing delivery"
                );
            }
        }
        self.persistence.append_event(event);
    }
}
