//! Per-session sequence number reservation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::{EngineError, Result};

/// A contiguous block of sequence numbers handed out in one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceReservation {
    pub start: u64,
    pub sequences: Vec<u64>,
}

impl SequenceReservation {
    fn contiguous(start: u64, count: usize) -> Self {
        Self {
            start,
            sequences: (start..start + count as u64).collect(),
        }
    }
}

/// Source of strictly increasing, never reused sequence numbers per session.
///
/// Implementations must serialise reservations for the same session.
#[async_trait]
pub trait SequenceSource: Send + Sync {
    async fn reserve(&self, session_id: &str, count: usize) -> Result<SequenceReservation>;
}

/// Process-local sequencer: one atomic counter per session.
#[derive(Debug, Default)]
pub struct InMemorySequencer {
    counters: Mutex<HashMap<String, Arc<AtomicU64>>>,
}

impl InMemorySequencer {
    pub fn new() -> Self {
        Self::default()
    }

    fn counter(&self, session_id: &str) -> Result<Arc<AtomicU64>> {
        let mut counters = self
            .counters
            .lock()
            .map_err(|_| EngineError::Persistence("sequence counter lock poisoned".into()))?;
        Ok(counters
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(AtomicU64::new(1)))
            .clone())
    }

    /// Next sequence number that would be handed out, without reserving it.
    pub fn peek(&self, session_id: &str) -> Option<u64> {
        let counters = self.counters.lock().ok()?;
        counters.get(session_id).map(|c| c.load(Ordering::SeqCst))
    }
}

#[async_trait]
impl SequenceSource for InMemorySequencer {
    async fn reserve(&self, session_id: &str, count: usize) -> Result<SequenceReservation> {
        if count == 0 {
            return Err(EngineError::Validation(
                "sequence reservation needs a positive count".into(),
            ));
        }
        let counter = self.counter(session_id)?;
        let start = counter.fetch_add(count as u64, Ordering::SeqCst);
        Ok(SequenceReservation::contiguous(start, count))
    }
}
