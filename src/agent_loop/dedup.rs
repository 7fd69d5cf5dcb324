//! Per-context tool invocation deduplication.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

/// Outcome of [`SeenInvocations::check_and_mark`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DedupOutcome {
    pub is_duplicate: bool,
    pub first_seen_at: DateTime<Utc>,
}

/// Invocation ids already processed in one execution context, with the time
/// each was first seen. Never shared across contexts.
#[derive(Debug, Default, Clone)]
pub struct SeenInvocations {
    seen: HashMap<String, DateTime<Utc>>,
}

impl SeenInvocations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `id` as seen now, or report that it already was.
    pub fn check_and_mark(&mut self, id: &str) -> DedupOutcome {
        self.check_and_mark_at(id, Utc::now())
    }

    /// Same as [`check_and_mark`](Self::check_and_mark) with an explicit clock.
    /// An existing timestamp is never overwritten.
    pub fn check_and_mark_at(&mut self, id: &str, now: DateTime<Utc>) -> DedupOutcome {
        if let Some(first) = self.seen.get(id) {
            return DedupOutcome {
                is_duplicate: true,
                first_seen_at: *first,
            };
        }
        self.seen.insert(id.to_string(), now);
        DedupOutcome {
            is_duplicate: false,
            first_seen_at: now,
        }
    }

    pub fn first_seen(&self, id: &str) -> Option<DateTime<Utc>> {
        self.seen.get(id).copied()
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
