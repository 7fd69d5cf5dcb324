//! Per-request execution state.

use super::dedup::{DedupOutcome, SeenInvocations};
use super::emitter::EventEmitter;

/// State owned by one in-flight request. Created at the start of a run and
/// dropped when it finishes; never shared between requests.
pub struct ExecutionContext {
    pub session_id: String,
    pub user_id: Option<String>,
    pub emitter: EventEmitter,
    pub seen: SeenInvocations,
    pub turns: usize,
}

impl ExecutionContext {
    pub fn new(session_id: impl Into<String>, user_id: Option<String>, emitter: EventEmitter) -> Self {
        Self {
            session_id: session_id.into(),
            user_id,
            emitter,
            seen: SeenInvocations::new(),
            turns: 0,
        }
    }

    pub fn check_and_mark(&mut self, invocation_id: &str) -> DedupOutcome {
        self.seen.check_and_mark(invocation_id)
    }
}
