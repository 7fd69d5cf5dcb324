//! Turn loop primitives (runs, events, tools, approvals, persistence).

pub mod accumulator;
pub mod approvals;
pub mod citations;
pub mod context;
pub mod dedup;
pub mod emitter;
pub mod events;
pub mod files;
pub mod persistence;
pub mod runner;
pub mod sequencer;
pub mod tool_phase;
pub mod types;

pub use accumulator::{AccumulatedTurn, ContentBlock, ContentBlockAccumulator, LiveDelta, StreamAnomaly};
pub use approvals::*;
pub use citations::{Citation, CitationAccumulator, CitationResolution};
pub use context::ExecutionContext;
pub use dedup::{DedupOutcome, SeenInvocations};
pub use emitter::{EventCallback, EventEmitter};
pub use events::*;
pub use files::*;
pub use persistence::*;
pub use runner::*;
pub use sequencer::*;
pub use tool_phase::{ToolExecutionCoordinator, ToolPhaseOutcome};
pub use types::*;
