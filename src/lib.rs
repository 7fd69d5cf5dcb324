//! Toolstream: a streaming tool-orchestration engine.
//!
//! Drives a language model through a multi-turn conversation: streams each
//! turn, accumulates its content blocks, runs the requested tools behind an
//! approval gate, and emits a totally ordered, sequenced event stream to a
//! live callback and a durable sink.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use toolstream::prelude::*;
//!
//! # async fn example() -> toolstream::error::Result<()> {
//! let config = EngineConfig::load()?;
//! let engine = TurnLoop::from_config(config, ToolCatalog::new())?;
//! let callback: EventCallback = Arc::new(|event| tracing::info!(?event, "agent event"));
//! let result = engine
//!     .run(
//!         RunRequest::builder()
//!             .session_id("session-1")
//!             .query("Which orders are overdue?")
//!             .callback(callback)
//!             .build(),
//!     )
//!     .await;
//! assert_eq!(result.status, RunStatus::Completed);
//! # Ok(())
//! # }
//! ```

pub mod agent_loop;
pub mod config;
pub mod error;
pub mod prelude;
pub mod provider;
pub mod tools;
pub mod types;
