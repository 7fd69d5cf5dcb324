//! Tool system: handlers, parameter schemas, and the classified catalog.

pub mod catalog;
pub mod tool;
pub mod types;

pub use catalog::ToolCatalog;
pub use tool::{FnTool, Tool};
pub use types::{ToolClass, ToolOutput, ToolParameters};
