//! Name-keyed registry of tool handlers plus their mutation classification.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use super::tool::Tool;
use super::types::{ToolClass, ToolOutput};
use crate::provider::ToolDefinition;

/// The set of tools offered to the model for a run.
#[derive(Clone, Default)]
pub struct ToolCatalog {
    tools: HashMap<String, Arc<dyn Tool>>,
    classes: HashMap<String, ToolClass>,
    order: Vec<String>,
}

impl ToolCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool under its own name. Re-registering a name replaces the handler.
    pub fn register(&mut self, tool: Arc<dyn Tool>, class: ToolClass) -> &mut Self {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), tool).is_none() {
            self.order.push(name.clone());
        }
        self.classes.insert(name, class);
        self
    }

    pub fn with(mut self, tool: Arc<dyn Tool>, class: ToolClass) -> Self {
        self.register(tool, class);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    /// Static classification lookup. Names that were never registered are
    /// treated as mutating so they can never slip past the approval gate.
    pub fn classify(&self, name: &str) -> ToolClass {
        self.classes
            .get(name)
            .copied()
            .unwrap_or(ToolClass::Mutating)
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Definitions sent to the provider, in registration order.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| ToolDefinition {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                input_schema: tool.parameters().schema.clone(),
            })
            .collect()
    }

    /// Run a tool and normalise whatever it returns into a [`ToolOutput`].
    pub async fn invoke(&self, name: &str, input: &serde_json::Value) -> ToolOutput {
        let Some(tool) = self.tools.get(name) else {
            warn!(tool_name = name, "model requested unknown tool");
            return ToolOutput::failed(format!("Tool '{name}' not found"));
        };
        match tool.execute(input).await {
            Ok(output) => {
                if !output.success && output.error.is_none() {
                    return ToolOutput {
                        error: Some(format!("Tool '{name}' reported failure")),
                        ..output
                    };
                }
                output
            }
            Err(err) => {
                warn!(tool_name = name, error = %err, "tool handler failed");
                ToolOutput::failed(err.to_string())
            }
        }
    }
}

impl std::fmt::Debug for ToolCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolCatalog")
            .field("tools", &self.order)
            .field("classes", &self.classes)
            .finish()
    }
}
