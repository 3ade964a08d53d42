//! Tool vocabulary exposed to the language model.
//!
//! A [`ToolSpec`] is the `{name, description, input_schema}` contract
//! the external LLM transport is handed; the engine accepts tool
//! outputs of any shape and surfaces them as tool-result entries,
//! matching the "Agent tool schema" contract. Dispatch itself —
//! deciding what a `transition_to_*` or `read_<C>` tool call actually
//! does — lives in the effect executor; this module only carries the
//! data.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// `{name, description, input_schema: {type: "object", properties,
/// required?}}` — the shape handed to the LLM transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

impl ToolSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>, input_schema: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
        }
    }

    /// A schema with no required parameters — most `transition_to_*`
    /// tools need nothing beyond their own invocation.
    pub fn empty_object_schema() -> Value {
        serde_json::json!({ "type": "object", "properties": {} })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub args: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallResult {
    pub id: String,
    pub name: String,
    pub output: ToolOutput,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ToolOutput {
    Success { content: Value },
    Error { error: String },
}

impl ToolOutput {
    pub fn is_error(&self) -> bool {
        matches!(self, ToolOutput::Error { .. })
    }

    pub fn success_content(&self) -> Option<&Value> {
        match self {
            ToolOutput::Success { content } => Some(content),
            ToolOutput::Error { .. } => None,
        }
    }
}

#[derive(Debug, Error, Clone, Serialize, Deserialize)]
pub enum ToolError {
    #[error("tool '{0}' not found among: {1}")]
    NotFound(String, String),
    #[error("invalid arguments for tool '{tool}': {error}")]
    InvalidArguments { tool: String, error: String },
    #[error("tool '{tool}' execution failed: {error}")]
    ExecutionFailed { tool: String, error: String },
    #[error("write to '{ctx}' rejected: node '{node}' has no write permission")]
    PermissionDenied { node: String, ctx: String },
}

/// The kind of machine-derived tool a node exposes, used by the
/// effect executor to dispatch a `ToolCall` without re-deriving intent
/// from the tool's name string.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ToolKind {
    TransitionTo { target: String },
    SpawnAsyncTo { target: String },
    MapSpawnTo { target: String },
    ReadContext { ctx: String },
    WriteContext { ctx: String },
    Meta(MetaToolKind),
    Dynamic,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum MetaToolKind {
    GetMachineDefinition,
    UpdateDefinition,
    ConstructTool,
    ListAvailableTools,
    GetToolNodes,
    BuildToolFromNode,
    ProposeToolImprovement,
}

/// A synthesized tool: the LLM-facing spec plus the kind that lets the
/// effect executor dispatch it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesizedTool {
    pub spec: ToolSpec,
    pub kind: ToolKind,
}

/// Registry of dynamically constructed tools, keyed by name — backs
/// the Meta-Tool Manager's `construct_tool`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolRegistry {
    tools: HashMap<String, SynthesizedTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: SynthesizedTool) {
        self.tools.insert(tool.spec.name.clone(), tool);
    }

    pub fn get(&self, name: &str) -> Option<&SynthesizedTool> {
        self.tools.get(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub fn all(&self) -> impl Iterator<Item = &SynthesizedTool> {
        self.tools.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_round_trips() {
        let mut reg = ToolRegistry::new();
        reg.register(SynthesizedTool {
            spec: ToolSpec::new("transition_to_b", "go to b", ToolSpec::empty_object_schema()),
            kind: ToolKind::TransitionTo { target: "b".into() },
        });
        assert!(reg.get("transition_to_b").is_some());
        assert_eq!(reg.names(), vec!["transition_to_b".to_string()]);
    }
}
