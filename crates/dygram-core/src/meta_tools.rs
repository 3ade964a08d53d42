//! Meta-Tool Manager: handlers for the seven tools exposed
//! to nodes carrying `@meta`, covering machine introspection and
//! runtime tool construction.
//!
//! The [`ToolRegistry`] dynamic tools live outside [`ExecutionState`]
//! deliberately — they are derived, re-buildable state, not part of
//! the snapshot the session store persists (see DESIGN.md).

use serde_json::Value;

use crate::error::Result;
use crate::model::ExecutionState;
use crate::state;
use crate::tool::{MetaToolKind, SynthesizedTool, ToolCall, ToolCallResult, ToolOutput, ToolRegistry, ToolSpec};

fn success(call: &ToolCall, content: Value) -> ToolCallResult {
    ToolCallResult {
        id: call.id.clone(),
        name: call.name.clone(),
        output: ToolOutput::Success { content },
    }
}

fn failure(call: &ToolCall, error: impl std::fmt::Display) -> ToolCallResult {
    ToolCallResult {
        id: call.id.clone(),
        name: call.name.clone(),
        output: ToolOutput::Error { error: error.to_string() },
    }
}

/// Dispatches one meta-tool call, mutating `registry` in place when the
/// call constructs or refines a dynamic tool, and returning a new
/// [`ExecutionState`] only when `update_definition` replaces the
/// machine snapshot.
pub fn apply_meta_tool_call(
    state: &ExecutionState,
    registry: &mut ToolRegistry,
    kind: &MetaToolKind,
    call: &ToolCall,
) -> Result<(ExecutionState, ToolCallResult)> {
    match kind {
        MetaToolKind::GetMachineDefinition => {
            let content = serde_json::to_value(&state.machine_snapshot)?;
            Ok((state.clone(), success(call, content)))
        }

        MetaToolKind::UpdateDefinition => {
            let Some(raw) = call.args.get("machine") else {
                return Ok((state.clone(), failure(call, "missing required argument 'machine'")));
            };
            let machine = match serde_json::from_value(raw.clone()) {
                Ok(m) => m,
                Err(e) => return Ok((state.clone(), failure(call, format!("invalid machine definition: {e}")))),
            };
            let next = state::update_machine_snapshot(state, machine);
            Ok((next, success(call, serde_json::json!({"updated": true}))))
        }

        MetaToolKind::ConstructTool => {
            let Some(name) = call.args.get("name").and_then(|v| v.as_str()) else {
                return Ok((state.clone(), failure(call, "missing required argument 'name'")));
            };
            let description = call
                .args
                .get("description")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            let schema = call
                .args
                .get("input_schema")
                .cloned()
                .unwrap_or_else(ToolSpec::empty_object_schema);
            registry.register(SynthesizedTool {
                spec: ToolSpec::new(name, description, schema),
                kind: crate::tool::ToolKind::Dynamic,
            });
            Ok((
                state.clone(),
                success(call, serde_json::json!({"registered": name, "available_next_turn": true})),
            ))
        }

        MetaToolKind::ListAvailableTools => {
            let names = registry.names();
            Ok((state.clone(), success(call, serde_json::json!(names))))
        }

        MetaToolKind::GetToolNodes => {
            let names: Vec<&str> = state
                .machine_snapshot
                .nodes
                .iter()
                .filter(|n| n.has_annotation("meta"))
                .map(|n| n.name.as_str())
                .collect();
            Ok((state.clone(), success(call, serde_json::json!(names))))
        }

        MetaToolKind::BuildToolFromNode => {
            let Some(node_name) = call.args.get("node").and_then(|v| v.as_str()) else {
                return Ok((state.clone(), failure(call, "missing required argument 'node'")));
            };
            let Some(node) = state.machine_snapshot.node(node_name) else {
                return Ok((
                    state.clone(),
                    failure(call, format!("no node named '{node_name}' in the current machine snapshot")),
                ));
            };
            let description = node
                .attribute("desc")
                .or_else(|| node.attribute("prompt"))
                .map(|a| a.value.clone())
                .unwrap_or_else(|| format!("Tool materialized from node '{node_name}'"));
            let schema = node
                .attribute("schema")
                .map(|a| a.parse())
                .unwrap_or_else(ToolSpec::empty_object_schema);
            let tool_name = format!("node_tool_{node_name}");
            registry.register(SynthesizedTool {
                spec: ToolSpec::new(tool_name.clone(), description, schema.clone()),
                kind: crate::tool::ToolKind::Dynamic,
            });
            Ok((
                state.clone(),
                success(call, serde_json::json!({"name": tool_name, "input_schema": schema})),
            ))
        }

        MetaToolKind::ProposeToolImprovement => {
            let Some(name) = call.args.get("name").and_then(|v| v.as_str()) else {
                return Ok((state.clone(), failure(call, "missing required argument 'name'")));
            };
            let Some(existing) = registry.get(name) else {
                return Ok((
                    state.clone(),
                    failure(call, format!("no dynamic tool named '{name}' to improve")),
                ));
            };
            let mut updated = existing.clone();
            if let Some(schema) = call.args.get("input_schema") {
                updated.spec.input_schema = schema.clone();
            }
            registry.register(updated);
            Ok((state.clone(), success(call, serde_json::json!({"improved": name}))))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ExecutionLimits, MachineJson, Node, NodeType};
    use crate::state::create_initial_state;

    fn state_with_meta_node() -> ExecutionState {
        let node = Node {
            name: "start".into(),
            r#type: Some(NodeType::State),
            parent: None,
            attributes: vec![],
            annotations: vec![crate::model::Annotation {
                name: "meta".into(),
                ..Default::default()
            }],
        };
        let machine = MachineJson {
            title: "t".into(),
            nodes: vec![node],
            edges: vec![],
        };
        create_initial_state(machine, ExecutionLimits::default()).unwrap()
    }

    #[test]
    fn construct_tool_registers_dynamic_tool() {
        let state = state_with_meta_node();
        let mut registry = ToolRegistry::new();
        let call = ToolCall {
            id: "1".into(),
            name: "construct_tool".into(),
            args: serde_json::json!({"name": "summarize", "description": "Summarize text"}),
        };
        let (_next, result) =
            apply_meta_tool_call(&state, &mut registry, &MetaToolKind::ConstructTool, &call).unwrap();
        assert!(!result.output.is_error());
        assert!(registry.get("summarize").is_some());
    }

    #[test]
    fn get_tool_nodes_finds_meta_annotated_node() {
        let state = state_with_meta_node();
        let mut registry = ToolRegistry::new();
        let call = ToolCall {
            id: "1".into(),
            name: "get_tool_nodes".into(),
            args: serde_json::json!({}),
        };
        let (_next, result) =
            apply_meta_tool_call(&state, &mut registry, &MetaToolKind::GetToolNodes, &call).unwrap();
        match result.output {
            ToolOutput::Success { content } => assert_eq!(content, serde_json::json!(["start"])),
            ToolOutput::Error { .. } => panic!("expected success"),
        }
    }

    #[test]
    fn propose_improvement_requires_existing_tool() {
        let state = state_with_meta_node();
        let mut registry = ToolRegistry::new();
        let call = ToolCall {
            id: "1".into(),
            name: "propose_tool_improvement".into(),
            args: serde_json::json!({"name": "missing"}),
        };
        let (_next, result) =
            apply_meta_tool_call(&state, &mut registry, &MetaToolKind::ProposeToolImprovement, &call).unwrap();
        assert!(result.output.is_error());
    }
}
