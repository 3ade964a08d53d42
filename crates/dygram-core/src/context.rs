//! Context Builder.
//!
//! Composes the evaluation environment for a node from three layers:
//! built-ins (`errorCount`, `errors`, `activeState`), the node's own
//! attributes, and the state of every context node the node can reach
//! via edge-derived permissions.
//!
//! Permission rules: an edge `C -> N` grants `N` read access to `C`;
//! an edge `N -> C` labeled `writes`/`stores` grants write access; an
//! edge `N -> C` labeled `reads` grants read access.

use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::condition::Env;
use crate::model::{ContextState, MachineJson, Node, NodeType, Path};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContextAccess {
    pub readable: Vec<String>,
    pub writable: Vec<String>,
}

/// Computes the set of context nodes `node_name` may read from and
/// write to, per the permission rules above.
pub fn context_access(machine: &MachineJson, node_name: &str) -> ContextAccess {
    let mut readable = Vec::new();
    let mut writable = Vec::new();

    for edge in machine.incoming(node_name) {
        if let Some(src) = machine.node(&edge.source) {
            if src.node_type() == NodeType::Context && !readable.contains(&src.name) {
                readable.push(src.name.clone());
            }
        }
    }

    for edge in machine.outgoing(node_name) {
        let Some(tgt) = machine.node(&edge.target) else {
            continue;
        };
        if tgt.node_type() != NodeType::Context {
            continue;
        }
        match edge.label.as_deref().map(str::to_lowercase) {
            Some(ref l) if l == "writes" || l == "stores" => {
                if !writable.contains(&tgt.name) {
                    writable.push(tgt.name.clone());
                }
            }
            Some(ref l) if l == "reads" => {
                if !readable.contains(&tgt.name) {
                    readable.push(tgt.name.clone());
                }
            }
            _ => {}
        }
    }

    ContextAccess { readable, writable }
}

pub fn can_read(machine: &MachineJson, node_name: &str, ctx_name: &str) -> bool {
    context_access(machine, node_name)
        .readable
        .iter()
        .any(|c| c == ctx_name)
}

/// Writes are accepted only for context names with a write-granting
/// edge from the current node.
pub fn can_write(machine: &MachineJson, node_name: &str, ctx_name: &str) -> bool {
    context_access(machine, node_name)
        .writable
        .iter()
        .any(|c| c == ctx_name)
}

fn attributes_as_object(node: &Node) -> Map<String, Value> {
    let mut map = Map::new();
    for attr in &node.attributes {
        map.insert(attr.name.clone(), attr.parse());
    }
    map
}

/// Builds the evaluation environment for node `node` given the
/// execution-wide `context_state` and the path it belongs to (used to
/// resolve the `activeState` built-in).
pub fn build_env(
    machine: &MachineJson,
    node: &Node,
    context_state: &ContextState,
    path: &Path,
    error_count: u64,
    errors: &[String],
) -> Env {
    let mut env: Env = HashMap::new();

    env.insert("errorCount".to_string(), Value::from(error_count));
    env.insert(
        "errors".to_string(),
        Value::Array(errors.iter().map(|e| Value::String(e.clone())).collect()),
    );
    let active_state = path
        .state_transitions
        .last()
        .map(|v| v.state.clone())
        .unwrap_or_default();
    env.insert("activeState".to_string(), Value::String(active_state));

    for attr in &node.attributes {
        env.insert(attr.name.clone(), attr.parse());
    }

    let access = context_access(machine, &node.name);
    for ctx_name in &access.readable {
        let Some(ctx_node) = machine.node(ctx_name) else {
            continue;
        };
        let mut merged = attributes_as_object(ctx_node);
        if let Some(overlay) = context_state.get(ctx_name) {
            for (k, v) in overlay {
                merged.insert(k.clone(), v.clone());
            }
        }
        env.insert(ctx_name.clone(), Value::Object(merged));
    }

    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Attribute, Edge, PathStatus};

    fn machine_with_context() -> MachineJson {
        MachineJson {
            title: "t".into(),
            nodes: vec![
                Node {
                    name: "Ctx".into(),
                    r#type: Some(NodeType::Context),
                    parent: None,
                    attributes: vec![Attribute {
                        name: "x".into(),
                        r#type: None,
                        value: "1".into(),
                    }],
                    annotations: vec![],
                },
                Node {
                    name: "decide".into(),
                    r#type: Some(NodeType::Task),
                    parent: None,
                    attributes: vec![],
                    annotations: vec![],
                },
            ],
            edges: vec![Edge {
                source: "Ctx".into(),
                target: "decide".into(),
                r#type: None,
                label: None,
                arrow_type: None,
                annotations: vec![],
            }],
        }
    }

    fn empty_path() -> Path {
        Path {
            id: 0,
            current_node: "decide".into(),
            status: PathStatus::Active,
            history: vec![],
            step_count: 0,
            node_invocation_counts: HashMap::new(),
            state_transitions: vec![],
            start_time: "t".into(),
            map_context: None,
        }
    }

    #[test]
    fn reads_permitted_context() {
        let machine = machine_with_context();
        let access = context_access(&machine, "decide");
        assert_eq!(access.readable, vec!["Ctx".to_string()]);
        assert!(access.writable.is_empty());
    }

    #[test]
    fn env_includes_context_and_builtins() {
        let machine = machine_with_context();
        let node = machine.node("decide").unwrap();
        let env = build_env(&machine, node, &ContextState::new(), &empty_path(), 0, &[]);
        assert_eq!(env["Ctx"]["x"], Value::from(1));
        assert_eq!(env["errorCount"], Value::from(0));
    }

    #[test]
    fn context_state_overlays_initial_attributes() {
        let machine = machine_with_context();
        let node = machine.node("decide").unwrap();
        let mut ctx_state = ContextState::new();
        let mut overlay = HashMap::new();
        overlay.insert("x".to_string(), Value::from(42));
        ctx_state.insert("Ctx".to_string(), overlay);
        let env = build_env(&machine, node, &ctx_state, &empty_path(), 0, &[]);
        assert_eq!(env["Ctx"]["x"], Value::from(42));
    }
}
