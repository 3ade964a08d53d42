//! Transition Evaluator: deterministic selection of the
//! next node for a path, or `None` meaning "agent needed, or
//! terminal".
//!
//! Rules, in order:
//!   1. Exactly one outbound edge and the node is a state, init, or
//!      task-without-prompt, and its condition holds -> take it.
//!   2. Else the first outbound edge annotated `@auto` whose
//!      condition holds.
//!   3. Else the first edge whose condition is "simple" (deterministic,
//!      side-effect-free) and holds.
//!   4. Else `None`.
//!
//! When the selected target is a state-with-children ("module"),
//! descend to its first child by priority task > state > any
//! non-context, repeating while the child is itself a module. A node
//! with no outbound edges of its own falls back to its parent
//! module's outbound edges, walked upward until one is found.

use crate::condition::{self, Env};
use crate::model::{Edge, MachineJson, Node, NodeType};

#[derive(Debug, Clone, PartialEq)]
pub struct SelectedTransition {
    pub target: String,
    pub label: String,
}

/// Outbound edges for `node_name`, falling back to an ancestor
/// module's outbound edges when `node_name` itself has none.
fn candidate_edges<'a>(machine: &'a MachineJson, node_name: &str) -> Vec<&'a Edge> {
    let mut cursor = node_name.to_string();
    loop {
        let out: Vec<&Edge> = machine.outgoing(&cursor).collect();
        if !out.is_empty() {
            return out;
        }
        match machine.node(&cursor).and_then(|n| n.parent.clone()) {
            Some(parent) => cursor = parent,
            None => return Vec::new(),
        }
    }
}

fn is_task_without_prompt(node: &Node) -> bool {
    node.node_type() == NodeType::Task && node.attribute("prompt").is_none()
}

fn single_edge_rule_applies(node: &Node) -> bool {
    matches!(node.node_type(), NodeType::State | NodeType::Init) || is_task_without_prompt(node)
}

/// Descends through state-with-children ("module") targets to the
/// first concrete leaf, by priority task > state > any non-context
/// child, repeating while the resolved child is itself a module.
fn descend_into_modules(machine: &MachineJson, start: &str) -> String {
    let mut target = start.to_string();
    loop {
        let children: Vec<&Node> = machine.children_of(&target).collect();
        if children.is_empty() {
            return target;
        }
        let next = children
            .iter()
            .find(|c| c.node_type() == NodeType::Task)
            .or_else(|| children.iter().find(|c| c.node_type() == NodeType::State))
            .or_else(|| children.iter().find(|c| !c.node_type().is_context()));
        match next {
            Some(c) => target = c.name.clone(),
            None => return target,
        }
    }
}

pub(crate) fn resolve(machine: &MachineJson, edge: &Edge) -> SelectedTransition {
    let resolved_target = descend_into_modules(machine, &edge.target);
    let label = edge
        .label
        .clone()
        .unwrap_or_else(|| format!("{}->{}", edge.source, edge.target));
    SelectedTransition {
        target: resolved_target,
        label,
    }
}

/// Selects the raw (pre-descent) automated edge for `node_name`, if
/// any rule applies. Exposed so callers that need the edge's own
/// annotations (`@barrier`, `@async`, `@map`) don't have to re-run the
/// rule search themselves.
pub fn evaluate_edge<'a>(machine: &'a MachineJson, node_name: &str, env: &Env) -> Option<&'a Edge> {
    let node = machine.node(node_name)?;
    let edges = candidate_edges(machine, node_name);
    if edges.is_empty() {
        return None;
    }

    // Rule 1: sole deterministic edge out of a state/init/bare task.
    if edges.len() == 1 && single_edge_rule_applies(node) {
        let edge = edges[0];
        let cond = condition::extract_condition(edge.label.as_deref());
        if condition::eval(cond.as_deref(), env) {
            return Some(edge);
        }
    }

    // Rule 2: first `@auto` edge whose condition holds.
    for edge in &edges {
        if crate::annotation::AnnotationProcessor::is_auto(&edge.annotations) {
            let cond = condition::extract_condition(edge.label.as_deref());
            if condition::eval(cond.as_deref(), env) {
                return Some(edge);
            }
        }
    }

    // Rule 3: first edge whose condition is simple and holds.
    for edge in &edges {
        if let Some(cond) = condition::extract_condition(edge.label.as_deref()) {
            if condition::is_simple_condition(&cond) && condition::eval(Some(&cond), env) {
                return Some(edge);
            }
        }
    }

    None
}

/// Computes the automated transition for `node_name`, if any.
pub fn evaluate(machine: &MachineJson, node_name: &str, env: &Env) -> Option<SelectedTransition> {
    let edge = evaluate_edge(machine, node_name, env)?;
    Some(resolve(machine, edge))
}

/// Non-automated outbound edges: those an agent must choose among
/// (used by the Effect Builder to synthesize transition tools).
pub fn non_automated_edges<'a>(machine: &'a MachineJson, node_name: &str) -> Vec<&'a Edge> {
    candidate_edges(machine, node_name)
        .into_iter()
        .filter(|e| {
            let is_auto = crate::annotation::AnnotationProcessor::is_auto(&e.annotations);
            let simple = condition::extract_condition(e.label.as_deref())
                .map(|c| condition::is_simple_condition(&c))
                .unwrap_or(false);
            !is_auto && !simple
        })
        .collect()
}
