//! Effect Builder and tool synthesis.
//!
//! Pure functions that, for a node requiring agent decision, assemble
//! a system prompt and a tool set, and wrap them into an `InvokeLlm`
//! [`Effect`]. Nothing here performs I/O — the effect executor
//! is the only component that actually calls the model or dispatches
//! a tool.

use crate::annotation::AnnotationProcessor;
use crate::condition::Env;
use crate::context::context_access;
use crate::model::{Effect, LogLevel, MachineJson, Node};
use crate::tool::{MetaToolKind, SynthesizedTool, ToolKind, ToolRegistry, ToolSpec};
use crate::transition;

/// Builds the system prompt for a node: its own `prompt`/`desc`
/// attribute (template-resolved against `env`), a description of
/// readable context, and a natural-language list of the transitions
/// available to the agent.
pub fn build_system_prompt(machine: &MachineJson, node: &Node, env: &Env) -> String {
    let mut sections = Vec::new();

    let body = node
        .attribute("prompt")
        .or_else(|| node.attribute("desc"))
        .map(|a| crate::condition::resolve_template(&a.value, env))
        .unwrap_or_else(|| format!("You are at node '{}'. Decide what to do next.", node.name));
    sections.push(body);

    let access = context_access(machine, &node.name);
    if !access.readable.is_empty() {
        sections.push(format!(
            "You can read the following context objects: {}.",
            access.readable.join(", ")
        ));
    }
    if !access.writable.is_empty() {
        sections.push(format!(
            "You can write the following context objects: {}.",
            access.writable.join(", ")
        ));
    }

    let edges = transition::non_automated_edges(machine, &node.name);
    if !edges.is_empty() {
        let options: Vec<String> = edges
            .iter()
            .map(|e| match &e.label {
                Some(l) => format!("transition to '{}' ({})", e.target, l),
                None => format!("transition to '{}'", e.target),
            })
            .collect();
        sections.push(format!("Available transitions: {}.", options.join("; ")));
    }

    sections.join("\n\n")
}

fn meta_tool(kind: MetaToolKind, name: &str, description: &str, schema: serde_json::Value) -> SynthesizedTool {
    SynthesizedTool {
        spec: ToolSpec::new(name, description, schema),
        kind: ToolKind::Meta(kind),
    }
}

/// Synthesizes the full tool set for a node requiring agent decision:
/// transition/spawn/map tools per non-automated edge, read/write tools
/// per permitted context node, meta-tools when `@meta` is present, and
/// any dynamically constructed tools already registered.
pub fn synthesize_tools(
    machine: &MachineJson,
    node: &Node,
    registry: &ToolRegistry,
) -> Vec<SynthesizedTool> {
    let mut tools = Vec::new();

    for edge in transition::non_automated_edges(machine, &node.name) {
        let name = format!("transition_to_{}", edge.target);
        let desc = edge
            .label
            .clone()
            .unwrap_or_else(|| format!("Transition to '{}'", edge.target));
        tools.push(SynthesizedTool {
            spec: ToolSpec::new(name, desc, ToolSpec::empty_object_schema()),
            kind: ToolKind::TransitionTo {
                target: edge.target.clone(),
            },
        });

        if AnnotationProcessor::async_spawn(&edge.annotations).is_some() {
            let name = format!("spawn_async_to_{}", edge.target);
            tools.push(SynthesizedTool {
                spec: ToolSpec::new(
                    name,
                    format!("Spawn a new concurrent path at '{}'", edge.target),
                    ToolSpec::empty_object_schema(),
                ),
                kind: ToolKind::SpawnAsyncTo {
                    target: edge.target.clone(),
                },
            });
        }

        if AnnotationProcessor::map(&edge.annotations).is_some() {
            let name = format!("map_spawn_to_{}", edge.target);
            let schema = serde_json::json!({
                "type": "object",
                "properties": {
                    "source": { "type": "string", "description": "Qualified source override, e.g. Ctx.items" }
                }
            });
            tools.push(SynthesizedTool {
                spec: ToolSpec::new(
                    name,
                    format!("Fan out one path per item onto '{}'", edge.target),
                    schema,
                ),
                kind: ToolKind::MapSpawnTo {
                    target: edge.target.clone(),
                },
            });
        }
    }

    let access = context_access(machine, &node.name);
    for ctx in &access.readable {
        tools.push(SynthesizedTool {
            spec: ToolSpec::new(
                format!("read_{ctx}"),
                format!("Read the current fields of context object '{ctx}'"),
                ToolSpec::empty_object_schema(),
            ),
            kind: ToolKind::ReadContext { ctx: ctx.clone() },
        });
    }
    for ctx in &access.writable {
        let schema = serde_json::json!({
            "type": "object",
            "properties": {
                "field": { "type": "string" },
                "value": {}
            },
            "required": ["field", "value"]
        });
        tools.push(SynthesizedTool {
            spec: ToolSpec::new(
                format!("write_{ctx}"),
                format!("Write a field of context object '{ctx}'"),
                schema,
            ),
            kind: ToolKind::WriteContext { ctx: ctx.clone() },
        });
    }

    if AnnotationProcessor::meta(&node.annotations).is_some() {
        tools.push(meta_tool(
            MetaToolKind::GetMachineDefinition,
            "get_machine_definition",
            "Return the current machine snapshot as JSON",
            ToolSpec::empty_object_schema(),
        ));
        tools.push(meta_tool(
            MetaToolKind::UpdateDefinition,
            "update_definition",
            "Replace the machine snapshot with an updated definition",
            serde_json::json!({"type": "object", "properties": {"machine": {}}, "required": ["machine"]}),
        ));
        tools.push(meta_tool(
            MetaToolKind::ConstructTool,
            "construct_tool",
            "Register a new dynamic tool, available starting next turn",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "name": {"type": "string"},
                    "description": {"type": "string"},
                    "input_schema": {}
                },
                "required": ["name", "description"]
            }),
        ));
        tools.push(meta_tool(
            MetaToolKind::ListAvailableTools,
            "list_available_tools",
            "List every tool currently available to this node",
            ToolSpec::empty_object_schema(),
        ));
        tools.push(meta_tool(
            MetaToolKind::GetToolNodes,
            "get_tool_nodes",
            "List machine nodes marked as dynamic-tool-backing",
            ToolSpec::empty_object_schema(),
        ));
        tools.push(meta_tool(
            MetaToolKind::BuildToolFromNode,
            "build_tool_from_node",
            "Materialize a tool's schema from a machine node's attributes",
            serde_json::json!({"type": "object", "properties": {"node": {"type": "string"}}, "required": ["node"]}),
        ));
        tools.push(meta_tool(
            MetaToolKind::ProposeToolImprovement,
            "propose_tool_improvement",
            "Propose a refinement to an existing dynamic tool's schema",
            serde_json::json!({"type": "object", "properties": {"name": {"type": "string"}, "input_schema": {}}, "required": ["name"]}),
        ));
    }

    for dynamic in registry.all() {
        tools.push(dynamic.clone());
    }

    tools
}

/// Builds the `InvokeLlm` effect for a node requiring agent decision.
pub fn build_invoke_llm_effect(
    machine: &MachineJson,
    node: &Node,
    env: &Env,
    path_id: u64,
    registry: &ToolRegistry,
    model_id: Option<String>,
) -> Effect {
    let prompt = build_system_prompt(machine, node, env);
    let tools = synthesize_tools(machine, node, registry)
        .into_iter()
        .map(|t| t.spec)
        .collect();
    Effect::InvokeLlm {
        path_id,
        node_name: node.name.clone(),
        prompt,
        tools,
        model_id,
    }
}

pub fn log_effect(level: LogLevel, category: &str, message: impl Into<String>) -> Effect {
    Effect::Log {
        level,
        category: category.to_string(),
        message: message.into(),
        data: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Attribute, Edge, NodeType};

    fn task_with_two_edges() -> (MachineJson, Node) {
        let mut task = Node {
            name: "task".into(),
            r#type: Some(NodeType::Task),
            parent: None,
            attributes: vec![Attribute {
                name: "prompt".into(),
                r#type: None,
                value: "Pick a side".into(),
            }],
            annotations: vec![],
        };
        task.attributes.push(Attribute {
            name: "desc".into(),
            r#type: None,
            value: "unused".into(),
        });
        let machine = MachineJson {
            title: "t".into(),
            nodes: vec![
                task.clone(),
                Node {
                    name: "left".into(),
                    r#type: Some(NodeType::Task),
                    parent: None,
                    attributes: vec![],
                    annotations: vec![],
                },
                Node {
                    name: "right".into(),
                    r#type: Some(NodeType::Task),
                    parent: None,
                    attributes: vec![],
                    annotations: vec![],
                },
            ],
            edges: vec![
                Edge {
                    source: "task".into(),
                    target: "left".into(),
                    r#type: None,
                    label: None,
                    arrow_type: None,
                    annotations: vec![],
                },
                Edge {
                    source: "task".into(),
                    target: "right".into(),
                    r#type: None,
                    label: None,
                    arrow_type: None,
                    annotations: vec![],
                },
            ],
        };
        task = machine.node("task").unwrap().clone();
        (machine, task)
    }

    #[test]
    fn synthesizes_one_tool_per_non_automated_edge() {
        let (machine, node) = task_with_two_edges();
        let registry = ToolRegistry::new();
        let tools = synthesize_tools(&machine, &node, &registry);
        let names: Vec<_> = tools.iter().map(|t| t.spec.name.clone()).collect();
        assert!(names.contains(&"transition_to_left".to_string()));
        assert!(names.contains(&"transition_to_right".to_string()));
        assert_eq!(tools.len(), 2);
    }

    #[test]
    fn prompt_prefers_prompt_attribute() {
        let (machine, node) = task_with_two_edges();
        let env = Env::new();
        let prompt = build_system_prompt(&machine, &node, &env);
        assert!(prompt.contains("Pick a side"));
        assert!(prompt.contains("Available transitions"));
    }
}
