//! Runtime: the pure `step` function that advances every
//! active path by exactly one superstep, plus `apply_tool_call`, which
//! folds an agent's tool invocation back onto a waiting path.
//!
//! Neither function performs I/O. `step` only ever returns `Err` for an
//! [`EngineError::InternalInvariant`] — every other failure (a limit
//! exceeded, a bad machine reference) is caught per-path and surfaced
//! as a failed path plus an `Error` effect, so one runaway path never
//! stops the others.

use crate::annotation::AnnotationProcessor;
use crate::condition;
use crate::context;
use crate::effect;
use crate::error::{EngineError, Result};
use crate::model::{Edge, Effect, ExecutionState, LogLevel, PathStatus, StepOutcome, StepStatus};
use crate::safety;
use crate::state;
use crate::tool::{SynthesizedTool, ToolCall, ToolCallResult, ToolError, ToolKind, ToolOutput, ToolRegistry};
use crate::transition;

/// Advances every currently active path by one superstep, in path-id
/// order. A path that hits a limit this step is marked `failed` and
/// does not block the others; a path with no automated transition and
/// no outbound edges completes; otherwise an `InvokeLlm` effect is
/// emitted and the path is marked `waiting` until the effect executor
/// feeds a tool call back through [`apply_tool_call`].
pub fn step(state_in: &ExecutionState, registry: &ToolRegistry, model_id: Option<&str>) -> Result<StepOutcome> {
    let mut current = state_in.clone();
    let mut effects = Vec::new();
    let path_ids: Vec<u64> = current.active_paths().map(|p| p.id).collect();

    for path_id in path_ids {
        // An earlier path processed in this same superstep (a barrier
        // merge, a `@parallel` fork) may already have moved this one
        // out of `active`.
        match current.path(path_id) {
            Some(p) if p.status == PathStatus::Active => {}
            _ => continue,
        }

        match step_one_path(&current, path_id, registry, model_id) {
            Ok((next, mut path_effects)) => {
                current = next;
                effects.append(&mut path_effects);
            }
            Err(EngineError::LimitExceeded { path_id, reason }) => {
                current = state::set_path_status(&current, path_id, PathStatus::Failed)?;
                current.metadata.error_count += 1;
                current.metadata.errors.push(reason.clone());
                effects.push(effect::log_effect(
                    LogLevel::Error,
                    "limit",
                    format!("path {path_id} failed: {reason}"),
                ));
                effects.push(Effect::Error {
                    error: reason,
                    path_id: Some(path_id),
                    node_name: None,
                });
                current = apply_error_handling_policy(&current, path_id, &mut effects);
            }
            Err(other) => return Err(other),
        }
    }

    let status = overall_status(&current);
    if status == StepStatus::Complete {
        effects.push(Effect::Complete {
            final_state: Box::new(current.clone()),
        });
    }

    Ok(StepOutcome {
        next_state: current,
        effects,
        status,
    })
}

/// Applies the machine's `@errorHandling` policy (spec §7) after
/// `failed_path` has just been marked `Failed`. `continue` (the
/// default) is a no-op — the offending path alone fails. `fail-fast`
/// cancels every other in-flight path. `compensate` walks the failed
/// path's transition history in reverse (LIFO) and emits one `Log`
/// effect per step describing the compensating action, then leaves
/// the other paths running exactly as `continue` does.
fn apply_error_handling_policy(state: &ExecutionState, failed_path: u64, effects: &mut Vec<Effect>) -> ExecutionState {
    use crate::annotation::ErrorHandlingMode;
    match safety::error_handling_policy(&state.machine_snapshot) {
        ErrorHandlingMode::Continue => state.clone(),
        ErrorHandlingMode::FailFast => {
            let next = state::cancel_other_active_paths(state, failed_path);
            effects.push(effect::log_effect(
                LogLevel::Warn,
                "error-handling",
                format!("fail-fast: cancelling all other active paths after path {failed_path} failed"),
            ));
            next
        }
        ErrorHandlingMode::Compensate => {
            if let Some(path) = state.path(failed_path) {
                for transition in path.history.iter().rev() {
                    effects.push(effect::log_effect(
                        LogLevel::Info,
                        "error-handling",
                        format!(
                            "compensating path {failed_path}: undoing '{}' -> '{}' ({})",
                            transition.from, transition.to, transition.transition
                        ),
                    ));
                }
            }
            state.clone()
        }
    }
}

fn overall_status(state: &ExecutionState) -> StepStatus {
    if state.active_paths().next().is_some() {
        return StepStatus::Continue;
    }
    let any_waiting = state.paths.iter().any(|p| p.status == PathStatus::Waiting);
    if any_waiting {
        return StepStatus::Waiting;
    }
    let all_terminal = !state.paths.is_empty()
        && state
            .paths
            .iter()
            .all(|p| matches!(p.status, PathStatus::Completed | PathStatus::Failed | PathStatus::Cancelled));
    if all_terminal {
        return StepStatus::Complete;
    }
    StepStatus::Continue
}

/// Advances one path by a superstep, then prepends a `Checkpoint`
/// effect when the node it just left carries `@checkpoint` (spec
/// §4.1's node-level config) — a thin wrapper around
/// [`step_one_path_inner`] so every branch of the inner function gets
/// the checkpoint without duplicating it at each return point.
fn step_one_path(
    state: &ExecutionState,
    path_id: u64,
    registry: &ToolRegistry,
    model_id: Option<&str>,
) -> Result<(ExecutionState, Vec<Effect>)> {
    let checkpoint = state.path(path_id).and_then(|p| {
        let node = state.machine_snapshot.node(&p.current_node)?;
        AnnotationProcessor::checkpoint(&node.annotations)
    });

    let (next, mut effects) = step_one_path_inner(state, path_id, registry, model_id)?;

    if let Some(cfg) = checkpoint {
        effects.insert(0, Effect::Checkpoint { description: cfg.description });
    }

    Ok((next, effects))
}

fn step_one_path_inner(
    state: &ExecutionState,
    path_id: u64,
    registry: &ToolRegistry,
    model_id: Option<&str>,
) -> Result<(ExecutionState, Vec<Effect>)> {
    safety::check_all_limits(state, path_id)?;

    let path = state
        .path(path_id)
        .ok_or_else(|| EngineError::invariant(format!("no path with id {path_id}")))?;
    let node_name = path.current_node.clone();
    let node = state
        .machine_snapshot
        .node(&node_name)
        .ok_or_else(|| {
            EngineError::user_graph(format!("path {path_id} references unknown node '{node_name}'"))
        })?
        .clone();

    safety::check_invocation_limit(state, path_id, &node_name)?;

    let mut current = state::increment_node_invocation(state, path_id, &node_name)?;
    current = state::record_state_transition(&current, path_id, &node_name)?;

    let path = current
        .path(path_id)
        .ok_or_else(|| EngineError::invariant(format!("no path with id {path_id}")))?;
    let env = context::build_env(
        &current.machine_snapshot,
        &node,
        &current.context_state,
        path,
        current.metadata.error_count,
        &current.metadata.errors,
    );

    if let Some(edge) = transition::evaluate_edge(&current.machine_snapshot, &node_name, &env) {
        return take_automated_transition(&current, path_id, &node_name, edge);
    }

    let non_automated = transition::non_automated_edges(&current.machine_snapshot, &node_name);
    let has_outbound =
        current.machine_snapshot.outgoing(&node_name).next().is_some() || !non_automated.is_empty();

    if !has_outbound {
        let next = state::set_path_status(&current, path_id, PathStatus::Completed)?;
        return Ok((
            next,
            vec![effect::log_effect(
                LogLevel::Info,
                "runtime",
                format!("path {path_id} completed at terminal node '{node_name}'"),
            )],
        ));
    }

    // Spec §4.7(f)/(h): a node with exactly one transition tool and no
    // other tool (no spawn/map sibling on that edge, no readable/
    // writable context, no `@meta`, no dynamic tool) requires no real
    // agent decision — auto-take it deterministically instead of
    // suspending for an LLM round-trip. `synthesize_tools` is the same
    // function that would build the `InvokeLlm` tool list, so this
    // stays in lockstep with whatever the agent would actually be
    // offered.
    let synthesized = effect::synthesize_tools(&current.machine_snapshot, &node, registry);
    if let [only] = synthesized.as_slice() {
        if let ToolKind::TransitionTo { target } = &only.kind {
            if let Some(&edge) = non_automated.iter().find(|e| &e.target == target) {
                let selected = transition::resolve(&current.machine_snapshot, edge);
                return take_plain_edge(&current, path_id, &node_name, edge, &selected);
            }
        }
    }

    let invoke = effect::build_invoke_llm_effect(
        &current.machine_snapshot,
        &node,
        &env,
        path_id,
        registry,
        model_id.map(str::to_string),
    );
    let next = state::set_path_status(&current, path_id, PathStatus::Waiting)?;
    Ok((next, vec![invoke]))
}

/// Collects the path ids a barrier at this arrival should require:
/// paths sharing `group` (a `@map` fan-out join) when one is given,
/// otherwise every path active in `state` at the moment the barrier is
/// first touched (a plain fork/join).
fn barrier_required_paths(state: &ExecutionState, path_id: u64, group: Option<&str>) -> Vec<u64> {
    if let Some(group) = group {
        let grouped: Vec<u64> = state
            .paths
            .iter()
            .filter(|p| p.map_context.as_ref().map(|m| m.group_id.as_str()) == Some(group))
            .map(|p| p.id)
            .collect();
        if !grouped.is_empty() {
            return grouped;
        }
    }
    let mut ids: Vec<u64> = state.active_paths().map(|p| p.id).collect();
    if !ids.contains(&path_id) {
        ids.push(path_id);
    }
    ids
}

fn take_automated_transition(
    state: &ExecutionState,
    path_id: u64,
    from: &str,
    edge: &Edge,
) -> Result<(ExecutionState, Vec<Effect>)> {
    let selected = transition::resolve(&state.machine_snapshot, edge);

    // `@map`/`@foreach`: automated fan-out - one path per item of the
    // named context collection, all targeting the resolved
    // destination; the dispatching path has served its purpose and
    // completes (an empty item list is a valid no-op).
    if let Some(map_cfg) = AnnotationProcessor::map(&edge.annotations) {
        let source = map_cfg.source.unwrap_or_default();
        let items = resolve_map_items(state, path_id, from, &source);
        let group_id = map_group_id(&source, path_id, state.metadata.step_count);
        let (next, ids) = state::spawn_mapped_paths(state, &selected.target, path_id, &items, &source, &group_id);
        let next = state::set_path_status(&next, path_id, PathStatus::Completed)?;
        return Ok((
            next,
            vec![effect::log_effect(
                LogLevel::Info,
                "runtime",
                format!(
                    "path {path_id} fanned out {} path(s) onto '{}' (group '{group_id}') from '{source}'",
                    ids.len(),
                    selected.target
                ),
            )],
        ));
    }

    // `@async`/`@spawn`: the originating path stays put; a new path
    // carries the edge's destination forward on its own.
    if AnnotationProcessor::async_spawn(&edge.annotations).is_some() {
        let (next, new_id) = state::spawn_path(state, &selected.target);
        return Ok((
            next,
            vec![effect::log_effect(
                LogLevel::Info,
                "runtime",
                format!(
                    "path {path_id} spawned async path {new_id} at '{}'; originating path remains at '{from}'",
                    selected.target
                ),
            )],
        ));
    }

    take_plain_edge(state, path_id, from, edge, &selected)
}

/// The non-map, non-async case shared by [`take_automated_transition`]
/// and `step_one_path_inner`'s spec §4.7(f)/(h) auto-take: records the
/// transition, then applies the edge's `@barrier` and `@parallel`
/// annotations (if any) exactly as an automated edge would.
fn take_plain_edge(
    state: &ExecutionState,
    path_id: u64,
    from: &str,
    edge: &Edge,
    selected: &transition::SelectedTransition,
) -> Result<(ExecutionState, Vec<Effect>)> {
    let mut next = state::record_transition(state, path_id, from, &selected.target, &selected.label, None)?;
    let mut effects = vec![effect::log_effect(
        LogLevel::Debug,
        "runtime",
        format!("path {path_id}: {from} -> {} ({})", selected.target, selected.label),
    )];

    if let Some(cfg) = AnnotationProcessor::barrier(&edge.annotations) {
        let name = cfg.name.clone().unwrap_or_else(|| selected.target.clone());
        let required = barrier_required_paths(&next, path_id, cfg.group.as_deref());
        next = state::ensure_barrier(&next, &name, required, cfg.merge);
        let (after_wait, released) = state::wait_at_barrier(&next, &name, path_id)?;
        next = after_wait;
        if released {
            effects.push(effect::log_effect(
                LogLevel::Info,
                "barrier",
                format!("barrier '{name}' released"),
            ));
        } else {
            next = state::set_path_status(&next, path_id, PathStatus::Waiting)?;
        }
    }

    // `@parallel`: fork and end the originating path here (spec Open
    // Question, pinned in DESIGN.md) rather than letting it continue
    // alongside the new branch.
    if AnnotationProcessor::parallel(&edge.annotations).is_some() {
        let (with_fork, new_id) = state::spawn_path(&next, &selected.target);
        next = state::set_path_status(&with_fork, path_id, PathStatus::Completed)?;
        effects.push(effect::log_effect(
            LogLevel::Info,
            "runtime",
            format!("path {path_id} forked into {new_id} at '{}' and completed", selected.target),
        ));
    }

    Ok((next, effects))
}

/// Folds one resolved tool call back onto `path_id`, dispatching on
/// the tool's [`ToolKind`]. Meta-tools and dynamically constructed
/// tools are not handled here — the effect executor routes those to
/// the Meta-Tool Manager instead.
pub fn apply_tool_call(
    state: &ExecutionState,
    path_id: u64,
    tool: &SynthesizedTool,
    call: &ToolCall,
) -> Result<(ExecutionState, ToolCallResult)> {
    let path = state
        .path(path_id)
        .ok_or_else(|| EngineError::invariant(format!("no path with id {path_id}")))?;
    let from = path.current_node.clone();

    match &tool.kind {
        ToolKind::TransitionTo { target } => {
            let next = state::record_transition(state, path_id, &from, target, &call.name, Some(call.args.clone()))?;
            let next = state::set_path_status(&next, path_id, PathStatus::Active)?;
            Ok((next, success(call, serde_json::json!({"moved_to": target}))))
        }
        ToolKind::SpawnAsyncTo { target } => {
            let (next, new_id) = state::spawn_path(state, target);
            let next = state::set_path_status(&next, path_id, PathStatus::Active)?;
            Ok((next, success(call, serde_json::json!({"spawned_path": new_id}))))
        }
        ToolKind::MapSpawnTo { target } => {
            let source = call
                .args
                .get("source")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .unwrap_or_default();
            let items = resolve_map_items(state, path_id, &from, &source);
            let group_id = map_group_id(&source, path_id, state.metadata.step_count);
            let (next, ids) = state::spawn_mapped_paths(state, target, path_id, &items, &source, &group_id);
            let next = state::set_path_status(&next, path_id, PathStatus::Active)?;
            Ok((
                next,
                success(call, serde_json::json!({"spawned_paths": ids, "group_id": group_id})),
            ))
        }
        ToolKind::ReadContext { ctx } => {
            let value = state.context_state.get(ctx).cloned().unwrap_or_default();
            Ok((state.clone(), success(call, serde_json::json!(value))))
        }
        ToolKind::WriteContext { ctx } => {
            if !context::can_write(&state.machine_snapshot, &from, ctx) {
                let err = ToolError::PermissionDenied {
                    node: from.clone(),
                    ctx: ctx.clone(),
                };
                return Ok((
                    state.clone(),
                    ToolCallResult {
                        id: call.id.clone(),
                        name: call.name.clone(),
                        output: ToolOutput::Error { error: err.to_string() },
                    },
                ));
            }
            let field = call.args.get("field").and_then(|v| v.as_str()).unwrap_or_default();
            let value = call.args.get("value").cloned().unwrap_or(serde_json::Value::Null);
            let next = state::update_context_state(state, ctx, field, value);
            Ok((next, success(call, serde_json::json!({"written": true}))))
        }
        ToolKind::Meta(_) | ToolKind::Dynamic => Err(EngineError::invariant(
            "meta and dynamic tools must be dispatched by the meta-tool manager, not the runtime",
        )),
    }
}

/// Resolves a `@map` edge's qualified source (e.g. `Ctx.items`)
/// against the environment built for `path_id` at `node_name`. Used
/// both by the automated fan-out path (no agent involved) and
/// available for the `map_spawn_to_*` tool handler's default when no
/// `source` override is supplied in the tool call.
fn resolve_map_items(
    state: &ExecutionState,
    path_id: u64,
    node_name: &str,
    source: &str,
) -> Vec<serde_json::Value> {
    if source.is_empty() {
        return Vec::new();
    }
    let Some(path) = state.path(path_id) else { return Vec::new() };
    let Some(node) = state.machine_snapshot.node(node_name) else {
        return Vec::new();
    };
    let env = context::build_env(
        &state.machine_snapshot,
        node,
        &state.context_state,
        path,
        state.metadata.error_count,
        &state.metadata.errors,
    );
    lookup_array(source, &env)
}

/// Derives a stable group id for a `@map` fan-out. When the qualified
/// source is known (the usual case), the group id is the source with
/// `.` replaced by `_` — e.g. `Ctx.items` -> `Ctx_items` — so a
/// `@barrier(group: Ctx_items)` on the join edge names the same group
/// a dispatcher targeting `Ctx.items` produces. Falls back to a
/// path/step-keyed id when no source is given.
fn map_group_id(source: &str, path_id: u64, step_count: u64) -> String {
    if source.is_empty() {
        format!("map-{path_id}-{step_count}")
    } else {
        source.replace('.', "_")
    }
}

fn lookup_array(source: &str, env: &condition::Env) -> Vec<serde_json::Value> {
    let mut parts = source.split('.');
    let Some(head) = parts.next() else { return Vec::new() };
    let Some(mut current) = env.get(head).cloned() else {
        return Vec::new();
    };
    for part in parts {
        current = match current.get(part) {
            Some(v) => v.clone(),
            None => return Vec::new(),
        };
    }
    current.as_array().cloned().unwrap_or_default()
}

fn success(call: &ToolCall, content: serde_json::Value) -> ToolCallResult {
    ToolCallResult {
        id: call.id.clone(),
        name: call.name.clone(),
        output: ToolOutput::Success { content },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Attribute, ExecutionLimits, MachineJson, Node, NodeType};

    fn linear_machine() -> MachineJson {
        let node = |name: &str, ty: NodeType| Node {
            name: name.to_string(),
            r#type: Some(ty),
            parent: None,
            attributes: vec![],
            annotations: vec![],
        };
        let edge = |s: &str, t: &str| Edge {
            source: s.to_string(),
            target: t.to_string(),
            r#type: None,
            label: None,
            arrow_type: None,
            annotations: vec![],
        };
        MachineJson {
            title: "linear".into(),
            nodes: vec![
                node("start", NodeType::State),
                node("a", NodeType::State),
                node("done", NodeType::Task),
            ],
            edges: vec![edge("start", "a"), edge("a", "done")],
        }
    }

    #[test]
    fn automated_edges_advance_until_agent_needed() {
        let machine = linear_machine();
        let state = state::create_initial_state(machine, Default::default()).unwrap();
        let registry = ToolRegistry::new();
        let outcome = step(&state, &registry, None).unwrap();
        assert_eq!(outcome.next_state.paths[0].current_node, "done");
        assert_eq!(outcome.status, StepStatus::Complete);
    }

    #[test]
    fn step_emits_invoke_llm_for_task_with_branches() {
        let mut machine = linear_machine();
        let decide = Node {
            name: "decide".into(),
            r#type: Some(NodeType::Task),
            parent: None,
            attributes: vec![Attribute {
                name: "prompt".into(),
                r#type: None,
                value: "pick".into(),
            }],
            annotations: vec![],
        };
        machine.nodes.push(decide);
        machine.nodes.push(Node {
            name: "left".into(),
            r#type: Some(NodeType::Task),
            parent: None,
            attributes: vec![],
            annotations: vec![],
        });
        machine.nodes.push(Node {
            name: "right".into(),
            r#type: Some(NodeType::Task),
            parent: None,
            attributes: vec![],
            annotations: vec![],
        });
        machine.edges = vec![
            Edge { source: "start".into(), target: "decide".into(), r#type: None, label: None, arrow_type: None, annotations: vec![] },
            Edge { source: "decide".into(), target: "left".into(), r#type: None, label: None, arrow_type: None, annotations: vec![] },
            Edge { source: "decide".into(), target: "right".into(), r#type: None, label: None, arrow_type: None, annotations: vec![] },
        ];
        let state = state::create_initial_state(machine, Default::default()).unwrap();
        let registry = ToolRegistry::new();
        let first = step(&state, &registry, None).unwrap();
        let second = step(&first.next_state, &registry, None).unwrap();
        assert!(matches!(second.effects[0], Effect::InvokeLlm { .. }));
        assert_eq!(second.next_state.paths[0].status, PathStatus::Waiting);
    }

    #[test]
    fn checkpoint_annotation_emits_checkpoint_effect() {
        let mut machine = linear_machine();
        machine.nodes[0].annotations.push(crate::model::Annotation {
            name: "checkpoint".into(),
            value: Some("entering start".into()),
            qualified_value: None,
            attributes: None,
        });
        let state = state::create_initial_state(machine, Default::default()).unwrap();
        let registry = ToolRegistry::new();
        let outcome = step(&state, &registry, None).unwrap();
        assert!(outcome.effects.iter().any(
            |e| matches!(e, Effect::Checkpoint { description } if description.as_deref() == Some("entering start"))
        ));
    }

    #[test]
    fn error_handling_fail_fast_cancels_other_active_paths() {
        let node = |name: &str, ty: NodeType, annotations: Vec<crate::model::Annotation>| Node {
            name: name.to_string(),
            r#type: Some(ty),
            parent: None,
            attributes: vec![],
            annotations,
        };
        let edge = |s: &str, t: &str| Edge {
            source: s.to_string(),
            target: t.to_string(),
            r#type: None,
            label: None,
            arrow_type: None,
            annotations: vec![],
        };
        let machine = MachineJson {
            title: "fail-fast".into(),
            nodes: vec![
                node(
                    "start",
                    NodeType::State,
                    vec![crate::model::Annotation {
                        name: "errorHandling".into(),
                        value: Some("fail-fast".into()),
                        qualified_value: None,
                        attributes: None,
                    }],
                ),
                node("b", NodeType::State, vec![]),
            ],
            edges: vec![edge("start", "b")],
        };
        // max_steps = 0: the very first limit check on path 0 fails it
        // immediately, before path 1 (spawned separately, still sitting
        // idle at "b") is ever evaluated this step.
        let state = state::create_initial_state(machine, ExecutionLimits { max_steps: 0, ..Default::default() }).unwrap();
        let (state, _) = state::spawn_path(&state, "b");
        let registry = ToolRegistry::new();

        let outcome = step(&state, &registry, None).unwrap();
        assert_eq!(outcome.next_state.paths[0].status, PathStatus::Failed);
        assert_eq!(outcome.next_state.paths[1].status, PathStatus::Cancelled);
    }

    #[test]
    fn apply_transition_tool_call_moves_path_and_reactivates_it() {
        let machine = linear_machine();
        let state = state::create_initial_state(machine, Default::default()).unwrap();
        let state = state::set_path_status(&state, 0, PathStatus::Waiting).unwrap();
        let tool = SynthesizedTool {
            spec: crate::tool::ToolSpec::new("transition_to_a", "go", crate::tool::ToolSpec::empty_object_schema()),
            kind: ToolKind::TransitionTo { target: "a".into() },
        };
        let call = ToolCall {
            id: "1".into(),
            name: "transition_to_a".into(),
            args: serde_json::json!({}),
        };
        let (next, result) = apply_tool_call(&state, 0, &tool, &call).unwrap();
        assert_eq!(next.paths[0].current_node, "a");
        assert_eq!(next.paths[0].status, PathStatus::Active);
        assert!(!result.output.is_error());
    }
}
