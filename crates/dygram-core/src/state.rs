//! State Builder: pure constructors over [`ExecutionState`].
//!
//! Every function here takes an `&ExecutionState` (or consumes an
//! owned one) and returns a *new* state — inputs are never aliased or
//! mutated in place. This is the only layer allowed to
//! construct or transform `ExecutionState` values; the runtime
//! and effect executor call through it rather than touching
//! fields directly.

use std::collections::HashMap;

use chrono::Utc;

use crate::error::{EngineError, Result};
use crate::model::{
    Barrier, ContextState, ExecutionLimits, ExecutionMetadata, ExecutionState, MachineJson,
    MapContext, NodeType, Path, PathStatus, StateVisit, Transition, CURRENT_SCHEMA_VERSION,
};

fn now() -> String {
    Utc::now().to_rfc3339()
}

/// Finds start nodes in priority order: `@start` annotation, name
/// "start" (case-insensitive), any node with outgoing edges and no
/// incoming (excluding context/style nodes), else the first
/// executable node. Ties are broken in source order.
pub fn find_start_nodes(machine: &MachineJson) -> Vec<String> {
    let explicit: Vec<String> = machine
        .nodes
        .iter()
        .filter(|n| n.has_annotation("start"))
        .map(|n| n.name.clone())
        .collect();
    if !explicit.is_empty() {
        return explicit;
    }

    let by_name: Vec<String> = machine
        .nodes
        .iter()
        .filter(|n| n.name.eq_ignore_ascii_case("start"))
        .map(|n| n.name.clone())
        .collect();
    if !by_name.is_empty() {
        return by_name;
    }

    let executable = |n: &crate::model::Node| {
        !matches!(n.node_type(), NodeType::Context | NodeType::Style)
    };
    let sourceless: Vec<String> = machine
        .nodes
        .iter()
        .filter(|n| executable(n))
        .filter(|n| machine.outgoing(&n.name).next().is_some())
        .filter(|n| machine.incoming(&n.name).next().is_none())
        .map(|n| n.name.clone())
        .collect();
    if !sourceless.is_empty() {
        return sourceless;
    }

    machine
        .nodes
        .iter()
        .find(|n| executable(n))
        .map(|n| vec![n.name.clone()])
        .unwrap_or_default()
}

/// Creates the initial execution state: one active path per start
/// node, an empty context state, no barriers, no turn state.
pub fn create_initial_state(machine: MachineJson, limits: ExecutionLimits) -> Result<ExecutionState> {
    let starts = find_start_nodes(&machine);
    if starts.is_empty() {
        return Err(EngineError::user_graph(
            "no start node could be determined for this machine",
        ));
    }

    let start_time = now();
    let mut paths = Vec::with_capacity(starts.len());
    for (idx, start) in starts.into_iter().enumerate() {
        paths.push(Path {
            id: idx as u64,
            current_node: start,
            status: PathStatus::Active,
            history: Vec::new(),
            step_count: 0,
            node_invocation_counts: HashMap::new(),
            state_transitions: Vec::new(),
            start_time: start_time.clone(),
            map_context: None,
        });
    }

    Ok(ExecutionState {
        version: CURRENT_SCHEMA_VERSION.to_string(),
        machine_snapshot: machine,
        paths,
        limits,
        metadata: ExecutionMetadata::new(start_time),
        context_state: ContextState::new(),
        barriers: HashMap::new(),
        turn_state: None,
    })
}

/// Adds a new active path at `start_node`, returning the new state and
/// the assigned path id.
pub fn create_path(state: &ExecutionState, start_node: &str) -> (ExecutionState, u64) {
    let mut next = state.clone();
    let id = next.next_path_id();
    next.paths.push(Path {
        id,
        current_node: start_node.to_string(),
        status: PathStatus::Active,
        history: Vec::new(),
        step_count: 0,
        node_invocation_counts: HashMap::new(),
        state_transitions: Vec::new(),
        start_time: now(),
        map_context: None,
    });
    (next, id)
}

/// Alias for `create_path`, used by `@async` spawn handling: the
/// originating path stays active at its current node.
pub fn spawn_path(state: &ExecutionState, target: &str) -> (ExecutionState, u64) {
    create_path(state, target)
}

/// Creates one active path per item in `items`, all targeting
/// `target`, tagged with the same `group_id`. An empty `items` is a
/// valid no-op.
pub fn spawn_mapped_paths(
    state: &ExecutionState,
    target: &str,
    source_path_id: u64,
    items: &[serde_json::Value],
    map_source: &str,
    group_id: &str,
) -> (ExecutionState, Vec<u64>) {
    let mut next = state.clone();
    let mut ids = Vec::with_capacity(items.len());
    let mut cursor = next.next_path_id();
    for (index, item) in items.iter().enumerate() {
        let id = cursor;
        cursor += 1;
        next.paths.push(Path {
            id,
            current_node: target.to_string(),
            status: PathStatus::Active,
            history: Vec::new(),
            step_count: 0,
            node_invocation_counts: HashMap::new(),
            state_transitions: Vec::new(),
            start_time: now(),
            map_context: Some(MapContext {
                source_path_id,
                map_source: map_source.to_string(),
                item: item.clone(),
                index,
                group_id: group_id.to_string(),
            }),
        });
        ids.push(id);
    }
    (next, ids)
}

/// Records a transition in `path_id`'s history, advancing its current
/// node, incrementing its step count and `metadata.step_count` so the
/// two stay in lockstep.
pub fn record_transition(
    state: &ExecutionState,
    path_id: u64,
    from: &str,
    to: &str,
    transition_name: &str,
    output: Option<serde_json::Value>,
) -> Result<ExecutionState> {
    let mut next = state.clone();
    let path = next
        .path_mut(path_id)
        .ok_or_else(|| EngineError::invariant(format!("no path with id {path_id}")))?;
    path.history.push(Transition {
        from: from.to_string(),
        to: to.to_string(),
        transition: transition_name.to_string(),
        timestamp: now(),
        output,
    });
    path.current_node = to.to_string();
    path.step_count += 1;
    next.metadata.step_count += 1;
    Ok(next)
}

pub fn increment_node_invocation(
    state: &ExecutionState,
    path_id: u64,
    node_name: &str,
) -> Result<ExecutionState> {
    let mut next = state.clone();
    let path = next
        .path_mut(path_id)
        .ok_or_else(|| EngineError::invariant(format!("no path with id {path_id}")))?;
    *path
        .node_invocation_counts
        .entry(node_name.to_string())
        .or_insert(0) += 1;
    Ok(next)
}

pub fn record_state_transition(
    state: &ExecutionState,
    path_id: u64,
    node_name: &str,
) -> Result<ExecutionState> {
    let mut next = state.clone();
    let path = next
        .path_mut(path_id)
        .ok_or_else(|| EngineError::invariant(format!("no path with id {path_id}")))?;
    path.state_transitions.push(StateVisit {
        state: node_name.to_string(),
        timestamp: now(),
    });
    Ok(next)
}

/// Overlays `field = value` onto `contextState[ctx_name]`. Callers
/// (the effect executor's tool handler) are responsible for the
/// write-permission check; this constructor only performs the
/// pure merge — `ctx_name` must name a context node, enforced by the
/// caller before invoking this.
pub fn update_context_state(
    state: &ExecutionState,
    ctx_name: &str,
    field: &str,
    value: serde_json::Value,
) -> ExecutionState {
    let mut next = state.clone();
    next.context_state
        .entry(ctx_name.to_string())
        .or_default()
        .insert(field.to_string(), value);
    next
}

pub fn set_path_status(state: &ExecutionState, path_id: u64, status: PathStatus) -> Result<ExecutionState> {
    let mut next = state.clone();
    let path = next
        .path_mut(path_id)
        .ok_or_else(|| EngineError::invariant(format!("no path with id {path_id}")))?;
    path.status = status;
    Ok(next)
}

/// Lazily creates the named barrier (snapshotting `required_paths`
/// from currently eligible paths) if it does not already exist.
pub fn ensure_barrier(
    state: &ExecutionState,
    name: &str,
    required_paths: Vec<u64>,
    merge: bool,
) -> ExecutionState {
    let mut next = state.clone();
    next.barriers
        .entry(name.to_string())
        .or_insert_with(|| Barrier::new(required_paths, merge));
    next
}

/// Registers `arriving_path` as having reached barrier `name`. Returns
/// the new state and whether the barrier just released. When it
/// releases with `merge = true`, every other waiting path is marked
/// `completed`.
pub fn wait_at_barrier(
    state: &ExecutionState,
    name: &str,
    arriving_path: u64,
) -> Result<(ExecutionState, bool)> {
    let mut next = state.clone();
    let barrier = next
        .barriers
        .get_mut(name)
        .ok_or_else(|| EngineError::invariant(format!("barrier '{name}' was not ensured before waiting")))?;

    if !barrier.waiting_paths.contains(&arriving_path) {
        barrier.waiting_paths.push(arriving_path);
    }

    let released_now = !barrier.is_released
        && barrier
            .required_paths
            .iter()
            .all(|p| barrier.waiting_paths.contains(p));

    if released_now {
        barrier.is_released = true;
    }

    let merge = barrier.merge;
    let required = barrier.required_paths.clone();

    if released_now && merge {
        for other in required.iter().filter(|p| **p != arriving_path) {
            if let Some(path) = next.path_mut(*other) {
                path.status = PathStatus::Completed;
            }
        }
    }

    Ok((next, released_now))
}

/// Marks every active/waiting path other than `except` as `cancelled`.
/// Used under `@errorHandling(fail-fast)`, §7: one path's failure
/// cancels every other in-flight path rather than letting them
/// continue independently.
pub fn cancel_other_active_paths(state: &ExecutionState, except: u64) -> ExecutionState {
    let mut next = state.clone();
    for path in next.paths.iter_mut() {
        if path.id != except && matches!(path.status, PathStatus::Active | PathStatus::Waiting) {
            path.status = PathStatus::Cancelled;
        }
    }
    next
}

pub fn update_machine_snapshot(state: &ExecutionState, machine: MachineJson) -> ExecutionState {
    let mut next = state.clone();
    next.machine_snapshot = machine;
    next
}

pub fn serialize_state(state: &ExecutionState) -> Result<String> {
    Ok(serde_json::to_string_pretty(state)?)
}

pub fn deserialize_state(json: &str) -> Result<ExecutionState> {
    Ok(serde_json::from_str(json)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Edge, Node};

    fn linear_machine() -> MachineJson {
        let node = |name: &str| Node {
            name: name.to_string(),
            r#type: Some(NodeType::Task),
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
            nodes: vec![node("start"), node("a"), node("b"), node("done")],
            edges: vec![edge("start", "a"), edge("a", "b"), edge("b", "done")],
        }
    }

    #[test]
    fn finds_start_by_name() {
        let machine = linear_machine();
        assert_eq!(find_start_nodes(&machine), vec!["start".to_string()]);
    }

    #[test]
    fn initial_state_has_one_path_per_start() {
        let machine = linear_machine();
        let state = create_initial_state(machine, ExecutionLimits::default()).unwrap();
        assert_eq!(state.paths.len(), 1);
        assert_eq!(state.paths[0].current_node, "start");
    }

    #[test]
    fn record_transition_keeps_invariants() {
        let machine = linear_machine();
        let state = create_initial_state(machine, ExecutionLimits::default()).unwrap();
        let next = record_transition(&state, 0, "start", "a", "start->a", None).unwrap();
        assert_eq!(next.paths[0].current_node, "a");
        assert_eq!(next.metadata.step_count, 1);
        assert!(next.step_count_consistent());
        assert!(next.paths[0].check_consistency());
    }

    #[test]
    fn mapped_spawn_creates_one_path_per_item() {
        let machine = linear_machine();
        let state = create_initial_state(machine, ExecutionLimits::default()).unwrap();
        let items = vec![serde_json::json!("a"), serde_json::json!("b"), serde_json::json!("c")];
        let (next, ids) = spawn_mapped_paths(&state, "worker", 0, &items, "Ctx.items", "g1");
        assert_eq!(ids.len(), 3);
        for (i, id) in ids.iter().enumerate() {
            let p = next.path(*id).unwrap();
            assert_eq!(p.map_context.as_ref().unwrap().index, i);
            assert_eq!(p.map_context.as_ref().unwrap().group_id, "g1");
        }
    }

    #[test]
    fn empty_map_is_noop() {
        let machine = linear_machine();
        let state = create_initial_state(machine, ExecutionLimits::default()).unwrap();
        let (next, ids) = spawn_mapped_paths(&state, "worker", 0, &[], "Ctx.items", "g1");
        assert!(ids.is_empty());
        assert_eq!(next.paths.len(), state.paths.len());
    }

    #[test]
    fn barrier_releases_when_all_waiting() {
        let machine = linear_machine();
        let state = create_initial_state(machine, ExecutionLimits::default()).unwrap();
        let state = ensure_barrier(&state, "j", vec![0, 1], false);
        let (state, released1) = wait_at_barrier(&state, "j", 0).unwrap();
        assert!(!released1);
        let (state, released2) = wait_at_barrier(&state, "j", 1).unwrap();
        assert!(released2);
        assert!(state.barriers["j"].is_released);
        assert!(state.barriers["j"].check_invariant());
    }

    #[test]
    fn merge_barrier_completes_other_waiters() {
        let machine = linear_machine();
        let state = create_initial_state(machine, ExecutionLimits::default()).unwrap();
        let state = ensure_barrier(&state, "j", vec![0, 1], true);
        let (state, _) = wait_at_barrier(&state, "j", 0).unwrap();
        let (state, released) = wait_at_barrier(&state, "j", 1).unwrap();
        assert!(released);
        assert_eq!(state.path(0).unwrap().status, PathStatus::Completed);
    }

    #[test]
    fn state_round_trips_through_json() {
        let machine = linear_machine();
        let state = create_initial_state(machine, ExecutionLimits::default()).unwrap();
        let json = serialize_state(&state).unwrap();
        let restored = deserialize_state(&json).unwrap();
        assert_eq!(restored.paths[0].current_node, state.paths[0].current_node);
    }
}
