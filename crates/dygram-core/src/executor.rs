//! Effect Executor and Turn Executor: the async imperative
//! shell around the pure [`crate::runtime`]. `Executor` owns the
//! mutable pieces `ExecutionState` deliberately excludes — the tool
//! registry, per-node circuit breakers, and the `LlmClient` handle —
//! and drives one execution to completion (or to a suspended,
//! resumable `waiting` state) by alternating pure `step` calls with
//! real I/O.

use std::collections::HashMap;

use crate::condition::Env;
use crate::config::EngineConfig;
use crate::context;
use crate::error::{EngineError, Result};
use crate::llm::{LlmClient, ToolUseRequest, TurnRequest};
use crate::meta_tools;
use crate::model::{
    ConversationMessage, ConversationState, Effect, ExecutionState, LogLevel, PathStatus, StepStatus,
    ToolExecutionRecord, TurnState,
};
use crate::retry::{RetryPolicy, RetryState};
use crate::runtime;
use crate::safety::CircuitBreaker;
use crate::tool::{ToolCall, ToolKind, ToolRegistry};

/// One completed agent turn folded back into the execution, or the
/// fact that the path is still mid-conversation and waiting on more
/// tool round-trips.
enum TurnOutcome {
    Applied(ExecutionState),
    StillWaiting(ExecutionState),
}

/// Drives a single [`ExecutionState`] to completion, calling `llm` for
/// every `InvokeLlm` effect and dispatching tool calls through
/// [`runtime::apply_tool_call`] / [`meta_tools::apply_meta_tool_call`].
pub struct Executor<L: LlmClient> {
    llm: L,
    config: EngineConfig,
    registry: ToolRegistry,
    breakers: HashMap<String, CircuitBreaker>,
}

impl<L: LlmClient> Executor<L> {
    pub fn new(llm: L, config: EngineConfig) -> Self {
        Self {
            llm,
            config,
            registry: ToolRegistry::new(),
            breakers: HashMap::new(),
        }
    }

    fn breaker_for(&mut self, node_name: &str) -> &mut CircuitBreaker {
        let cfg = self.config.circuit_breaker.clone();
        self.breakers
            .entry(node_name.to_string())
            .or_insert_with(|| CircuitBreaker::new(cfg.failure_threshold, cfg.cooldown()))
    }

    /// Runs pure supersteps and effect dispatch until the execution
    /// completes or every active/waiting path is blocked on something
    /// this call cannot resolve on its own (used by `--step-turn`
    /// suspension). Resumes a turn already in progress first,
    /// if `state` was loaded mid-conversation from a session store.
    pub async fn run_to_completion(&mut self, mut state: ExecutionState) -> Result<ExecutionState> {
        if let Some(turn_state) = state.turn_state.take() {
            let path_id = turn_state.path_id;
            let node_name = turn_state.node_name.clone();
            state = self.drive_turn(state, path_id, &node_name, turn_state).await?;
        }

        loop {
            match overall_status(&state) {
                StepStatus::Complete => return Ok(state),
                StepStatus::Waiting if any_turn_in_progress(&state) => return Ok(state),
                _ => {}
            }
            let outcome = runtime::step(&state, &self.registry, self.config.model_id.as_deref())?;
            state = self.dispatch_effects(outcome.effects, outcome.next_state).await?;
        }
    }

    /// Advances `state` by exactly one increment and stops: either one
    /// resumed or freshly dispatched agent turn (bounded the same way
    /// `drive_turn` always is), or, when no path needs the agent this
    /// round, one pure superstep. Used by the CLI's `--step`/
    /// `--step-turn` resumable stepping modes.
    pub async fn step_once(&mut self, mut state: ExecutionState) -> Result<ExecutionState> {
        if let Some(turn_state) = state.turn_state.take() {
            let path_id = turn_state.path_id;
            let node_name = turn_state.node_name.clone();
            return self.drive_turn(state, path_id, &node_name, turn_state).await;
        }
        match overall_status(&state) {
            StepStatus::Complete | StepStatus::Waiting => Ok(state),
            _ => {
                let outcome = runtime::step(&state, &self.registry, self.config.model_id.as_deref())?;
                self.dispatch_effects(outcome.effects, outcome.next_state).await
            }
        }
    }

    async fn dispatch_effects(&mut self, effects: Vec<Effect>, mut state: ExecutionState) -> Result<ExecutionState> {
        for effect in effects {
            state = self.dispatch_one(effect, state).await?;
        }
        Ok(state)
    }

    async fn dispatch_one(&mut self, effect: Effect, state: ExecutionState) -> Result<ExecutionState> {
        match effect {
            Effect::Log { level, category, message, data } => {
                log_effect(level, &category, &message, data.as_ref());
                Ok(state)
            }
            Effect::Checkpoint { description } => {
                tracing::debug!(description = ?description, "checkpoint effect (session store persists externally)");
                Ok(state)
            }
            Effect::Complete { .. } => Ok(state),
            Effect::Error { error, path_id, node_name } => {
                tracing::error!(error = %error, path_id = ?path_id, node_name = ?node_name, "execution error");
                Ok(state)
            }
            Effect::CodeTask { path_id, task_node, input, .. } => self.run_code_task(state, path_id, &task_node, input).await,
            Effect::InvokeLlm { path_id, node_name, prompt, tools, model_id } => {
                self.run_turn(state, path_id, &node_name, prompt, tools, model_id).await
            }
        }
    }

    /// A `@codeTask`-style node without a deterministic handler falls
    /// back to an LLM-mediated turn with no tools: a "code task
    /// executor with LLM fallback".
    async fn run_code_task(
        &mut self,
        state: ExecutionState,
        path_id: u64,
        task_node: &str,
        input: serde_json::Value,
    ) -> Result<ExecutionState> {
        let prompt = format!(
            "Execute task '{task_node}' with input: {input}. Respond with the task's textual result."
        );
        self.run_turn(state, path_id, task_node, prompt, Vec::new(), self.config.model_id.clone())
            .await
    }

    /// Starts the tool-calling conversation for a freshly emitted
    /// `InvokeLlm` effect and drives it via [`Self::drive_turn`].
    async fn run_turn(
        &mut self,
        state: ExecutionState,
        path_id: u64,
        node_name: &str,
        system_prompt: String,
        tools: Vec<crate::tool::ToolSpec>,
        model_id: Option<String>,
    ) -> Result<ExecutionState> {
        let turn_state = TurnState {
            path_id,
            node_name: node_name.to_string(),
            conversation_state: ConversationState::new(tools),
            turn_count: 0,
            is_waiting_for_turn: false,
            system_prompt,
            model_id,
        };
        self.drive_turn(state, path_id, node_name, turn_state).await
    }

    /// Runs rounds of the tool-calling conversation for one node until
    /// a transition/spawn/map tool ends the turn, the agent replies
    /// with no tool call (genuinely stalled), or an internal round
    /// budget is hit — in either of the latter two cases `turn_state`
    /// is persisted with `is_waiting_for_turn = true` so a later
    /// `--step-turn` call (or the next `run_to_completion`) resumes it
    /// exactly where it left off.
    async fn drive_turn(
        &mut self,
        mut state: ExecutionState,
        path_id: u64,
        node_name: &str,
        mut turn_state: TurnState,
    ) -> Result<ExecutionState> {
        const MAX_ROUNDS_PER_CALL: u64 = 25;
        let rounds_budget = turn_state.turn_count + MAX_ROUNDS_PER_CALL;

        loop {
            if !self.breaker_for(node_name).allow() {
                return fail_path(
                    state,
                    path_id,
                    format!("circuit breaker open for node '{node_name}'; refusing invocation"),
                );
            }

            let request = TurnRequest {
                system_prompt: turn_state.system_prompt.clone(),
                messages: turn_state.conversation_state.messages.clone(),
                tools: turn_state.conversation_state.tools.clone(),
                model_id: turn_state.model_id.clone(),
            };

            let mut retry_state = RetryState::new();
            let retry_policy: RetryPolicy = state
                .machine_snapshot
                .node(node_name)
                .and_then(|n| crate::annotation::AnnotationProcessor::retry(&n.annotations))
                .map(RetryPolicy::from)
                .unwrap_or_default();
            let response = loop {
                match self.llm.complete(request.clone()).await {
                    Ok(r) => {
                        self.breaker_for(node_name).record_success();
                        break r;
                    }
                    Err(e) if retry_policy.should_retry(retry_state.attempt) => {
                        retry_state.record_attempt(Some(e.to_string()));
                        tokio::time::sleep(retry_policy.calculate_delay(retry_state.attempt - 1)).await;
                    }
                    Err(e) => {
                        self.breaker_for(node_name).record_failure();
                        return fail_path(state, path_id, format!("agent transport exhausted retries: {e}"));
                    }
                }
            };

            turn_state.turn_count += 1;
            if let Some(text) = &response.text {
                turn_state.conversation_state.accumulated_text.push_str(text);
                turn_state.conversation_state.messages.push(ConversationMessage {
                    role: "assistant".to_string(),
                    content: serde_json::json!(text),
                });
            }

            if response.tool_uses.is_empty() {
                turn_state.is_waiting_for_turn = true;
                state.turn_state = Some(turn_state);
                return Ok(state);
            }

            let outcome = self.apply_tool_uses(state, path_id, &mut turn_state, response.tool_uses).await?;
            state = match outcome {
                TurnOutcome::Applied(mut next) => {
                    next.turn_state = None;
                    return Ok(next);
                }
                TurnOutcome::StillWaiting(next) => next,
            };

            if turn_state.turn_count >= rounds_budget {
                turn_state.is_waiting_for_turn = true;
                state.turn_state = Some(turn_state);
                return Ok(state);
            }
        }
    }

    async fn apply_tool_uses(
        &mut self,
        mut state: ExecutionState,
        path_id: u64,
        turn_state: &mut TurnState,
        tool_uses: Vec<ToolUseRequest>,
    ) -> Result<TurnOutcome> {
        for use_req in tool_uses {
            let call = ToolCall {
                id: use_req.id.clone(),
                name: use_req.name.clone(),
                args: use_req.args.clone(),
            };

            let synthesized = turn_state
                .conversation_state
                .tools
                .iter()
                .find(|t| t.name == use_req.name)
                .cloned();

            let Some(spec) = synthesized else {
                turn_state.conversation_state.tool_executions.push(ToolExecutionRecord {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    args: call.args.clone(),
                    output: serde_json::json!({"error": format!("unknown tool '{}'", call.name)}),
                    is_error: true,
                });
                continue;
            };

            let kind = self.registry.get(&spec.name).map(|t| t.kind.clone());
            let resolved_kind = kind.unwrap_or_else(|| infer_kind_from_name(&spec.name));

            let (next_state, result) = if let ToolKind::Meta(meta_kind) = &resolved_kind {
                meta_tools::apply_meta_tool_call(&state, &mut self.registry, meta_kind, &call)?
            } else {
                let synth = crate::tool::SynthesizedTool {
                    spec: spec.clone(),
                    kind: resolved_kind,
                };
                runtime::apply_tool_call(&state, path_id, &synth, &call)?
            };
            state = next_state;

            turn_state.conversation_state.tool_executions.push(ToolExecutionRecord {
                id: result.id.clone(),
                name: result.name.clone(),
                args: call.args.clone(),
                output: serde_json::to_value(&result.output)?,
                is_error: result.output.is_error(),
            });

            // A transition, spawn, or map tool ends the turn: the path
            // moves on and the next superstep picks up at its new node.
            let ends_turn = spec.name.starts_with("transition_to_")
                || spec.name.starts_with("spawn_async_to_")
                || spec.name.starts_with("map_spawn_to_");
            if ends_turn {
                return Ok(TurnOutcome::Applied(state));
            }
        }

        // Every tool used this round was a read/write/meta tool: stay
        // at this node and let the next turn continue the conversation.
        let state = crate::state::set_path_status(&state, path_id, PathStatus::Waiting)?;
        Ok(TurnOutcome::StillWaiting(state))
    }
}

fn infer_kind_from_name(name: &str) -> ToolKind {
    if let Some(target) = name.strip_prefix("transition_to_") {
        return ToolKind::TransitionTo { target: target.to_string() };
    }
    if let Some(target) = name.strip_prefix("spawn_async_to_") {
        return ToolKind::SpawnAsyncTo { target: target.to_string() };
    }
    if let Some(target) = name.strip_prefix("map_spawn_to_") {
        return ToolKind::MapSpawnTo { target: target.to_string() };
    }
    if let Some(ctx) = name.strip_prefix("read_") {
        return ToolKind::ReadContext { ctx: ctx.to_string() };
    }
    if let Some(ctx) = name.strip_prefix("write_") {
        return ToolKind::WriteContext { ctx: ctx.to_string() };
    }
    ToolKind::Dynamic
}

fn fail_path(state: ExecutionState, path_id: u64, reason: String) -> Result<ExecutionState> {
    let mut next = crate::state::set_path_status(&state, path_id, PathStatus::Failed)?;
    next.metadata.error_count += 1;
    next.metadata.errors.push(reason);

    // Same `@errorHandling` policy the pure runtime applies to a
    // limit-exceeded failure (spec §7) also governs a transport
    // failure or an open circuit breaker caught here.
    use crate::annotation::ErrorHandlingMode;
    match crate::safety::error_handling_policy(&next.machine_snapshot) {
        ErrorHandlingMode::Continue => {}
        ErrorHandlingMode::FailFast => {
            next = crate::state::cancel_other_active_paths(&next, path_id);
            tracing::warn!(path_id, "fail-fast: cancelling all other active paths after transport failure");
        }
        ErrorHandlingMode::Compensate => {
            if let Some(path) = next.path(path_id) {
                for transition in path.history.iter().rev() {
                    tracing::info!(
                        path_id,
                        from = %transition.from,
                        to = %transition.to,
                        "compensating transition after transport failure"
                    );
                }
            }
        }
    }
    Ok(next)
}

fn any_turn_in_progress(state: &ExecutionState) -> bool {
    state.turn_state.as_ref().map(|t| t.is_waiting_for_turn).unwrap_or(false)
}

fn overall_status(state: &ExecutionState) -> StepStatus {
    if state.active_paths().next().is_some() {
        return StepStatus::Continue;
    }
    let any_waiting = state.paths.iter().any(|p| p.status == PathStatus::Waiting);
    if any_waiting {
        return StepStatus::Waiting;
    }
    StepStatus::Complete
}

fn log_effect(level: LogLevel, category: &str, message: &str, data: Option<&serde_json::Value>) {
    match level {
        LogLevel::Debug => tracing::debug!(category, data = ?data, "{message}"),
        LogLevel::Info => tracing::info!(category, data = ?data, "{message}"),
        LogLevel::Warn => tracing::warn!(category, data = ?data, "{message}"),
        LogLevel::Error => tracing::error!(category, data = ?data, "{message}"),
    }
}

/// Builds the read-only [`Env`] used by callers outside the runtime
/// (e.g. the CLI's `--describe`) that need to render a node's context
/// without driving a superstep.
pub fn preview_env(state: &ExecutionState, node_name: &str) -> Result<Env> {
    let node = state
        .machine_snapshot
        .node(node_name)
        .ok_or_else(|| EngineError::user_graph(format!("no node named '{node_name}'")))?;
    let path = state
        .paths
        .iter()
        .find(|p| p.current_node == node_name)
        .ok_or_else(|| EngineError::invariant(format!("no path currently at '{node_name}'")))?;
    Ok(context::build_env(
        &state.machine_snapshot,
        node,
        &state.context_state,
        path,
        state.metadata.error_count,
        &state.metadata.errors,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::StubLlmClient;
    use crate::model::{Attribute, MachineJson, Node, NodeType};
    use crate::state::create_initial_state;

    fn branching_machine() -> MachineJson {
        let node = |name: &str, ty: NodeType, prompt: bool| Node {
            name: name.to_string(),
            r#type: Some(ty),
            parent: None,
            attributes: if prompt {
                vec![Attribute { name: "prompt".into(), r#type: None, value: "pick one".into() }]
            } else {
                vec![]
            },
            annotations: vec![],
        };
        let edge = |s: &str, t: &str| crate::model::Edge {
            source: s.to_string(),
            target: t.to_string(),
            r#type: None,
            label: None,
            arrow_type: None,
            annotations: vec![],
        };
        MachineJson {
            title: "branch".into(),
            nodes: vec![
                node("start", NodeType::State, false),
                node("decide", NodeType::Task, true),
                node("done", NodeType::Task, false),
            ],
            edges: vec![edge("start", "decide"), edge("decide", "done")],
        }
    }

    #[tokio::test]
    async fn executor_drives_single_tool_turn_to_completion() {
        let machine = branching_machine();
        let state = create_initial_state(machine, Default::default()).unwrap();
        let mut executor = Executor::new(StubLlmClient, EngineConfig::default());
        let final_state = executor.run_to_completion(state).await.unwrap();
        assert!(final_state.paths.iter().all(|p| p.status == PathStatus::Completed));
    }
}
