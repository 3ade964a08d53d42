//! Core data model: the machine definition, execution state, and the
//! effect/result vocabulary that flows between the runtime and its
//! imperative shell.
//!
//! Every type here is plain, `serde`-derived, and deeply cloneable —
//! no live references, no handles. A value of [`ExecutionState`] is a
//! complete, self-contained snapshot: it can be serialized, sent across
//! a process boundary, or diffed byte-for-byte against another
//! snapshot produced from the same input.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Schema version stamped on every [`ExecutionState`]. Bump when the
/// shape of a persisted field changes in a way that is not backward
/// compatible; the session store logs (never fails) on mismatch.
pub const CURRENT_SCHEMA_VERSION: &str = "2.0.0";

// ---------------------------------------------------------------------
// Machine definition (input, immutable within a snapshot)
// ---------------------------------------------------------------------

/// The node type vocabulary understood by the transition evaluator and
/// effect builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Task,
    State,
    Init,
    Context,
    Style,
}

impl NodeType {
    pub fn is_context(self) -> bool {
        matches!(self, NodeType::Context)
    }

    pub fn is_style(self) -> bool {
        matches!(self, NodeType::Style)
    }
}

/// Raw attribute value as carried by the surface DSL: `{name, type?,
/// value}`. `value` is kept as-read text; [`Attribute::parse`] coerces
/// it on demand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r#type: Option<String>,
    pub value: String,
}

impl Attribute {
    /// Parse `value` on demand: number, boolean, object/array (via
    /// JSON), falling back to the raw string.
    pub fn parse(&self) -> Value {
        if let Ok(n) = self.value.parse::<i64>() {
            return Value::from(n);
        }
        if let Ok(n) = self.value.parse::<f64>() {
            return Value::from(n);
        }
        match self.value.as_str() {
            "true" => return Value::Bool(true),
            "false" => return Value::Bool(false),
            _ => {}
        }
        if let Ok(v) = serde_json::from_str::<Value>(&self.value) {
            if v.is_object() || v.is_array() {
                return v;
            }
        }
        Value::String(self.value.clone())
    }
}

/// `{name, value?, qualifiedValue?, attributes?}` — the three
/// annotation syntaxes the Annotation Processor recognizes are encoded
/// here before typed configs are derived (see [`crate::annotation`]).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qualified_value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<HashMap<String, String>>,
}

/// A node in the machine graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    #[serde(default)]
    pub r#type: Option<NodeType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default)]
    pub attributes: Vec<Attribute>,
    #[serde(default)]
    pub annotations: Vec<Annotation>,
}

impl Node {
    pub fn node_type(&self) -> NodeType {
        self.r#type.unwrap_or(NodeType::Task)
    }

    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.name == name)
    }

    pub fn annotation(&self, name: &str) -> Option<&Annotation> {
        self.annotations.iter().find(|a| a.name == name)
    }

    pub fn has_annotation(&self, name: &str) -> bool {
        self.annotation(name).is_some()
    }
}

/// An edge in the machine graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r#type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arrow_type: Option<String>,
    #[serde(default)]
    pub annotations: Vec<Annotation>,
}

impl Edge {
    pub fn annotation(&self, name: &str) -> Option<&Annotation> {
        self.annotations.iter().find(|a| a.name == name)
    }

    pub fn has_annotation(&self, name: &str) -> bool {
        self.annotation(name).is_some()
    }
}

/// The full machine definition: `{title, nodes[], edges[]}`. This is
/// the one piece of "input JSON" in the whole system; everywhere else
/// it appears it is a cloned snapshot, never a shared reference.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MachineJson {
    pub title: String,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
}

impl MachineJson {
    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn outgoing(&self, name: &str) -> impl Iterator<Item = &Edge> {
        self.edges.iter().filter(move |e| e.source == name)
    }

    pub fn incoming(&self, name: &str) -> impl Iterator<Item = &Edge> {
        self.edges.iter().filter(move |e| e.target == name)
    }

    pub fn children_of(&self, name: &str) -> impl Iterator<Item = &Node> {
        self.nodes
            .iter()
            .filter(move |n| n.parent.as_deref() == Some(name))
    }
}

// ---------------------------------------------------------------------
// Path / Transition / Barrier / MapContext
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathStatus {
    Active,
    Waiting,
    Completed,
    Failed,
    Cancelled,
}

/// A history record of one transition taken by a path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transition {
    pub from: String,
    pub to: String,
    pub transition: String,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
}

/// A per-fanned-out-path record of where it came from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapContext {
    pub source_path_id: u64,
    pub map_source: String,
    pub item: Value,
    pub index: usize,
    pub group_id: String,
}

/// One independent flow through the graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Path {
    pub id: u64,
    pub current_node: String,
    pub status: PathStatus,
    pub history: Vec<Transition>,
    pub step_count: u64,
    pub node_invocation_counts: HashMap<String, u64>,
    pub state_transitions: Vec<StateVisit>,
    pub start_time: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub map_context: Option<MapContext>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateVisit {
    pub state: String,
    pub timestamp: String,
}

impl Path {
    /// `currentNode == last(history).to` whenever history is
    /// non-empty.
    pub fn check_consistency(&self) -> bool {
        match self.history.last() {
            Some(t) => t.to == self.current_node,
            None => true,
        }
    }
}

/// Named rendezvous: required paths wait until all have arrived,
/// optionally merging them into one survivor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Barrier {
    pub required_paths: Vec<u64>,
    pub waiting_paths: Vec<u64>,
    pub is_released: bool,
    pub merge: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_groups: Option<Vec<u64>>,
}

impl Barrier {
    pub fn new(required_paths: Vec<u64>, merge: bool) -> Self {
        Self {
            required_paths,
            waiting_paths: Vec::new(),
            is_released: false,
            merge,
            required_groups: None,
        }
    }

    /// `waitingPaths ⊆ requiredPaths`, and once released, `waitingPaths
    /// == requiredPaths`.
    pub fn check_invariant(&self) -> bool {
        let subset = self
            .waiting_paths
            .iter()
            .all(|p| self.required_paths.contains(p));
        if !subset {
            return false;
        }
        if self.is_released {
            let mut req = self.required_paths.clone();
            let mut wait = self.waiting_paths.clone();
            req.sort_unstable();
            wait.sort_unstable();
            req == wait
        } else {
            true
        }
    }
}

// ---------------------------------------------------------------------
// Limits / metadata
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLimits {
    pub max_steps: u64,
    pub max_node_invocations: u64,
    pub timeout_secs: u64,
    pub cycle_detection_window: usize,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            max_steps: 10_000,
            max_node_invocations: 1_000,
            timeout_secs: 600,
            cycle_detection_window: 12,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionMetadata {
    pub step_count: u64,
    pub start_time: String,
    pub elapsed_time_secs: f64,
    pub error_count: u64,
    /// Messages of errors observed so far, newest last. Bounded
    /// informally by `errorCount`.
    pub errors: Vec<String>,
}

impl ExecutionMetadata {
    pub fn new(start_time: String) -> Self {
        Self {
            step_count: 0,
            start_time,
            elapsed_time_secs: 0.0,
            error_count: 0,
            errors: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------
// Turn state (agent conversation in progress)
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: String,
    pub content: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolExecutionRecord {
    pub id: String,
    pub name: String,
    pub args: Value,
    pub output: Value,
    pub is_error: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationState {
    pub messages: Vec<ConversationMessage>,
    pub tools: Vec<crate::tool::ToolSpec>,
    pub tool_executions: Vec<ToolExecutionRecord>,
    pub accumulated_text: String,
}

impl ConversationState {
    pub fn new(tools: Vec<crate::tool::ToolSpec>) -> Self {
        Self {
            messages: Vec::new(),
            tools,
            tool_executions: Vec::new(),
            accumulated_text: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnState {
    pub path_id: u64,
    pub node_name: String,
    pub conversation_state: ConversationState,
    pub turn_count: u64,
    pub is_waiting_for_turn: bool,
    pub system_prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
}

// ---------------------------------------------------------------------
// ExecutionState
// ---------------------------------------------------------------------

/// `contextState[ctxName][field] = value`.
pub type ContextState = HashMap<String, HashMap<String, Value>>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionState {
    pub version: String,
    pub machine_snapshot: MachineJson,
    pub paths: Vec<Path>,
    pub limits: ExecutionLimits,
    pub metadata: ExecutionMetadata,
    pub context_state: ContextState,
    pub barriers: HashMap<String, Barrier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_state: Option<TurnState>,
}

impl ExecutionState {
    /// `metadata.stepCount == Σ path.stepCount`.
    pub fn step_count_consistent(&self) -> bool {
        self.metadata.step_count == self.paths.iter().map(|p| p.step_count).sum::<u64>()
    }

    pub fn path(&self, id: u64) -> Option<&Path> {
        self.paths.iter().find(|p| p.id == id)
    }

    pub fn path_mut(&mut self, id: u64) -> Option<&mut Path> {
        self.paths.iter_mut().find(|p| p.id == id)
    }

    pub fn next_path_id(&self) -> u64 {
        self.paths.iter().map(|p| p.id).max().map_or(0, |m| m + 1)
    }

    pub fn active_paths(&self) -> impl Iterator<Item = &Path> {
        self.paths.iter().filter(|p| p.status == PathStatus::Active)
    }
}

// ---------------------------------------------------------------------
// Effects
// ---------------------------------------------------------------------

/// A description of an imperative action the effect executor must
/// perform. The pure runtime never performs I/O itself — it only
/// emits these.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Effect {
    InvokeLlm {
        path_id: u64,
        node_name: String,
        prompt: String,
        tools: Vec<crate::tool::ToolSpec>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model_id: Option<String>,
    },
    CodeTask {
        path_id: u64,
        task_node: String,
        input: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dygram_file_path: Option<String>,
    },
    Log {
        level: LogLevel,
        category: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
    Checkpoint {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    Complete {
        final_state: Box<ExecutionState>,
    },
    Error {
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path_id: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        node_name: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// The result of an agent turn, applied back onto a waiting path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResult {
    pub path_id: u64,
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_node: Option<String>,
    #[serde(default)]
    pub tool_executions: Vec<ToolExecutionRecord>,
}

/// Overall status reported by one `step` invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Continue,
    Waiting,
    Complete,
    Error,
}

#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub next_state: ExecutionState,
    pub effects: Vec<Effect>,
    pub status: StepStatus,
}
