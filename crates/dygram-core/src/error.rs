//! Error types for the execution runtime.
//!
//! # Error Hierarchy
//!
//! ```text
//! EngineError
//! ├── UserGraph          - bad machine definition, refused at load
//! ├── LimitExceeded       - steps, per-node invocations, timeout, cycle
//! ├── AgentTransport      - LLM unreachable or malformed response
//! ├── Tool                - a tool handler rejected a call
//! ├── InternalInvariant   - a pure-core invariant broke; fatal
//! └── Serialization       - (de)serializing machine/state JSON
//! ```
//!
//! `UserGraphError`s are surfaced at load time and refuse the run
//! outright. `LimitExceeded` fails only the offending path unless the
//! machine declares `@errorHandling(fail-fast)`. `AgentTransportError`
//! is retryable per the node's `@retry` config. `ToolError` is
//! returned to the agent as a tool-result with `is_error=true` so it
//! can recover. `InternalInvariant` halts every path — it indicates a
//! bug in the pure constructors, not a problem with the input machine.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error, Clone)]
pub enum EngineError {
    /// The machine definition itself is invalid: unresolvable node,
    /// empty required barrier set, invalid annotation form, circular
    /// imports. The run refuses to start.
    #[error("invalid machine definition: {0}")]
    UserGraph(String),

    /// A per-path or global limit was exceeded: max steps,
    /// max node invocations, wall-clock timeout, or a detected cycle.
    #[error("limit exceeded on path {path_id}: {reason}")]
    LimitExceeded { path_id: u64, reason: String },

    /// The language-model transport was unreachable or returned a
    /// malformed response.
    #[error("agent transport error at node '{node}': {error}")]
    AgentTransport { node: String, error: String },

    /// A tool handler rejected a call. Recoverable: surfaced to the
    /// agent as a tool-result with `is_error=true`.
    #[error("tool '{tool}' rejected call: {error}")]
    Tool { tool: String, error: String },

    /// An invariant of the pure core was violated. This is always a bug in a pure
    /// constructor, never something the caller can work around.
    #[error("internal invariant violated: {0}")]
    InternalInvariant(String),

    /// Failure (de)serializing machine or state JSON.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl EngineError {
    pub fn user_graph(msg: impl Into<String>) -> Self {
        EngineError::UserGraph(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        EngineError::InternalInvariant(msg.into())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Serialization(e.to_string())
    }
}
