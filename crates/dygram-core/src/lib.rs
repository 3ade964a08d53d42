//! `dygram-core` — a functional execution runtime for graph-driven,
//! agent-augmented workflows.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Pure core (no I/O)                      │
//! │                                                                   │
//! │  annotation  ─┐                                                  │
//! │  condition   ─┼─► context ─► effect ─┐                           │
//! │  model       ─┘                      │                           │
//! │                                       ▼                          │
//! │  transition ────────────────────► runtime::step                  │
//! │                                       │                           │
//! │                    state (constructors)                          │
//! └───────────────────────────────────────┼───────────────────────────┘
//!                                          ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Imperative shell (async, I/O)                 │
//! │                                                                   │
//! │  executor::Executor ──► llm::LlmClient ──► meta_tools             │
//! │        │                                                          │
//! │        └──► safety::CircuitBreaker (wall-clock, not persisted)    │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! [`runtime::step`] advances every active [`model::Path`] in an
//! [`model::ExecutionState`] by exactly one superstep and returns a new
//! state plus a list of [`model::Effect`]s — it never calls the model,
//! writes to disk, or sleeps. [`executor::Executor`] is the only piece
//! that does: it alternates `step` calls with real `LlmClient`
//! round-trips, retries, and circuit breaking, and is the boundary a
//! session store (`dygram-session`) or CLI (`dygram-cli`) drives.
//!
//! # Quick start
//!
//! ```no_run
//! use dygram_core::config::EngineConfig;
//! use dygram_core::executor::Executor;
//! use dygram_core::llm::StubLlmClient;
//! use dygram_core::model::{ExecutionLimits, MachineJson};
//! use dygram_core::state::create_initial_state;
//!
//! # async fn run(machine: MachineJson) -> dygram_core::error::Result<()> {
//! let state = create_initial_state(machine, ExecutionLimits::default())?;
//! let mut executor = Executor::new(StubLlmClient, EngineConfig::default());
//! let final_state = executor.run_to_completion(state).await?;
//! println!("execution finished after {} steps", final_state.metadata.step_count);
//! # Ok(())
//! # }
//! ```
//!
//! # Module organization
//!
//! - [`model`] — the data model: machine definition, execution state,
//!   effects. Every type is plain and `serde`-derived.
//! - [`error`] — [`error::EngineError`], the one error type the pure
//!   core and its shell share.
//! - [`config`] — ambient [`config::EngineConfig`]: limits, retry,
//!   circuit-breaker, and model/session settings, layered from env.
//! - [`annotation`] — the Annotation Processor: `@name(...)` parsing.
//! - [`condition`] — the Condition Evaluator: guard expressions and
//!   `{{...}}` templates.
//! - [`context`] — the Context Builder: read/write permission rules and
//!   per-node evaluation environments.
//! - [`state`] — the State Builder: every pure constructor over
//!   [`model::ExecutionState`].
//! - [`transition`] — the Transition Evaluator: automated-edge rules
//!   and module descent.
//! - [`tool`] — the tool vocabulary shared with the LLM transport.
//! - [`effect`] — the Effect Builder: system-prompt and tool synthesis.
//! - [`retry`] — exponential backoff for `AgentTransportError`.
//! - [`safety`] — the Safety Manager: limits, cycle detection, circuit
//!   breaker.
//! - [`runtime`] — `step`, the pure superstep function, and
//!   `apply_tool_call`, structural-tool dispatch.
//! - [`meta_tools`] — the Meta-Tool Manager: the seven `@meta` tools.
//! - [`llm`] — the [`llm::LlmClient`] trait boundary and
//!   [`llm::StubLlmClient`] reference implementation.
//! - [`executor`] — the Effect Executor / Turn Executor: the async
//!   imperative shell tying everything above together.

pub mod annotation;
pub mod condition;
pub mod config;
pub mod context;
pub mod effect;
pub mod error;
pub mod executor;
pub mod llm;
pub mod meta_tools;
pub mod model;
pub mod retry;
pub mod runtime;
pub mod safety;
pub mod state;
pub mod tool;
pub mod transition;

pub use error::{EngineError, Result};
pub use model::{ExecutionState, MachineJson, StepOutcome, StepStatus};
