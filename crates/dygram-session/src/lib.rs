//! `dygram-session` — the durable per-execution session store:
//! `metadata.json`, `state.json`, `machine.json`, and an
//! append-only `history.jsonl` per `exec-<timestamp>` directory under
//! `.dygram/executions/`, plus a `last` pointer.
//!
//! State is saved the way a checkpoint backend treats a `put`, and turn
//! history is appended the way a transcript writer appends JSONL
//! lines — adapted to a single synchronous filesystem backend, since
//! dygram has exactly one to support.

pub mod error;
pub mod history;
pub mod metadata;
pub mod store;

pub use error::{Result, SessionError};
pub use history::{HistoryWriter, TurnHistoryRecord};
pub use metadata::{ExecutionMode, SessionMetadata, SessionStatus};
pub use store::{SessionStore, StateFileHeader};
