//! `metadata.json`: the small, frequently-written header kept separate
//! from the full execution snapshot so the two can be saved at
//! different cadences — every turn touches `metadata.json`, only a
//! completed superstep touches `state.json`.

use chrono::Utc;
use serde::{Deserialize, Serialize};

fn now() -> String {
    Utc::now().to_rfc3339()
}

/// How an execution was driven, carried through for `exec status` and
/// for choosing a playback vs. live transport on resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Interactive,
    Playback,
    Auto,
}

/// Coarse run status, derived from [`dygram_core::model::StepStatus`]
/// plus the two session-local states (`Created` before the first step,
/// `Failed` when the engine itself errors rather than a path).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Created,
    Running,
    Waiting,
    Completed,
    Failed,
}

/// `metadata.json`'s schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub id: String,
    /// Path the machine was loaded from, or the literal `"stdin"`.
    pub machine_source: String,
    pub started_at: String,
    pub last_executed_at: String,
    pub step_count: u64,
    pub path_count: u64,
    pub error_count: u64,
    pub status: SessionStatus,
    pub mode: ExecutionMode,
    #[serde(default)]
    pub client_config: serde_json::Value,
    /// Round-robin cursor for `--step-path` single-path stepping.
    pub next_path_id: u64,
}

impl SessionMetadata {
    pub fn new(id: impl Into<String>, machine_source: impl Into<String>, mode: ExecutionMode) -> Self {
        let ts = now();
        Self {
            id: id.into(),
            machine_source: machine_source.into(),
            started_at: ts.clone(),
            last_executed_at: ts,
            step_count: 0,
            path_count: 0,
            error_count: 0,
            status: SessionStatus::Created,
            mode,
            client_config: serde_json::json!({}),
            next_path_id: 0,
        }
    }

    /// Refreshes the counts and timestamps after a run, called by the
    /// store right before `state.json` is written.
    pub fn sync_from_state(&mut self, state: &dygram_core::model::ExecutionState) {
        self.last_executed_at = now();
        self.step_count = state.metadata.step_count;
        self.path_count = state.paths.len() as u64;
        self.error_count = state.metadata.error_count;
        self.status = derive_status(state);
        if let Some(min_active) = state
            .paths
            .iter()
            .filter(|p| p.status == dygram_core::model::PathStatus::Active)
            .map(|p| p.id)
            .min()
        {
            self.next_path_id = min_active;
        }
    }
}

fn derive_status(state: &dygram_core::model::ExecutionState) -> SessionStatus {
    use dygram_core::model::PathStatus;
    if state.paths.iter().any(|p| p.status == PathStatus::Active) {
        return SessionStatus::Running;
    }
    if state.paths.iter().any(|p| p.status == PathStatus::Waiting) || state.turn_state.is_some() {
        return SessionStatus::Waiting;
    }
    if state.paths.iter().any(|p| p.status == PathStatus::Failed) {
        return SessionStatus::Failed;
    }
    SessionStatus::Completed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_metadata_starts_created_with_matching_timestamps() {
        let meta = SessionMetadata::new("exec-1", "graph.json", ExecutionMode::Auto);
        assert_eq!(meta.status, SessionStatus::Created);
        assert_eq!(meta.started_at, meta.last_executed_at);
        assert_eq!(meta.step_count, 0);
    }
}
