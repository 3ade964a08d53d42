//! The filesystem session store: one directory per
//! execution under `.dygram/executions/`, split into a `put`/
//! `get_tuple`/`list`-shaped API — `save` after every turn, `load`/
//! `resume` to reconstruct a runtime, `list`/`remove`/`clean` for
//! housekeeping — but synchronous and local-disk only, since dygram has
//! exactly one backend to support.
//!
//! Each `exec-<ts>` directory holds four files, written atomically
//! (write to `.tmp`, then rename):
//!
//! - `metadata.json` — [`SessionMetadata`], small and frequently saved.
//! - `state.json` — [`StateFileHeader`] wrapping the full
//!   [`ExecutionState`], stamped with a machine hash.
//! - `machine.json` — the latest [`MachineJson`] snapshot, kept
//!   alongside `state.json` for quick inspection without deserializing
//!   the whole execution state.
//! - `history.jsonl` — append-only, via [`crate::history::HistoryWriter`].
//!
//! A `last` symlink next to the run directories always points at the
//! most recently touched execution.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use dygram_core::model::{ExecutionState, MachineJson};

use crate::error::{Result, SessionError};
use crate::metadata::{ExecutionMode, SessionMetadata};

/// `state.json`'s schema: `{version, machineHash,
/// executionState, status, lastUpdated}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateFileHeader {
    pub version: String,
    pub machine_hash: String,
    pub execution_state: ExecutionState,
    pub status: String,
    pub last_updated: String,
}

/// Computes `hex(sha256(canonical-json(machine)))`. Object keys are
/// sorted recursively so the hash is stable regardless of the
/// `HashMap` iteration order any annotation's free-form attributes
/// came from.
pub fn machine_hash(machine: &MachineJson) -> Result<String> {
    let value = serde_json::to_value(machine)?;
    let canonical = canonicalize(&value);
    let bytes = serde_json::to_vec(&canonical)?;
    let digest = Sha256::digest(&bytes);
    Ok(hex_encode(&digest))
}

fn canonicalize(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut sorted: std::collections::BTreeMap<String, serde_json::Value> =
                std::collections::BTreeMap::new();
            for (k, v) in map {
                sorted.insert(k.clone(), canonicalize(v));
            }
            serde_json::to_value(sorted).unwrap_or(serde_json::Value::Null)
        }
        serde_json::Value::Array(items) => serde_json::Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn write_atomic(path: &Path, content: &str) -> Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, content)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

pub struct SessionStore {
    root: PathBuf,
}

impl SessionStore {
    /// The default session root: `.dygram/executions`
    /// relative to the current working directory.
    pub fn default_root() -> PathBuf {
        PathBuf::from(".dygram/executions")
    }

    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn run_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    fn last_link(&self) -> PathBuf {
        self.root.join("last")
    }

    /// Allocates a fresh `exec-YYYYMMDD-HHMMSS` id (suffixing `-2`,
    /// `-3`, ... on same-second collisions) and its directory.
    pub fn create(&self, machine_source: impl Into<String>, mode: ExecutionMode) -> Result<(String, SessionMetadata)> {
        fs::create_dir_all(&self.root)?;
        let stamp = Utc::now().format("%Y%m%d-%H%M%S").to_string();
        let mut id = format!("exec-{stamp}");
        let mut suffix = 2;
        while self.run_dir(&id).exists() {
            id = format!("exec-{stamp}-{suffix}");
            suffix += 1;
        }
        fs::create_dir_all(self.run_dir(&id))?;
        let metadata = SessionMetadata::new(id.clone(), machine_source, mode);
        Ok((id, metadata))
    }

    /// Writes `metadata.json`, `state.json`, and `machine.json`
    /// atomically, updating the `last` symlink to point here.
    pub fn save(&self, id: &str, state: &ExecutionState, metadata: &mut SessionMetadata) -> Result<()> {
        let dir = self.run_dir(id);
        fs::create_dir_all(&dir)?;

        metadata.sync_from_state(state);
        write_atomic(&dir.join("metadata.json"), &serde_json::to_string_pretty(metadata)?)?;
        write_atomic(&dir.join("machine.json"), &serde_json::to_string_pretty(&state.machine_snapshot)?)?;

        let header = StateFileHeader {
            version: state.version.clone(),
            machine_hash: machine_hash(&state.machine_snapshot)?,
            execution_state: state.clone(),
            status: format!("{:?}", metadata.status).to_lowercase(),
            last_updated: Utc::now().to_rfc3339(),
        };
        write_atomic(&dir.join("state.json"), &serde_json::to_string_pretty(&header)?)?;

        self.point_last_at(id)?;
        Ok(())
    }

    fn point_last_at(&self, id: &str) -> Result<()> {
        let link = self.last_link();
        #[cfg(unix)]
        {
            let _ = fs::remove_file(&link);
            std::os::unix::fs::symlink(id, &link)?;
        }
        #[cfg(not(unix))]
        {
            write_atomic(&link, id)?;
        }
        Ok(())
    }

    /// Resolves the `last` pointer to a concrete execution id.
    pub fn resolve_last(&self) -> Result<String> {
        let link = self.last_link();
        #[cfg(unix)]
        {
            let target = fs::read_link(&link).map_err(|_| SessionError::NotFound("last".to_string()))?;
            Ok(target.to_string_lossy().into_owned())
        }
        #[cfg(not(unix))]
        {
            fs::read_to_string(&link).map_err(|_| SessionError::NotFound("last".to_string()))
        }
    }

    pub fn status(&self, id: &str) -> Result<SessionMetadata> {
        let raw = fs::read_to_string(self.run_dir(id).join("metadata.json"))
            .map_err(|_| SessionError::NotFound(id.to_string()))?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Loads the raw state header for `id` without checking the
    /// machine hash — used by `exec status`/introspection tools that
    /// don't need to drive the runtime further.
    pub fn load_state(&self, id: &str) -> Result<StateFileHeader> {
        let raw = fs::read_to_string(self.run_dir(id).join("state.json"))
            .map_err(|_| SessionError::NotFound(id.to_string()))?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Reconstructs a runnable [`ExecutionState`] for `id`, checking
    /// the stored machine hash against `current_machine` (when given)
    /// and refusing to proceed on mismatch unless `force`.
    pub fn resume(&self, id: &str, current_machine: Option<&MachineJson>, force: bool) -> Result<(SessionMetadata, ExecutionState)> {
        let metadata = self.status(id)?;
        let header = self.load_state(id)?;

        if let Some(machine) = current_machine {
            let current_hash = machine_hash(machine)?;
            if current_hash != header.machine_hash && !force {
                return Err(SessionError::HashMismatch { id: id.to_string() });
            }
        }

        Ok((metadata, header.execution_state))
    }

    pub fn list(&self) -> Result<Vec<SessionMetadata>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut sessions = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let name = file_name.to_string_lossy();
            if !name.starts_with("exec-") {
                continue;
            }
            if let Ok(metadata) = self.status(&name) {
                sessions.push(metadata);
            }
        }
        sessions.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(sessions)
    }

    pub fn remove(&self, id: &str) -> Result<()> {
        let dir = self.run_dir(id);
        if !dir.exists() {
            return Err(SessionError::NotFound(id.to_string()));
        }
        fs::remove_dir_all(&dir)?;
        if self.resolve_last().map(|last| last == id).unwrap_or(false) {
            let _ = fs::remove_file(self.last_link());
        }
        Ok(())
    }

    /// Removes every execution (`all = true`), or only those that have
    /// reached a terminal status (`Completed`/`Failed`) otherwise.
    pub fn clean(&self, all: bool) -> Result<usize> {
        let mut removed = 0;
        for session in self.list()? {
            let terminal = matches!(
                session.status,
                crate::metadata::SessionStatus::Completed | crate::metadata::SessionStatus::Failed
            );
            if all || terminal {
                self.remove(&session.id)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}
