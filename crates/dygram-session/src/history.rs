//! Append-only `history.jsonl` turn records.
//!
//! One line per turn. Writers never rewrite or truncate the file;
//! readers tolerate and skip malformed trailing lines (e.g. from a
//! process killed mid-write).

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// One turn of the agent conversation, as recorded to `history.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnHistoryRecord {
    pub turn: u64,
    pub timestamp: String,
    pub node: String,
    pub tools: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    pub status: String,
}

impl TurnHistoryRecord {
    pub fn new(turn: u64, node: impl Into<String>, tools: Vec<String>, status: impl Into<String>) -> Self {
        Self {
            turn,
            timestamp: Utc::now().to_rfc3339(),
            node: node.into(),
            tools,
            output: None,
            status: status.into(),
        }
    }

    pub fn with_output(mut self, output: serde_json::Value) -> Self {
        self.output = Some(output);
        self
    }
}

pub struct HistoryWriter {
    path: PathBuf,
}

impl HistoryWriter {
    pub fn new(run_dir: &Path) -> Self {
        Self { path: run_dir.join("history.jsonl") }
    }

    pub fn append(&self, record: &TurnHistoryRecord) -> Result<()> {
        let line = serde_json::to_string(record)?;
        let mut file = std::fs::OpenOptions::new().create(true).append(true).open(&self.path)?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    pub fn append_all(&self, records: &[TurnHistoryRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut buf = String::new();
        for record in records {
            buf.push_str(&serde_json::to_string(record)?);
            buf.push('\n');
        }
        let mut file = std::fs::OpenOptions::new().create(true).append(true).open(&self.path)?;
        file.write_all(buf.as_bytes())?;
        Ok(())
    }

    pub fn read_all(&self) -> Result<Vec<TurnHistoryRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(&self.path)?;
        let mut records = Vec::new();
        for line in raw.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<TurnHistoryRecord>(line) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!(error = %e, "skipping malformed history.jsonl line"),
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_then_read_all_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let writer = HistoryWriter::new(dir.path());
        writer
            .append(&TurnHistoryRecord::new(0, "start", vec!["transition_to_next".into()], "ok"))
            .unwrap();
        writer
            .append(&TurnHistoryRecord::new(1, "next", vec![], "ok").with_output(serde_json::json!("done")))
            .unwrap();

        let records = writer.read_all().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].output, Some(serde_json::json!("done")));
    }

    #[test]
    fn read_all_skips_malformed_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.jsonl");
        std::fs::write(&path, "not json\n{\"turn\":0,\"timestamp\":\"t\",\"node\":\"n\",\"tools\":[],\"status\":\"ok\"}\n").unwrap();
        let writer = HistoryWriter::new(dir.path());
        let records = writer.read_all().unwrap();
        assert_eq!(records.len(), 1);
    }
}
