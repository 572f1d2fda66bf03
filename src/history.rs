//! Append-only run history.
//!
//! One JSON line per `run`, so past runs stay auditable without rewriting
//! earlier records.
use crate::runner::StageSummary;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::Path;

pub const HISTORY_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Stopped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunHistoryEntry {
    pub schema_version: u32,
    pub started_at: String,
    pub finished_at: String,
    pub stages: Vec<String>,
    #[serde(default)]
    pub summaries: Vec<SummaryRecord>,
    pub outcome: RunOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Stage summary as stored in history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryRecord {
    pub stage: String,
    pub outcome: String,
    pub discovered: usize,
    pub processed: usize,
    pub skipped_done: usize,
    pub skipped_dependency: usize,
    pub failed: usize,
}

impl From<&StageSummary> for SummaryRecord {
    fn from(summary: &StageSummary) -> Self {
        let outcome = serde_json::to_value(summary.outcome)
            .ok()
            .and_then(|value| value.as_str().map(str::to_string))
            .unwrap_or_default();
        Self {
            stage: summary.stage.clone(),
            outcome,
            discovered: summary.discovered,
            processed: summary.processed,
            skipped_done: summary.skipped_done,
            skipped_dependency: summary.skipped_dependency,
            failed: summary.failed,
        }
    }
}

/// Append a history entry as JSONL.
pub fn append_history(path: &Path, entry: &RunHistoryEntry) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).context("create history dir")?;
    }
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    let mut line = serde_json::to_string(entry).context("serialize run history entry")?;
    line.push('\n');
    file.write_all(line.as_bytes())
        .with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

/// Read every parseable record; malformed lines are skipped with a warning.
pub fn load_history(path: &Path) -> Result<Vec<RunHistoryEntry>> {
    if !path.is_file() {
        return Ok(Vec::new());
    }
    let text = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let mut entries = Vec::new();
    for (index, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(entry) => entries.push(entry),
            Err(err) => {
                tracing::warn!(path = %path.display(), line = index + 1, %err, "skipping history line")
            }
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::StageOutcome;

    fn entry(outcome: RunOutcome) -> RunHistoryEntry {
        let summary = StageSummary {
            stage: "ingest".to_string(),
            outcome: StageOutcome::Stopped,
            discovered: 4,
            processed: 2,
            skipped_done: 0,
            skipped_dependency: 0,
            failed: 0,
        };
        RunHistoryEntry {
            schema_version: HISTORY_SCHEMA_VERSION,
            started_at: "2025-01-01T00:00:00.000000Z".to_string(),
            finished_at: "2025-01-01T00:01:00.000000Z".to_string(),
            stages: vec!["ingest".to_string()],
            summaries: vec![SummaryRecord::from(&summary)],
            outcome,
            snapshot: None,
            message: None,
        }
    }

    #[test]
    fn appends_one_line_per_run() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("meta").join("history.jsonl");
        append_history(&path, &entry(RunOutcome::Stopped)).expect("first");
        append_history(&path, &entry(RunOutcome::Completed)).expect("second");

        let text = fs::read_to_string(&path).expect("read");
        assert_eq!(text.lines().count(), 2);
        let loaded = load_history(&path).expect("load");
        assert_eq!(loaded[0].outcome, RunOutcome::Stopped);
        assert_eq!(loaded[0].summaries[0].outcome, "stopped");
        assert_eq!(loaded[1].outcome, RunOutcome::Completed);
    }

    #[test]
    fn torn_lines_are_skipped() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("history.jsonl");
        append_history(&path, &entry(RunOutcome::Failed)).expect("append");
        fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .and_then(|mut f| f.write_all(b"{\"schema_version\":"))
            .expect("torn write");
        assert_eq!(load_history(&path).expect("load").len(), 1);
    }
}
