//! Per-stage progress over the catalog and the suggested next stage.
use crate::catalog::Catalog;
use crate::history::{RunHistoryEntry, RunOutcome};
use crate::stage::StageRegistry;
use serde::Serialize;
use std::fmt::Write as _;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageStatus {
    pub stage: String,
    pub enabled: bool,
    pub requires: Vec<String>,
    pub completed: usize,
    /// Ready to run: not done, every required stage done.
    pub pending: usize,
    /// Waiting on a required stage.
    pub blocked: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LastRun {
    pub finished_at: String,
    pub outcome: RunOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusSummary {
    pub catalog: String,
    pub entries: usize,
    pub stages: Vec<StageStatus>,
    pub next_stage: Option<String>,
    pub stop_requested: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run: Option<LastRun>,
}

pub fn build_status_summary(
    catalog: &Catalog,
    registry: &StageRegistry,
    stop_requested: bool,
    last_run: Option<&RunHistoryEntry>,
) -> StatusSummary {
    let stages: Vec<StageStatus> = registry
        .stages()
        .iter()
        .map(|stage| {
            let mut status = StageStatus {
                stage: stage.name.clone(),
                enabled: stage.enabled,
                requires: stage.requires.clone(),
                completed: 0,
                pending: 0,
                blocked: 0,
            };
            for (_, entry) in catalog.entries() {
                if entry.has_stage(&stage.name) {
                    status.completed += 1;
                } else if stage.requires.iter().all(|req| entry.has_stage(req)) {
                    status.pending += 1;
                } else {
                    status.blocked += 1;
                }
            }
            status
        })
        .collect();

    let next_stage = stages
        .iter()
        .find(|stage| stage.enabled && stage.pending > 0)
        .or_else(|| {
            // An empty catalog still needs its first discovery pass.
            if catalog.is_empty() {
                stages.iter().find(|stage| stage.enabled)
            } else {
                None
            }
        })
        .map(|stage| stage.stage.clone());

    StatusSummary {
        catalog: catalog.path().display().to_string(),
        entries: catalog.len(),
        stages,
        next_stage,
        stop_requested,
        last_run: last_run.map(|run| LastRun {
            finished_at: run.finished_at.clone(),
            outcome: run.outcome,
            message: run.message.clone(),
        }),
    }
}

pub fn render_status_text(summary: &StatusSummary) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "catalog: {} ({} entries)", summary.catalog, summary.entries);
    let width = summary
        .stages
        .iter()
        .map(|stage| stage.stage.len())
        .max()
        .unwrap_or(5)
        .max(5);
    let _ = writeln!(
        out,
        "{:<width$}  {:>9}  {:>7}  {:>7}",
        "stage", "completed", "pending", "blocked"
    );
    for stage in &summary.stages {
        let note = if stage.enabled { "" } else { "  (disabled)" };
        let _ = writeln!(
            out,
            "{:<width$}  {:>9}  {:>7}  {:>7}{note}",
            stage.stage, stage.completed, stage.pending, stage.blocked
        );
    }
    if let Some(run) = &summary.last_run {
        let outcome = match run.outcome {
            RunOutcome::Completed => "completed",
            RunOutcome::Stopped => "stopped",
            RunOutcome::Failed => "failed",
        };
        let _ = writeln!(out, "last run: {outcome} at {}", run.finished_at);
    }
    if summary.stop_requested {
        let _ = writeln!(out, "stop requested: run `resume` to clear the marker");
    }
    match &summary.next_stage {
        Some(stage) => {
            let _ = writeln!(out, "next: run --stages {stage}");
        }
        None => {
            let _ = writeln!(out, "next: nothing pending");
        }
    }
    out
}
