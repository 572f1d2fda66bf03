//! Stage runner: applies declared stages to catalog entries, one committed
//! entry at a time.
//!
//! Every successful entry is merged, marked complete and flushed before the
//! next one starts, so an interrupted run loses at most the entry in flight.
//! Re-running the same selection skips completed (entry, stage) pairs and
//! resumes where the previous run stopped.
use crate::cancel::CancellationMonitor;
use crate::catalog::{Catalog, CatalogError, KeyFilter, RESERVED_SECTIONS};
use crate::stage::{
    BodySet, Patch, RegistryError, StageBody, StageContext, StageDescriptor, StageFailure,
    StageRegistry,
};
use crate::util::utc_now_iso_z;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("stage {stage} aborted{}: {message}", key.as_deref().map(|k| format!(" at {k}")).unwrap_or_default())]
    FatalStage {
        stage: String,
        key: Option<String>,
        message: String,
    },
    #[error("progress could not be persisted")]
    Flush(#[source] CatalogError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

/// Knobs for partial, debug, or forced runs.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub filter: KeyFilter,
    /// Re-run entries that already completed the stage.
    pub force: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
    Completed,
    Disabled,
    Stopped,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageSummary {
    pub stage: String,
    pub outcome: StageOutcome,
    pub discovered: usize,
    pub processed: usize,
    pub skipped_done: usize,
    pub skipped_dependency: usize,
    pub failed: usize,
}

impl StageSummary {
    fn new(stage: &str) -> Self {
        Self {
            stage: stage.to_string(),
            outcome: StageOutcome::Completed,
            discovered: 0,
            processed: 0,
            skipped_done: 0,
            skipped_dependency: 0,
            failed: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub stages: Vec<StageSummary>,
    /// True when a cooperative stop ended the run early.
    pub stopped: bool,
}

impl RunReport {
    pub fn processed(&self) -> usize {
        self.stages.iter().map(|s| s.processed).sum()
    }

    pub fn failed(&self) -> usize {
        self.stages.iter().map(|s| s.failed).sum()
    }
}

pub struct StageRunner<'a> {
    catalog: &'a mut Catalog,
    registry: &'a StageRegistry,
    monitor: &'a dyn CancellationMonitor,
    options: RunOptions,
    report: RunReport,
}

impl<'a> StageRunner<'a> {
    pub fn new(
        catalog: &'a mut Catalog,
        registry: &'a StageRegistry,
        monitor: &'a dyn CancellationMonitor,
    ) -> Self {
        Self {
            catalog,
            registry,
            monitor,
            options: RunOptions::default(),
            report: RunReport::default(),
        }
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    /// Summaries gathered so far, including the stage that aborted a failed run.
    pub fn report(&self) -> &RunReport {
        &self.report
    }

    /// Run the selected stages (all declared stages when empty) in
    /// declaration order.
    pub fn run(
        &mut self,
        selection: &[String],
        bodies: &mut BodySet<'_>,
    ) -> Result<RunReport, RunError> {
        let registry = self.registry;
        let stages = registry.select(selection)?;
        for stage in &stages {
            if stage.enabled && !bodies.contains(&stage.name) {
                return Err(RunError::FatalStage {
                    stage: stage.name.clone(),
                    key: None,
                    message: "no stage body is registered".to_string(),
                });
            }
        }

        for stage in stages {
            if self.monitor.should_stop() {
                tracing::info!(stage = %stage.name, "stop requested; not starting stage");
                self.report.stopped = true;
                break;
            }
            let mut summary = StageSummary::new(&stage.name);
            let result = match bodies.get_mut(&stage.name) {
                Some(body) => self.run_stage(stage, body, &mut summary),
                None => Ok(()),
            };
            if !stage.enabled {
                summary.outcome = StageOutcome::Disabled;
            } else if result.is_err() {
                summary.outcome = StageOutcome::Aborted;
            }
            log_summary(&summary);
            let stopped = summary.outcome == StageOutcome::Stopped;
            self.report.stages.push(summary);
            result?;
            if stopped {
                self.report.stopped = true;
                break;
            }
        }
        Ok(self.report.clone())
    }

    fn run_stage(
        &mut self,
        stage: &StageDescriptor,
        body: &mut dyn StageBody,
        summary: &mut StageSummary,
    ) -> Result<(), RunError> {
        if !stage.enabled {
            tracing::info!(stage = %stage.name, "stage disabled; skipping");
            return Ok(());
        }
        tracing::info!(stage = %stage.name, "stage started");

        body.preflight()
            .map_err(|failure| fatal(&stage.name, None, failure))?;
        self.discover(stage, body, summary)?;

        let keys: Vec<String> = self
            .catalog
            .keys(&self.options.filter)
            .map(str::to_string)
            .collect();
        let total = keys.len();
        let limit = self.options.filter.limit;
        for (index, key) in keys.iter().enumerate() {
            if self.monitor.should_stop() {
                tracing::info!(
                    stage = %stage.name,
                    remaining = total - index,
                    "stop requested; progress is committed"
                );
                summary.outcome = StageOutcome::Stopped;
                return Ok(());
            }
            if limit.is_some_and(|limit| summary.processed + summary.failed >= limit) {
                tracing::info!(stage = %stage.name, limit = ?limit, "entry limit reached");
                break;
            }
            if !self.options.force && self.catalog.has_completed_stage(key, &stage.name) {
                summary.skipped_done += 1;
                continue;
            }
            let missing: Vec<&str> = stage
                .requires
                .iter()
                .filter(|req| !self.catalog.has_completed_stage(key, req))
                .map(String::as_str)
                .collect();
            if !missing.is_empty() {
                tracing::debug!(stage = %stage.name, %key, ?missing, "dependency unmet; skipping");
                summary.skipped_dependency += 1;
                continue;
            }
            let Some(entry) = self.catalog.get(key) else {
                continue;
            };
            let ctx = StageContext {
                stage: &stage.name,
                key,
                entry,
            };
            match body.process(&ctx) {
                Ok(patch) => {
                    self.commit(&stage.name, key, &patch)?;
                    summary.processed += 1;
                    tracing::info!(
                        stage = %stage.name,
                        %key,
                        progress = format!("{}/{}", index + 1, total),
                        "entry complete"
                    );
                }
                Err(StageFailure::Recoverable(message)) => {
                    summary.failed += 1;
                    tracing::warn!(stage = %stage.name, %key, %message, "entry failed; will retry next run");
                }
                Err(failure @ StageFailure::Fatal(_)) => {
                    return Err(fatal(&stage.name, Some(key.as_str()), failure));
                }
            }
        }
        Ok(())
    }

    fn discover(
        &mut self,
        stage: &StageDescriptor,
        body: &mut dyn StageBody,
        summary: &mut StageSummary,
    ) -> Result<(), RunError> {
        let found = match body.discover() {
            Ok(found) => found,
            Err(failure @ StageFailure::Fatal(_)) => {
                return Err(fatal(&stage.name, None, failure));
            }
            Err(StageFailure::Recoverable(message)) => {
                tracing::warn!(stage = %stage.name, %message, "discovery failed; using known entries");
                Vec::new()
            }
        };
        for key in found {
            match self.catalog.insert_key(&key) {
                Ok(true) => summary.discovered += 1,
                Ok(false) => {}
                Err(err) => tracing::warn!(stage = %stage.name, %err, "ignoring discovered key"),
            }
        }
        if summary.discovered > 0 {
            tracing::info!(stage = %stage.name, discovered = summary.discovered, "new entries discovered");
            self.catalog.flush().map_err(RunError::Flush)?;
        }
        Ok(())
    }

    fn commit(&mut self, stage: &str, key: &str, patch: &Patch) -> Result<(), RunError> {
        // Reject the whole patch up front so a bad section never leaves a
        // partially merged entry behind.
        for (section, _) in patch.iter() {
            if section.is_empty() || RESERVED_SECTIONS.contains(&section.as_str()) {
                return Err(RunError::FatalStage {
                    stage: stage.to_string(),
                    key: Some(key.to_string()),
                    message: format!("stage patched reserved or empty section {section:?}"),
                });
            }
        }
        for (section, value) in patch.iter() {
            self.catalog.upsert_section(key, section, value)?;
        }
        self.catalog
            .mark_stage_complete(key, stage, &utc_now_iso_z())?;
        self.catalog.flush().map_err(RunError::Flush)
    }
}

fn fatal(stage: &str, key: Option<&str>, failure: StageFailure) -> RunError {
    let message = failure.to_string();
    tracing::error!(stage, ?key, %message, "fatal stage failure");
    RunError::FatalStage {
        stage: stage.to_string(),
        key: key.map(str::to_string),
        message,
    }
}

fn log_summary(summary: &StageSummary) {
    tracing::info!(
        stage = %summary.stage,
        outcome = ?summary.outcome,
        discovered = summary.discovered,
        processed = summary.processed,
        skipped_done = summary.skipped_done,
        skipped_dependency = summary.skipped_dependency,
        failed = summary.failed,
        "stage summary"
    );
}

#[cfg(test)]
#[path = "runner_tests.rs"]
mod tests;
