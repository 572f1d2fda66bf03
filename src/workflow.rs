//! Command handlers: load config, wire the components, report to the operator.
//!
//! Logs go to stderr through `tracing`; command results go to stdout.
use crate::archive::{ArchiveManager, ArchiveTarget, ResetScope};
use crate::bodies::build_bodies;
use crate::cancel::{CancellationMonitor, StopMarker};
use crate::catalog::{Catalog, KeyFilter};
use crate::cli::{
    CheckConfigArgs, InitArgs, RestoreArgs, RunArgs, ShowArgs, SnapshotArgs, SnapshotsArgs,
    StatusArgs,
};
use crate::config::{self, PipelineConfig, StageKind};
use crate::history::{append_history, load_history, RunHistoryEntry, RunOutcome, SummaryRecord};
use crate::paths::PipelinePaths;
use crate::runner::{RunOptions, RunReport, StageRunner};
use crate::status::{build_status_summary, render_status_text};
use crate::util::{display_path, utc_now_iso_z};
use anyhow::{anyhow, bail, Context, Result};
use regex::Regex;
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

const RUN_SNAPSHOT_LABEL: &str = "pre_run";

/// A validated config with its resolved locations.
struct Workspace {
    config_path: PathBuf,
    config: PipelineConfig,
    paths: PipelinePaths,
    targets: Vec<ArchiveTarget>,
}

impl Workspace {
    fn load(config_path: Option<&Path>) -> Result<Self> {
        let config_path = config::config_path(config_path);
        let config = config::load_config(&config_path)?;
        let resolved = config::resolve_paths(&config)?;
        tracing::debug!(
            config = %config_path.display(),
            lib_root = %resolved.paths.lib_root().display(),
            "config loaded"
        );
        Ok(Self {
            config_path,
            config,
            paths: resolved.paths,
            targets: resolved.targets,
        })
    }

    fn archive(&self) -> ArchiveManager {
        ArchiveManager::new(
            self.paths.archive_dir().to_path_buf(),
            self.paths.catalog_path().to_path_buf(),
            self.targets.clone(),
        )
    }

    fn stop_marker(&self) -> StopMarker {
        StopMarker::new(self.paths.stop_marker_path())
    }

    fn load_catalog(&self) -> Result<Catalog> {
        Catalog::load(self.paths.catalog_path())
            .context("load catalog (recover with `scatalog restore`)")
    }
}

pub fn run_init(config_path: Option<&Path>, args: InitArgs) -> Result<()> {
    let path = config::config_path(config_path);
    if path.is_file() && !args.force {
        bail!(
            "config already exists at {} (use --force to overwrite)",
            path.display()
        );
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    fs::write(&path, config::config_stub()?)
        .with_context(|| format!("write {}", path.display()))?;
    println!("wrote {}", path.display());
    Ok(())
}

pub fn run_pipeline(config_path: Option<&Path>, args: RunArgs) -> Result<()> {
    let ws = Workspace::load(config_path)?;
    let registry = ws.config.registry()?;
    let selected: Vec<String> = registry
        .select(&args.stages)?
        .iter()
        .map(|stage| stage.name.clone())
        .collect();
    let filter = key_filter(&args)?;

    eprintln!("config:  {}", ws.config_path.display());
    eprintln!("catalog: {}", ws.paths.catalog_path().display());
    eprintln!("stages:  {}", selected.join(", "));
    if args.archive_reset {
        let scope = if args.reset_catalog {
            "targets and catalog"
        } else {
            "targets"
        };
        eprintln!("archive: snapshot into {}, then reset {scope}", ws.paths.archive_dir().display());
    }
    if !args.yes {
        let stdin = io::stdin();
        let proceed = confirm(
            "Proceed with pipeline run? [y/N] ",
            &mut stdin.lock(),
            &mut io::stderr(),
        )?;
        if !proceed {
            eprintln!("aborted; nothing was changed");
            return Ok(());
        }
    }

    let monitor = ws.stop_marker();
    if monitor.should_stop() {
        tracing::warn!(
            marker = %monitor.path().display(),
            "stop marker present; run `scatalog resume` to clear it"
        );
    }

    let started_at = utc_now_iso_z();
    let mut state = RunState::default();
    let result = execute(&ws, &args, filter, &monitor, &mut state);

    let (outcome, message) = match &result {
        Ok(()) if state.report.stopped => (RunOutcome::Stopped, None),
        Ok(()) => (RunOutcome::Completed, None),
        Err(err) => (RunOutcome::Failed, Some(format!("{err:#}"))),
    };
    let entry = RunHistoryEntry {
        schema_version: crate::history::HISTORY_SCHEMA_VERSION,
        started_at,
        finished_at: utc_now_iso_z(),
        stages: selected,
        summaries: state.report.stages.iter().map(SummaryRecord::from).collect(),
        outcome,
        snapshot: state.snapshot.clone(),
        message,
    };
    if let Err(err) = append_history(ws.paths.history_path(), &entry) {
        tracing::warn!(err = %format!("{err:#}"), "could not append run history");
    }

    print_report(&state.report, args.json)?;
    if state.report.stopped {
        eprintln!("stopped cleanly; run again to resume");
    }
    result
}

#[derive(Default)]
struct RunState {
    report: RunReport,
    snapshot: Option<String>,
}

fn execute(
    ws: &Workspace,
    args: &RunArgs,
    filter: KeyFilter,
    monitor: &StopMarker,
    state: &mut RunState,
) -> Result<()> {
    ws.paths.ensure_dirs()?;
    if args.archive_reset {
        let scope = ResetScope {
            targets: true,
            catalog: args.reset_catalog,
        };
        let snapshot = ws
            .archive()
            .snapshot_and_reset(RUN_SNAPSHOT_LABEL, scope)
            .context("archive and reset")?;
        state.snapshot = Some(snapshot.path.display().to_string());
    }

    let mut catalog = ws.load_catalog()?;
    let registry = ws.config.registry()?;
    let mut bodies = build_bodies(&ws.config, &ws.paths)?;
    let mut runner = StageRunner::new(&mut catalog, &registry, monitor).with_options(RunOptions {
        filter,
        force: args.force,
    });
    let result = runner.run(&args.stages, &mut bodies);
    state.report = runner.report().clone();
    result.context("pipeline run failed")?;
    Ok(())
}

fn key_filter(args: &RunArgs) -> Result<KeyFilter> {
    let pattern = args
        .pattern
        .as_deref()
        .map(Regex::new)
        .transpose()
        .context("parse --match regex")?;
    Ok(KeyFilter {
        contains: args.path_contains.clone(),
        pattern,
        limit: args.limit,
    })
}

/// Ask a yes/no question; anything but `y`/`yes` (including EOF) is no.
fn confirm(prompt: &str, input: &mut dyn BufRead, output: &mut dyn Write) -> Result<bool> {
    output.write_all(prompt.as_bytes()).context("write prompt")?;
    output.flush().context("flush prompt")?;
    let mut line = String::new();
    input.read_line(&mut line).context("read confirmation")?;
    let answer = line.trim().to_ascii_lowercase();
    Ok(answer == "y" || answer == "yes")
}

fn print_report(report: &RunReport, json: bool) -> Result<()> {
    if json {
        let text = serde_json::to_string_pretty(report).context("serialize run report")?;
        println!("{text}");
        return Ok(());
    }
    for summary in &report.stages {
        let outcome = serde_json::to_value(summary.outcome)
            .ok()
            .and_then(|value| value.as_str().map(str::to_string))
            .unwrap_or_default();
        println!(
            "{}: {outcome} (discovered {}, processed {}, already done {}, blocked {}, failed {})",
            summary.stage,
            summary.discovered,
            summary.processed,
            summary.skipped_done,
            summary.skipped_dependency,
            summary.failed
        );
    }
    Ok(())
}

pub fn run_status(config_path: Option<&Path>, args: StatusArgs) -> Result<()> {
    let ws = Workspace::load(config_path)?;
    let catalog = ws.load_catalog()?;
    let registry = ws.config.registry()?;
    let history = load_history(ws.paths.history_path())?;
    let summary = build_status_summary(
        &catalog,
        &registry,
        ws.stop_marker().should_stop(),
        history.last(),
    );
    if args.json {
        let text = serde_json::to_string_pretty(&summary).context("serialize status")?;
        println!("{text}");
    } else {
        print!("{}", render_status_text(&summary));
    }
    Ok(())
}

pub fn run_show(config_path: Option<&Path>, args: ShowArgs) -> Result<()> {
    let ws = Workspace::load(config_path)?;
    let catalog = ws.load_catalog()?;
    let entry = catalog
        .get(&args.key)
        .ok_or_else(|| anyhow!("no catalog entry for {:?}", args.key))?;
    let text = serde_json::to_string_pretty(entry).context("serialize entry")?;
    println!("{text}");
    Ok(())
}

pub fn run_snapshot(config_path: Option<&Path>, args: SnapshotArgs) -> Result<()> {
    let ws = Workspace::load(config_path)?;
    let snapshot = ws.archive().snapshot(&args.label)?;
    println!("{}", snapshot.path.display());
    for member in &snapshot.members {
        eprintln!("  {member}");
    }
    Ok(())
}

pub fn run_snapshots(config_path: Option<&Path>, args: SnapshotsArgs) -> Result<()> {
    let ws = Workspace::load(config_path)?;
    let snapshots = ws.archive().list()?;
    if args.json {
        let text = serde_json::to_string_pretty(&snapshots).context("serialize snapshots")?;
        println!("{text}");
        return Ok(());
    }
    if snapshots.is_empty() {
        eprintln!("no snapshots in {}", ws.paths.archive_dir().display());
    }
    for snapshot in &snapshots {
        println!(
            "{}  {}  {} bytes",
            snapshot.stamp,
            display_path(&snapshot.path, Some(ws.paths.archive_dir())),
            snapshot.size_bytes
        );
    }
    Ok(())
}

pub fn run_restore(config_path: Option<&Path>, args: RestoreArgs) -> Result<()> {
    let ws = Workspace::load(config_path)?;
    let archive = ws.archive();
    let snapshot = match args.snapshot {
        Some(path) => path,
        None => {
            archive
                .latest()?
                .ok_or_else(|| {
                    anyhow!("no snapshots in {}", ws.paths.archive_dir().display())
                })?
                .path
        }
    };
    let outcome = archive.restore_catalog(&snapshot)?;
    if let Some(preserved) = &outcome.preserved {
        eprintln!("previous catalog kept at {}", preserved.display());
    }
    println!(
        "restored {} from {}",
        outcome.catalog.display(),
        snapshot.display()
    );
    Ok(())
}

pub fn run_check_config(config_path: Option<&Path>, args: CheckConfigArgs) -> Result<()> {
    let ws = Workspace::load(config_path)?;
    let registry = ws.config.registry()?;
    let selected = registry.select(&args.stages)?;
    let created = ws.paths.ensure_dirs()?;

    println!("config:      {}", ws.config_path.display());
    println!("lib_root:    {}", ws.paths.lib_root().display());
    println!("catalog:     {}", ws.paths.catalog_path().display());
    println!("input:       {}", ws.paths.input_dir().display());
    println!("archive:     {}", ws.paths.archive_dir().display());
    println!("history:     {}", ws.paths.history_path().display());
    println!("stop marker: {}", ws.paths.stop_marker_path().display());
    for target in &ws.targets {
        println!("target:      {} -> {}", target.name, target.path.display());
    }
    for dir in &created {
        println!("created:     {}", dir.display());
    }
    for stage in selected {
        let Some(stage_config) = ws.config.stage(&stage.name) else {
            continue;
        };
        let state = if stage.enabled { "enabled" } else { "disabled" };
        println!("stage:       {} ({state})", stage.name);
        if stage_config.kind == StageKind::Command && stage.enabled {
            let program = stage_config
                .command
                .as_deref()
                .and_then(|command| shell_words::split(command).ok())
                .and_then(|argv| argv.into_iter().next())
                .unwrap_or_default();
            if which::which(&program).is_err() {
                tracing::warn!(stage = %stage.name, %program, "command not found on PATH");
            }
        }
    }
    Ok(())
}

pub fn run_stop(config_path: Option<&Path>) -> Result<()> {
    let ws = Workspace::load(config_path)?;
    let marker = ws.paths.stop_marker_path();
    if let Some(parent) = marker.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    fs::write(marker, format!("{}\n", utc_now_iso_z()))
        .with_context(|| format!("write {}", marker.display()))?;
    println!("stop requested: {}", marker.display());
    Ok(())
}

pub fn run_resume(config_path: Option<&Path>) -> Result<()> {
    let ws = Workspace::load(config_path)?;
    let marker = ws.paths.stop_marker_path();
    match fs::remove_file(marker) {
        Ok(()) => println!("stop marker cleared: {}", marker.display()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            println!("no stop marker at {}", marker.display())
        }
        Err(err) => {
            return Err(err).with_context(|| format!("remove {}", marker.display()));
        }
    }
    Ok(())
}
