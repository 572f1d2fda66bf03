//! CLI argument parsing for the pipeline.
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Root CLI entrypoint.
#[derive(Parser, Debug)]
#[command(
    name = "scatalog",
    version,
    about = "Resumable stage pipeline over a photo catalog",
    after_help = "Examples:\n  scatalog init\n  scatalog check-config\n  scatalog run --stages ingest,checksum --yes\n  scatalog run --match '2024/.*\\.heic$' --limit 10 --yes\n  scatalog status --json\n  scatalog stop\n  scatalog snapshot --label before-cleanup\n  scatalog restore",
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct RootArgs {
    /// Pipeline config (default: $STAGE_CATALOG_CONFIG or ./pipeline.json)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Log at debug level (RUST_LOG overrides)
    #[arg(long, short, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    Init(InitArgs),
    Run(RunArgs),
    Status(StatusArgs),
    Show(ShowArgs),
    Snapshot(SnapshotArgs),
    Snapshots(SnapshotsArgs),
    Restore(RestoreArgs),
    CheckConfig(CheckConfigArgs),
    /// Ask a running pipeline to stop after its current entry
    Stop,
    /// Clear the stop marker so runs can proceed
    Resume,
}

#[derive(Args, Debug)]
#[command(about = "Write a starter pipeline config")]
pub struct InitArgs {
    /// Overwrite an existing config
    #[arg(long)]
    pub force: bool,
}

#[derive(Args, Debug, Default)]
#[command(about = "Run stages over the catalog, resuming where the last run stopped")]
pub struct RunArgs {
    /// Stages to run, in any order (default: all declared stages)
    #[arg(long, value_delimiter = ',', value_name = "STAGE")]
    pub stages: Vec<String>,

    /// Skip the confirmation prompt
    #[arg(long, short)]
    pub yes: bool,

    /// Only entries whose key contains this text
    #[arg(long, value_name = "TEXT")]
    pub path_contains: Option<String>,

    /// Only entries whose key matches this regex
    #[arg(long = "match", value_name = "REGEX")]
    pub pattern: Option<String>,

    /// Process at most N entries per stage
    #[arg(long, value_name = "N")]
    pub limit: Option<usize>,

    /// Snapshot, then empty the archive targets before any stage runs
    #[arg(long)]
    pub archive_reset: bool,

    /// Also delete the catalog during --archive-reset
    #[arg(long, requires = "archive_reset")]
    pub reset_catalog: bool,

    /// Re-run entries that already completed a stage
    #[arg(long)]
    pub force: bool,

    /// Print the run report as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
#[command(about = "Summarize per-stage progress and the next stage to run")]
pub struct StatusArgs {
    /// Emit machine-readable JSON output
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
#[command(about = "Print one catalog entry")]
pub struct ShowArgs {
    /// Entry key (absolute file path)
    pub key: String,
}

#[derive(Args, Debug)]
#[command(about = "Archive the catalog and targets without resetting anything")]
pub struct SnapshotArgs {
    #[arg(long, default_value = "manual")]
    pub label: String,
}

#[derive(Args, Debug)]
#[command(about = "List snapshots, newest first")]
pub struct SnapshotsArgs {
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
#[command(about = "Restore the catalog from a snapshot (default: the newest)")]
pub struct RestoreArgs {
    #[arg(long, value_name = "PATH")]
    pub snapshot: Option<PathBuf>,
}

#[derive(Args, Debug)]
#[command(about = "Validate the config, resolve paths and create missing directories")]
pub struct CheckConfigArgs {
    /// Also check that these stages exist
    #[arg(long, value_delimiter = ',', value_name = "STAGE")]
    pub stages: Vec<String>,
}
