use anyhow::Result;
use clap::Parser;
use stage_catalog::cli::{Command, RootArgs};
use stage_catalog::workflow;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let args = RootArgs::parse();
    init_tracing(args.verbose);

    let config = args.config.as_deref();
    match args.command {
        Command::Init(cmd) => workflow::run_init(config, cmd),
        Command::Run(cmd) => workflow::run_pipeline(config, cmd),
        Command::Status(cmd) => workflow::run_status(config, cmd),
        Command::Show(cmd) => workflow::run_show(config, cmd),
        Command::Snapshot(cmd) => workflow::run_snapshot(config, cmd),
        Command::Snapshots(cmd) => workflow::run_snapshots(config, cmd),
        Command::Restore(cmd) => workflow::run_restore(config, cmd),
        Command::CheckConfig(cmd) => workflow::run_check_config(config, cmd),
        Command::Stop => workflow::run_stop(config),
        Command::Resume => workflow::run_resume(config),
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
