//! Built-in stage bodies and their construction from config.
mod checksum;
mod command;
mod ingest;

pub use checksum::ChecksumBody;
pub use command::{CommandBody, DEFAULT_FATAL_EXIT_CODE};
pub use ingest::{collect_files_recursive, IngestBody, DEFAULT_EXTENSIONS};

use crate::config::{PipelineConfig, StageKind};
use crate::paths::PipelinePaths;
use crate::stage::BodySet;
use anyhow::{anyhow, Result};
use std::time::Duration;

/// One body per declared stage, keyed by stage name.
pub fn build_bodies(config: &PipelineConfig, paths: &PipelinePaths) -> Result<BodySet<'static>> {
    let mut bodies = BodySet::new();
    for stage in &config.stages {
        match stage.kind {
            StageKind::Ingest => bodies.insert(
                &stage.name,
                IngestBody::new(paths.input_dir().to_path_buf(), &stage.extensions),
            ),
            StageKind::Checksum => bodies.insert(&stage.name, ChecksumBody),
            StageKind::Command => {
                let command = stage.command.as_deref().unwrap_or_default();
                let section = stage.section.clone().unwrap_or_else(|| stage.name.clone());
                let body = CommandBody::new(command, section)
                    .map_err(|err| anyhow!("stage {:?}: {err}", stage.name))?
                    .with_healthcheck(stage.healthcheck_url.clone())
                    .with_timeout(stage.timeout_secs.map(Duration::from_secs))
                    .with_fatal_exit_code(stage.fatal_exit_code.unwrap_or(DEFAULT_FATAL_EXIT_CODE));
                bodies.insert(&stage.name, body);
            }
        }
    }
    Ok(bodies)
}
