//! Pipeline configuration: stage declarations, paths and archive targets.
//!
//! The file is JSON with `stages` as an ordered array. Path values may use
//! `${VAR}` environment placeholders, a leading `~/`, and `{lib_root}`.
//! Relative paths are taken relative to the library root.
use crate::archive::ArchiveTarget;
use crate::catalog::RESERVED_SECTIONS;
use crate::paths::PipelinePaths;
use crate::stage::{StageDescriptor, StageRegistry};
use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_SCHEMA_VERSION: u32 = 1;
pub const DEFAULT_CONFIG_PATH: &str = "pipeline.json";
pub const CONFIG_PATH_ENV: &str = "STAGE_CATALOG_CONFIG";
pub const LIB_ROOT_ENV: &str = "STAGE_CATALOG_LIB_ROOT";

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    pub schema_version: u32,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub stages: Vec<StageConfig>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PathsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lib_root: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catalog: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_marker: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ArchiveConfig {
    #[serde(default)]
    pub targets: Vec<TargetConfig>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TargetConfig {
    pub name: String,
    pub path: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Ingest,
    Checksum,
    Command,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct StageConfig {
    pub name: String,
    pub kind: StageKind,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requires: Vec<String>,
    /// File extensions picked up by an ingest stage.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extensions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Section a command stage patches when its output has no `sections` map.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healthcheck_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fatal_exit_code: Option<i32>,
}

fn default_enabled() -> bool {
    true
}

impl StageConfig {
    fn new(name: &str, kind: StageKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            enabled: true,
            requires: Vec::new(),
            extensions: Vec::new(),
            command: None,
            section: None,
            healthcheck_url: None,
            timeout_secs: None,
            fatal_exit_code: None,
        }
    }
}

impl PipelineConfig {
    /// Stage declarations in config order.
    pub fn registry(&self) -> Result<StageRegistry> {
        let descriptors = self
            .stages
            .iter()
            .map(|stage| StageDescriptor {
                name: stage.name.clone(),
                enabled: stage.enabled,
                requires: stage.requires.clone(),
            })
            .collect();
        StageRegistry::new(descriptors).context("invalid stage declarations")
    }

    pub fn stage(&self, name: &str) -> Option<&StageConfig> {
        self.stages.iter().find(|stage| stage.name == name)
    }
}

/// Starter config written by `init`.
pub fn default_config() -> PipelineConfig {
    let mut checksum = StageConfig::new("checksum", StageKind::Checksum);
    checksum.requires = vec!["ingest".to_string()];
    PipelineConfig {
        schema_version: CONFIG_SCHEMA_VERSION,
        paths: PathsConfig::default(),
        archive: ArchiveConfig {
            targets: vec![TargetConfig {
                name: "albums".to_string(),
                path: format!("{{lib_root}}/{}", crate::paths::DEFAULT_INPUT_REL),
            }],
        },
        stages: vec![StageConfig::new("ingest", StageKind::Ingest), checksum],
    }
}

pub fn config_stub() -> Result<String> {
    let mut text =
        serde_json::to_string_pretty(&default_config()).context("serialize config stub")?;
    text.push('\n');
    Ok(text)
}

/// Config path from the command line, then the environment, then the default.
pub fn config_path(cli: Option<&Path>) -> PathBuf {
    if let Some(path) = cli {
        return path.to_path_buf();
    }
    match std::env::var_os(CONFIG_PATH_ENV) {
        Some(path) if !path.is_empty() => PathBuf::from(path),
        _ => PathBuf::from(DEFAULT_CONFIG_PATH),
    }
}

pub fn load_config(path: &Path) -> Result<PipelineConfig> {
    let bytes = fs::read(path).with_context(|| format!("read config {}", path.display()))?;
    let config: PipelineConfig = serde_json::from_slice(&bytes)
        .with_context(|| format!("parse pipeline config {}", path.display()))?;
    validate_config(&config)?;
    Ok(config)
}

pub fn validate_config(config: &PipelineConfig) -> Result<()> {
    if config.schema_version != CONFIG_SCHEMA_VERSION {
        bail!(
            "unsupported pipeline config schema_version {}",
            config.schema_version
        );
    }
    config.registry()?;
    for stage in &config.stages {
        validate_stage(stage)?;
    }
    let mut names = BTreeSet::new();
    for target in &config.archive.targets {
        if target.name.trim().is_empty() || target.name.contains(['/', '\\']) {
            bail!("archive target name {:?} is not a plain name", target.name);
        }
        if !names.insert(target.name.as_str()) {
            bail!("archive target {:?} is declared more than once", target.name);
        }
        if target.path.trim().is_empty() {
            bail!("archive target {:?} has an empty path", target.name);
        }
    }
    Ok(())
}

fn validate_stage(stage: &StageConfig) -> Result<()> {
    match stage.kind {
        StageKind::Command => {
            let command = stage
                .command
                .as_deref()
                .ok_or_else(|| anyhow!("command stage {:?} needs a `command`", stage.name))?;
            let argv = shell_words::split(command)
                .with_context(|| format!("parse command for stage {:?}", stage.name))?;
            if argv.is_empty() {
                bail!("command stage {:?} has an empty `command`", stage.name);
            }
            let section = stage
                .section
                .as_deref()
                .ok_or_else(|| anyhow!("command stage {:?} needs a `section`", stage.name))?;
            if section.trim().is_empty() || RESERVED_SECTIONS.contains(&section) {
                bail!(
                    "stage {:?} cannot write to section {section:?}",
                    stage.name
                );
            }
            if stage.timeout_secs == Some(0) {
                bail!("stage {:?} timeout_secs must be positive", stage.name);
            }
        }
        StageKind::Ingest | StageKind::Checksum => {
            if stage.command.is_some() || stage.section.is_some() {
                bail!(
                    "stage {:?} is built in and takes no `command` or `section`",
                    stage.name
                );
            }
        }
    }
    if !stage.extensions.is_empty() && stage.kind != StageKind::Ingest {
        bail!("only ingest stages take `extensions` ({:?})", stage.name);
    }
    Ok(())
}

/// Resolved locations plus archive targets.
#[derive(Debug, Clone)]
pub struct ResolvedPaths {
    pub paths: PipelinePaths,
    pub targets: Vec<ArchiveTarget>,
}

/// Resolve placeholders against the process environment.
pub fn resolve_paths(config: &PipelineConfig) -> Result<ResolvedPaths> {
    let cwd = std::env::current_dir().context("resolve current directory")?;
    resolve_paths_with(config, &cwd, &|name| std::env::var(name).ok())
}

pub fn resolve_paths_with(
    config: &PipelineConfig,
    cwd: &Path,
    env: &dyn Fn(&str) -> Option<String>,
) -> Result<ResolvedPaths> {
    let lib_root = match env(LIB_ROOT_ENV).filter(|value| !value.trim().is_empty()) {
        Some(value) => absolutize(expand(&value, None, env)?, cwd),
        None => match config.paths.lib_root.as_deref() {
            Some(raw) => absolutize(expand(raw, None, env).context("resolve paths.lib_root")?, cwd),
            None => cwd.to_path_buf(),
        },
    };

    let resolve = |raw: &Option<String>, field: &str| -> Result<Option<PathBuf>> {
        raw.as_deref()
            .map(|raw| {
                expand(raw, Some(&lib_root), env)
                    .map(|path| absolutize(path, &lib_root))
                    .with_context(|| format!("resolve paths.{field}"))
            })
            .transpose()
    };

    let mut paths = PipelinePaths::new(lib_root.clone());
    if let Some(path) = resolve(&config.paths.catalog, "catalog")? {
        paths = paths.with_catalog(path);
    }
    if let Some(path) = resolve(&config.paths.input, "input")? {
        paths = paths.with_input(path);
    }
    if let Some(path) = resolve(&config.paths.archive, "archive")? {
        paths = paths.with_archive(path);
    }
    if let Some(path) = resolve(&config.paths.history, "history")? {
        paths = paths.with_history(path);
    }
    if let Some(path) = resolve(&config.paths.stop_marker, "stop_marker")? {
        paths = paths.with_stop_marker(path);
    }

    let targets = config
        .archive
        .targets
        .iter()
        .map(|target| {
            let path = expand(&target.path, Some(&lib_root), env)
                .with_context(|| format!("resolve archive target {:?}", target.name))?;
            Ok(ArchiveTarget {
                name: target.name.clone(),
                path: absolutize(path, &lib_root),
            })
        })
        .collect::<Result<Vec<_>>>()?;
    check_archive_targets(&paths, &targets)?;

    Ok(ResolvedPaths { paths, targets })
}

/// Archive targets are emptied on reset, so none may enclose the catalog or
/// the archive directory.
fn check_archive_targets(paths: &PipelinePaths, targets: &[ArchiveTarget]) -> Result<()> {
    for target in targets {
        for (what, inside) in [
            ("catalog", paths.catalog_path()),
            ("archive directory", paths.archive_dir()),
        ] {
            if inside.starts_with(&target.path) {
                bail!(
                    "archive target {:?} ({}) contains the {what} {}",
                    target.name,
                    target.path.display(),
                    inside.display()
                );
            }
        }
    }
    Ok(())
}

/// Expand `${VAR}`, a leading `~/`, and `{lib_root}` in a path value.
fn expand(
    raw: &str,
    lib_root: Option<&Path>,
    env: &dyn Fn(&str) -> Option<String>,
) -> Result<PathBuf> {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find('}')
            .ok_or_else(|| anyhow!("unterminated placeholder in {raw:?}"))?;
        let name = &after[..end];
        let value = env(name).ok_or_else(|| anyhow!("environment variable {name} is not set"))?;
        out.push_str(&value);
        rest = &after[end + 1..];
    }
    out.push_str(rest);

    if out == "~" || out.starts_with("~/") {
        let home = dirs::home_dir().ok_or_else(|| anyhow!("home directory is unknown"))?;
        out = format!("{}{}", home.display(), &out[1..]);
    }

    if out.contains("{lib_root}") {
        let lib_root = lib_root.ok_or_else(|| anyhow!("{{lib_root}} cannot refer to itself"))?;
        out = out.replace("{lib_root}", &lib_root.display().to_string());
    }
    Ok(PathBuf::from(out))
}

fn absolutize(path: PathBuf, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
