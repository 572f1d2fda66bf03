//! Path helpers for the pipeline's on-disk layout.
//!
//! Every component resolves its files through `PipelinePaths` so that the
//! defaults below live in exactly one place.
use crate::cancel::StopMarker;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_CATALOG_REL: &str = "pipeline/metadata/master.json";
pub const DEFAULT_INPUT_REL: &str = "pipeline/albums";
pub const DEFAULT_ARCHIVE_REL: &str = "pipeline/archive";
pub const DEFAULT_HISTORY_REL: &str = "pipeline/metadata/history.jsonl";

/// Resolved pipeline locations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelinePaths {
    lib_root: PathBuf,
    catalog: PathBuf,
    input: PathBuf,
    archive: PathBuf,
    history: PathBuf,
    stop_marker: PathBuf,
}

impl PipelinePaths {
    /// Default layout below `lib_root`.
    pub fn new(lib_root: PathBuf) -> Self {
        Self {
            catalog: lib_root.join(DEFAULT_CATALOG_REL),
            input: lib_root.join(DEFAULT_INPUT_REL),
            archive: lib_root.join(DEFAULT_ARCHIVE_REL),
            history: lib_root.join(DEFAULT_HISTORY_REL),
            stop_marker: StopMarker::default_path(),
            lib_root,
        }
    }

    pub fn with_catalog(mut self, path: PathBuf) -> Self {
        self.catalog = path;
        self
    }

    pub fn with_input(mut self, path: PathBuf) -> Self {
        self.input = path;
        self
    }

    pub fn with_archive(mut self, path: PathBuf) -> Self {
        self.archive = path;
        self
    }

    pub fn with_history(mut self, path: PathBuf) -> Self {
        self.history = path;
        self
    }

    pub fn with_stop_marker(mut self, path: PathBuf) -> Self {
        self.stop_marker = path;
        self
    }

    pub fn lib_root(&self) -> &Path {
        &self.lib_root
    }

    /// Return the master catalog file path.
    pub fn catalog_path(&self) -> &Path {
        &self.catalog
    }

    /// Return the directory the ingest stage scans.
    pub fn input_dir(&self) -> &Path {
        &self.input
    }

    pub fn archive_dir(&self) -> &Path {
        &self.archive
    }

    /// Return the run history JSONL path.
    pub fn history_path(&self) -> &Path {
        &self.history
    }

    pub fn stop_marker_path(&self) -> &Path {
        &self.stop_marker
    }

    /// Create the directories the pipeline writes into.
    ///
    /// Returns the directories that did not exist before.
    pub fn ensure_dirs(&self) -> Result<Vec<PathBuf>> {
        let mut wanted = vec![self.input.clone(), self.archive.clone()];
        for file in [&self.catalog, &self.history] {
            if let Some(parent) = file.parent().filter(|p| !p.as_os_str().is_empty()) {
                wanted.push(parent.to_path_buf());
            }
        }
        wanted.sort();
        wanted.dedup();

        let mut created = Vec::new();
        for dir in wanted {
            if dir.is_dir() {
                continue;
            }
            fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
            tracing::info!(dir = %dir.display(), "created directory");
            created.push(dir);
        }
        Ok(created)
    }
}
