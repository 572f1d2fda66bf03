//! Durable key -> entry catalog with merge-on-write sections.
//!
//! The whole catalog lives in memory for the duration of a run and is written
//! back with a temp-file + rename so readers only ever see a complete file.
use crate::document;
use crate::util::{file_stamp, utc_now_iso_z};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Section names owned by the catalog itself.
pub const RESERVED_SECTIONS: &[&str] = &["pipeline", "created_at"];

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog {} is corrupt ({}): {source}", path.display(), preserved_note(preserved.as_deref()))]
    Corrupt {
        path: PathBuf,
        /// Where the unparsable file was moved; `None` when the move failed.
        preserved: Option<PathBuf>,
        #[source]
        source: serde_json::Error,
    },
    #[error("read catalog {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("flush catalog {}: {source}", path.display())]
    Flush {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("serialize catalog: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("section {0:?} is reserved for pipeline bookkeeping")]
    ReservedSection(String),
    #[error("catalog keys and section names must be non-empty")]
    EmptyName,
}

pub type CatalogResult<T> = Result<T, CatalogError>;

/// Per-entry stage bookkeeping stored under the `pipeline` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineState {
    /// Stage names in completion order, without duplicates.
    #[serde(default, alias = "stages")]
    pub stages_completed: Vec<String>,
    #[serde(default)]
    pub timestamps: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One resource's accumulated record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub pipeline: PipelineState,
    /// Stage-owned sections, including ones this crate knows nothing about.
    #[serde(flatten)]
    pub sections: BTreeMap<String, Value>,
}

impl Entry {
    fn new(now: String) -> Self {
        Self {
            created_at: now.clone(),
            pipeline: PipelineState {
                last_updated: Some(now),
                ..PipelineState::default()
            },
            sections: BTreeMap::new(),
        }
    }

    pub fn section(&self, name: &str) -> Option<&Value> {
        self.sections.get(name)
    }

    pub fn has_stage(&self, stage: &str) -> bool {
        self.pipeline.stages_completed.iter().any(|s| s == stage)
    }

    /// Full record as a JSON value, the shape stage bodies receive.
    pub fn to_value(&self) -> serde_json::Result<Value> {
        serde_json::to_value(self)
    }
}

/// Key selection for partial or debug runs.
#[derive(Debug, Clone, Default)]
pub struct KeyFilter {
    pub contains: Option<String>,
    pub pattern: Option<Regex>,
    /// Most entries a stage attempts per run; done entries do not count.
    pub limit: Option<usize>,
}

impl KeyFilter {
    pub fn matches(&self, key: &str) -> bool {
        if let Some(needle) = self.contains.as_deref() {
            if !key.contains(needle) {
                return false;
            }
        }
        if let Some(pattern) = self.pattern.as_ref() {
            if !pattern.is_match(key) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug)]
pub struct Catalog {
    path: PathBuf,
    entries: BTreeMap<String, Entry>,
}

impl Catalog {
    /// Load the catalog at `path`, starting empty when the file is absent.
    ///
    /// Unparsable content is renamed aside before the error is returned so a
    /// later flush can never overwrite it.
    pub fn load(path: impl Into<PathBuf>) -> CatalogResult<Self> {
        let path = path.into();
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok(Self {
                    path,
                    entries: BTreeMap::new(),
                });
            }
            Err(source) => return Err(CatalogError::Read { path, source }),
        };
        match serde_json::from_slice::<BTreeMap<String, Entry>>(&bytes) {
            Ok(entries) => {
                tracing::debug!(path = %path.display(), entries = entries.len(), "catalog loaded");
                Ok(Self { path, entries })
            }
            Err(source) => {
                let preserved = preserve_corrupt(&path);
                Err(CatalogError::Corrupt {
                    path,
                    preserved,
                    source,
                })
            }
        }
    }

    /// Empty in-memory catalog bound to `path`; nothing is written until flush.
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entries: BTreeMap::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Entry> {
        self.entries.get(key)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&String, &Entry)> + '_ {
        self.entries.iter()
    }

    /// Ensure an entry exists for `key`; returns true when it was created.
    pub fn insert_key(&mut self, key: &str) -> CatalogResult<bool> {
        if key.is_empty() {
            return Err(CatalogError::EmptyName);
        }
        if self.entries.contains_key(key) {
            return Ok(false);
        }
        self.entries
            .insert(key.to_string(), Entry::new(utc_now_iso_z()));
        Ok(true)
    }

    /// Recursively merge `patch` into `record[section]`, creating the entry if
    /// needed. Other sections are never touched.
    pub fn upsert_section(
        &mut self,
        key: &str,
        section: &str,
        patch: &Value,
    ) -> CatalogResult<&Entry> {
        if section.is_empty() {
            return Err(CatalogError::EmptyName);
        }
        if RESERVED_SECTIONS.contains(&section) {
            return Err(CatalogError::ReservedSection(section.to_string()));
        }
        self.insert_key(key)?;
        let now = utc_now_iso_z();
        let entry = self
            .entries
            .get_mut(key)
            .ok_or(CatalogError::EmptyName)?;
        if document::is_tombstone(patch) {
            entry.sections.remove(section);
        } else {
            let target = entry
                .sections
                .entry(section.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            document::merge(target, patch);
        }
        entry.pipeline.last_updated = Some(now);
        Ok(entry)
    }

    /// Record `stage` as complete for `key`. Repeated calls only move the
    /// timestamp.
    pub fn mark_stage_complete(
        &mut self,
        key: &str,
        stage: &str,
        timestamp: &str,
    ) -> CatalogResult<()> {
        if stage.is_empty() {
            return Err(CatalogError::EmptyName);
        }
        self.insert_key(key)?;
        let entry = self
            .entries
            .get_mut(key)
            .ok_or(CatalogError::EmptyName)?;
        if !entry.has_stage(stage) {
            entry.pipeline.stages_completed.push(stage.to_string());
        }
        entry
            .pipeline
            .timestamps
            .insert(stage.to_string(), timestamp.to_string());
        entry.pipeline.last_updated = Some(timestamp.to_string());
        Ok(())
    }

    pub fn has_completed_stage(&self, key: &str, stage: &str) -> bool {
        self.entries
            .get(key)
            .is_some_and(|entry| entry.has_stage(stage))
    }

    /// Keys in enumeration order, filtered. Each call starts a fresh pass.
    /// `filter.limit` is not applied here; it caps processed entries in the runner.
    pub fn keys<'a>(&'a self, filter: &'a KeyFilter) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .keys()
            .map(String::as_str)
            .filter(move |key| filter.matches(key))
    }

    /// Atomically replace the durable file with the in-memory catalog.
    pub fn flush(&self) -> CatalogResult<()> {
        let mut text = serde_json::to_string_pretty(&self.entries)?;
        text.push('\n');
        write_atomic(&self.path, text.as_bytes()).map_err(|source| CatalogError::Flush {
            path: self.path.clone(),
            source,
        })?;
        tracing::trace!(path = %self.path.display(), entries = self.entries.len(), "catalog flushed");
        Ok(())
    }
}

/// Write `bytes` to a temp file beside `path`, fsync it, then rename it over
/// `path`. The temp file is removed if any step fails.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("catalog");
    let mut tmp = tempfile::Builder::new()
        .prefix(&format!(".{file_name}."))
        .suffix(".tmp")
        .tempfile_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|err| err.error)?;
    Ok(())
}

fn preserved_note(preserved: Option<&Path>) -> String {
    match preserved {
        Some(aside) => format!("preserved as {}", aside.display()),
        None => "could not be moved aside; left in place".to_string(),
    }
}

fn preserve_corrupt(path: &Path) -> Option<PathBuf> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "catalog".to_string());
    let mut aside = path.with_file_name(format!("{file_name}.corrupt-{}", file_stamp()));
    let mut attempt = 1;
    while aside.exists() {
        aside = path.with_file_name(format!("{file_name}.corrupt-{}-{attempt}", file_stamp()));
        attempt += 1;
    }
    match fs::rename(path, &aside) {
        Ok(()) => {
            tracing::error!(
                path = %path.display(),
                preserved = %aside.display(),
                "catalog unparsable; moved aside"
            );
            Some(aside)
        }
        Err(err) => {
            tracing::error!(path = %path.display(), %err, "catalog unparsable; could not move aside");
            None
        }
    }
}

#[cfg(test)]
#[path = "catalog_tests.rs"]
mod tests;
