//! Snapshots of the catalog and working trees taken before destructive resets.
//!
//! A snapshot is one `.tar.gz` bundle in the archive directory:
//!
//! ```text
//! <archive_dir>/<label>_<YYYYmmdd_HHMMSS>[_N].tar.gz
//!   catalog/<catalog file name>
//!   trees/<target name>/...
//! ```
//!
//! Bundles are written to a temp file in the archive directory and renamed
//! into place, so a listed snapshot is always complete. A reset requires a
//! `Snapshot` value, which only `snapshot` produces.
use crate::catalog::write_atomic;
use crate::util::{file_stamp, sanitize_label, utc_now_iso_z};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use regex::Regex;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use thiserror::Error;

const SNAPSHOT_SUFFIX: &str = ".tar.gz";
const CATALOG_MEMBER_DIR: &str = "catalog";
const TREES_MEMBER_DIR: &str = "trees";

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("{action} {}: {source}", path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("snapshot {} holds no catalog", .0.display())]
    NoCatalogInSnapshot(PathBuf),
    #[error("catalog in snapshot {} is not valid JSON: {source}", path.display())]
    InvalidCatalog {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("refusing to reset {} because it holds the {what} {}", target.display(), inside.display())]
    UnsafeTarget {
        target: PathBuf,
        what: &'static str,
        inside: PathBuf,
    },
}

fn io_err(action: &'static str, path: &Path) -> impl FnOnce(io::Error) -> ArchiveError {
    let path = path.to_path_buf();
    move |source| ArchiveError::Io {
        action,
        path,
        source,
    }
}

/// A working directory captured by snapshots and cleared by resets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchiveTarget {
    pub name: String,
    pub path: PathBuf,
}

/// A bundle written by this process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    pub path: PathBuf,
    pub label: String,
    pub created_at: String,
    /// Top-level members, e.g. `catalog/master.json` and `trees/albums`.
    pub members: Vec<String>,
}

/// A bundle found in the archive directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotInfo {
    pub path: PathBuf,
    pub label: String,
    pub stamp: String,
    pub sequence: u32,
    pub size_bytes: u64,
}

/// What a reset may clear.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResetScope {
    pub targets: bool,
    pub catalog: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreOutcome {
    pub catalog: PathBuf,
    /// Where the replaced catalog was copied, if there was one.
    pub preserved: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ArchiveManager {
    archive_dir: PathBuf,
    catalog_path: PathBuf,
    targets: Vec<ArchiveTarget>,
}

impl ArchiveManager {
    pub fn new(archive_dir: PathBuf, catalog_path: PathBuf, targets: Vec<ArchiveTarget>) -> Self {
        Self {
            archive_dir,
            catalog_path,
            targets,
        }
    }

    pub fn archive_dir(&self) -> &Path {
        &self.archive_dir
    }

    /// Bundle the catalog and every non-empty target. Originals are untouched.
    pub fn snapshot(&self, label: &str) -> Result<Snapshot, ArchiveError> {
        fs::create_dir_all(&self.archive_dir).map_err(io_err("create", &self.archive_dir))?;
        self.check_targets(false)?;

        let label = sanitize_label(label);
        let path = self.free_snapshot_path(&label);
        let mut tmp = tempfile::Builder::new()
            .prefix(".snapshot-")
            .suffix(".tmp")
            .tempfile_in(&self.archive_dir)
            .map_err(io_err("create temp file in", &self.archive_dir))?;
        let file = tmp
            .as_file_mut()
            .try_clone()
            .map_err(io_err("open", tmp.path()))?;

        let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
        let mut members = Vec::new();
        if self.catalog_path.is_file() {
            let name = self
                .catalog_path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| "catalog.json".to_string());
            let member = format!("{CATALOG_MEMBER_DIR}/{name}");
            builder
                .append_path_with_name(&self.catalog_path, &member)
                .map_err(io_err("archive", &self.catalog_path))?;
            members.push(member);
        }
        for target in &self.targets {
            if !dir_has_entries(&target.path) {
                tracing::debug!(target = %target.name, path = %target.path.display(), "nothing to archive");
                continue;
            }
            let member = format!("{TREES_MEMBER_DIR}/{}", target.name);
            builder
                .append_dir_all(&member, &target.path)
                .map_err(io_err("archive", &target.path))?;
            members.push(member);
        }
        let encoder = builder.into_inner().map_err(io_err("write", tmp.path()))?;
        let file = encoder.finish().map_err(io_err("compress", tmp.path()))?;
        file.sync_all().map_err(io_err("sync", tmp.path()))?;
        drop(file);
        tmp.persist(&path)
            .map_err(|err| ArchiveError::Io {
                action: "publish",
                path: path.clone(),
                source: err.error,
            })?;

        tracing::info!(path = %path.display(), members = members.len(), "snapshot written");
        Ok(Snapshot {
            path,
            label,
            created_at: utc_now_iso_z(),
            members,
        })
    }

    /// Empty the selected targets (and optionally the catalog) after `snapshot`
    /// has captured them. Returns the paths that were cleared.
    pub fn reset_after_snapshot(
        &self,
        snapshot: &Snapshot,
        scope: ResetScope,
    ) -> Result<Vec<PathBuf>, ArchiveError> {
        if !snapshot.path.is_file() {
            return Err(ArchiveError::Io {
                action: "find snapshot",
                path: snapshot.path.clone(),
                source: io::Error::from(io::ErrorKind::NotFound),
            });
        }
        let mut cleared = Vec::new();
        if scope.targets {
            self.check_targets(!scope.catalog)?;
            for target in &self.targets {
                if target.path.exists() {
                    fs::remove_dir_all(&target.path).map_err(io_err("remove", &target.path))?;
                }
                fs::create_dir_all(&target.path).map_err(io_err("create", &target.path))?;
                tracing::info!(target = %target.name, path = %target.path.display(), "target reset");
                cleared.push(target.path.clone());
            }
        }
        if scope.catalog && self.catalog_path.exists() {
            fs::remove_file(&self.catalog_path).map_err(io_err("remove", &self.catalog_path))?;
            tracing::info!(path = %self.catalog_path.display(), "catalog reset");
            cleared.push(self.catalog_path.clone());
        }
        Ok(cleared)
    }

    /// Snapshot, then reset. A failed snapshot leaves everything in place.
    pub fn snapshot_and_reset(
        &self,
        label: &str,
        scope: ResetScope,
    ) -> Result<Snapshot, ArchiveError> {
        if scope.targets {
            self.check_targets(!scope.catalog)?;
        }
        let snapshot = self.snapshot(label)?;
        self.reset_after_snapshot(&snapshot, scope)?;
        Ok(snapshot)
    }

    /// Snapshots in the archive directory, newest first.
    pub fn list(&self) -> Result<Vec<SnapshotInfo>, ArchiveError> {
        if !self.archive_dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut found = Vec::new();
        for entry in fs::read_dir(&self.archive_dir).map_err(io_err("read", &self.archive_dir))? {
            let entry = entry.map_err(io_err("read", &self.archive_dir))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(caps) = snapshot_name_re().captures(&name) else {
                continue;
            };
            let size_bytes = entry.metadata().map(|meta| meta.len()).unwrap_or(0);
            found.push(SnapshotInfo {
                path: entry.path(),
                label: caps["label"].to_string(),
                stamp: caps["stamp"].to_string(),
                sequence: caps
                    .name("seq")
                    .and_then(|seq| seq.as_str().parse().ok())
                    .unwrap_or(0),
                size_bytes,
            });
        }
        found.sort_by(|a, b| {
            (b.stamp.as_str(), b.sequence, b.label.as_str()).cmp(&(
                a.stamp.as_str(),
                a.sequence,
                a.label.as_str(),
            ))
        });
        Ok(found)
    }

    pub fn latest(&self) -> Result<Option<SnapshotInfo>, ArchiveError> {
        Ok(self.list()?.into_iter().next())
    }

    /// Replace the catalog file with the copy held in `snapshot`.
    pub fn restore_catalog(&self, snapshot: &Path) -> Result<RestoreOutcome, ArchiveError> {
        let bytes = read_catalog_member(snapshot)?
            .ok_or_else(|| ArchiveError::NoCatalogInSnapshot(snapshot.to_path_buf()))?;
        serde_json::from_slice::<serde_json::Value>(&bytes).map_err(|source| {
            ArchiveError::InvalidCatalog {
                path: snapshot.to_path_buf(),
                source,
            }
        })?;

        let mut preserved = None;
        if self.catalog_path.is_file() {
            let current = fs::read(&self.catalog_path).map_err(io_err("read", &self.catalog_path))?;
            if current != bytes {
                let aside = pre_restore_path(&self.catalog_path);
                fs::copy(&self.catalog_path, &aside).map_err(io_err("copy", &aside))?;
                preserved = Some(aside);
            }
        }
        write_atomic(&self.catalog_path, &bytes).map_err(io_err("write", &self.catalog_path))?;
        tracing::info!(
            snapshot = %snapshot.display(),
            catalog = %self.catalog_path.display(),
            "catalog restored"
        );
        Ok(RestoreOutcome {
            catalog: self.catalog_path.clone(),
            preserved,
        })
    }

    /// A target may never hold the archive. With `guard_catalog` it may not
    /// hold the catalog either.
    fn check_targets(&self, guard_catalog: bool) -> Result<(), ArchiveError> {
        let archive = normalize(&self.archive_dir);
        let catalog = normalize(&self.catalog_path);
        for target in &self.targets {
            let root = normalize(&target.path);
            if archive.starts_with(&root) {
                return Err(ArchiveError::UnsafeTarget {
                    target: target.path.clone(),
                    what: "archive directory",
                    inside: self.archive_dir.clone(),
                });
            }
            if guard_catalog && catalog.starts_with(&root) {
                return Err(ArchiveError::UnsafeTarget {
                    target: target.path.clone(),
                    what: "catalog",
                    inside: self.catalog_path.clone(),
                });
            }
        }
        Ok(())
    }

    fn free_snapshot_path(&self, label: &str) -> PathBuf {
        let base = format!("{label}_{}", file_stamp());
        let mut path = self.archive_dir.join(format!("{base}{SNAPSHOT_SUFFIX}"));
        let mut sequence = 1;
        while path.exists() {
            path = self
                .archive_dir
                .join(format!("{base}_{sequence}{SNAPSHOT_SUFFIX}"));
            sequence += 1;
        }
        path
    }
}

fn snapshot_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?P<label>[A-Za-z0-9_-]+?)_(?P<stamp>\d{8}_\d{6})(?:_(?P<seq>\d+))?\.tar\.gz$")
            .expect("snapshot name regex")
    })
}

fn read_catalog_member(snapshot: &Path) -> Result<Option<Vec<u8>>, ArchiveError> {
    let file = File::open(snapshot).map_err(io_err("open", snapshot))?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    for entry in archive.entries().map_err(io_err("read", snapshot))? {
        let mut entry = entry.map_err(io_err("read", snapshot))?;
        let path = entry.path().map_err(io_err("read", snapshot))?.into_owned();
        let mut components = path.components();
        let in_catalog_dir = components
            .next()
            .is_some_and(|first| first.as_os_str() == CATALOG_MEMBER_DIR);
        if in_catalog_dir && components.next().is_some() && components.next().is_none() {
            let mut bytes = Vec::new();
            entry
                .read_to_end(&mut bytes)
                .map_err(io_err("read", snapshot))?;
            return Ok(Some(bytes));
        }
    }
    Ok(None)
}

fn pre_restore_path(catalog: &Path) -> PathBuf {
    let file_name = catalog
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "catalog".to_string());
    let mut aside = catalog.with_file_name(format!("{file_name}.pre-restore-{}", file_stamp()));
    let mut attempt = 1;
    while aside.exists() {
        aside = catalog.with_file_name(format!(
            "{file_name}.pre-restore-{}-{attempt}",
            file_stamp()
        ));
        attempt += 1;
    }
    aside
}

fn dir_has_entries(path: &Path) -> bool {
    fs::read_dir(path)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

fn normalize(path: &Path) -> PathBuf {
    if let Ok(path) = path.canonicalize() {
        return path;
    }
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => normalize(parent).join(name),
        _ => path.to_path_buf(),
    }
}
