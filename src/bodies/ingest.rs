//! Discovery stage: finds new photos under the input directory.
use crate::stage::{Patch, StageBody, StageContext, StageFailure};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::json;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub const DEFAULT_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "heic", "tif", "tiff", "webp"];

#[derive(Debug, Clone)]
pub struct IngestBody {
    input_dir: PathBuf,
    extensions: Vec<String>,
}

impl IngestBody {
    pub fn new(input_dir: PathBuf, extensions: &[String]) -> Self {
        let extensions = if extensions.is_empty() {
            DEFAULT_EXTENSIONS.iter().map(|ext| ext.to_string()).collect()
        } else {
            extensions
                .iter()
                .map(|ext| ext.trim_start_matches('.').to_ascii_lowercase())
                .collect()
        };
        Self {
            input_dir,
            extensions,
        }
    }

    fn wanted(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| {
                let ext = ext.to_ascii_lowercase();
                self.extensions.iter().any(|wanted| wanted == &ext)
            })
    }
}

impl StageBody for IngestBody {
    fn preflight(&mut self) -> Result<(), StageFailure> {
        if !self.input_dir.is_dir() {
            return Err(StageFailure::fatal(format!(
                "input directory {} does not exist",
                self.input_dir.display()
            )));
        }
        Ok(())
    }

    fn discover(&mut self) -> Result<Vec<String>, StageFailure> {
        let files = collect_files_recursive(&self.input_dir).map_err(|err| {
            StageFailure::recoverable(format!("scan {}: {err}", self.input_dir.display()))
        })?;
        Ok(files
            .into_iter()
            .filter(|path| self.wanted(path))
            .map(|path| path.display().to_string())
            .collect())
    }

    fn process(&mut self, ctx: &StageContext<'_>) -> Result<Patch, StageFailure> {
        let path = Path::new(ctx.key);
        let meta = fs::metadata(path)
            .map_err(|err| StageFailure::recoverable(format!("stat {}: {err}", ctx.key)))?;
        let modified_at = meta
            .modified()
            .ok()
            .map(|time| DateTime::<Utc>::from(time).to_rfc3339_opts(SecondsFormat::Secs, true));
        Ok(Patch::section(
            "file",
            json!({
                "file_name": path.file_name().map(|n| n.to_string_lossy().into_owned()),
                "stem": path.file_stem().map(|n| n.to_string_lossy().into_owned()),
                "extension": path.extension().map(|n| n.to_string_lossy().to_ascii_lowercase()),
                "size_bytes": meta.len(),
                "modified_at": modified_at,
            }),
        ))
    }
}

/// All regular files below `root`, sorted, skipping dot-files and dot-dirs.
pub fn collect_files_recursive(root: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    if !root.exists() {
        return Ok(files);
    }
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        let path = entry.path();
        if path.is_dir() {
            files.extend(collect_files_recursive(&path)?);
        } else if path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;

    #[test]
    fn discovers_matching_extensions_recursively() {
        let dir = tempfile::tempdir().expect("temp dir");
        let album = dir.path().join("album");
        fs::create_dir_all(album.join("nested")).expect("create dirs");
        fs::write(album.join("a.JPG"), b"a").expect("write");
        fs::write(album.join("nested").join("b.heic"), b"b").expect("write");
        fs::write(album.join("notes.txt"), b"n").expect("write");
        fs::write(album.join(".hidden.jpg"), b"h").expect("write");

        let mut body = IngestBody::new(album.clone(), &[]);
        body.preflight().expect("preflight");
        let found = body.discover().expect("discover");
        assert_eq!(
            found,
            vec![
                album.join("a.JPG").display().to_string(),
                album.join("nested").join("b.heic").display().to_string(),
            ]
        );
    }

    #[test]
    fn missing_input_dir_is_fatal() {
        let dir = tempfile::tempdir().expect("temp dir");
        let mut body = IngestBody::new(dir.path().join("absent"), &["jpg".to_string()]);
        assert!(body.preflight().expect_err("missing dir").is_fatal());
    }

    #[test]
    fn process_records_file_section_and_vanished_files_are_recoverable() {
        let dir = tempfile::tempdir().expect("temp dir");
        let photo = dir.path().join("lake.jpeg");
        fs::write(&photo, b"12345").expect("write");
        let key = photo.display().to_string();

        let mut catalog = Catalog::empty(dir.path().join("master.json"));
        catalog.insert_key(&key).expect("insert");
        let mut body = IngestBody::new(dir.path().to_path_buf(), &[]);
        let ctx = StageContext {
            stage: "ingest",
            key: &key,
            entry: catalog.get(&key).expect("entry"),
        };
        let patch = body.process(&ctx).expect("process");
        let (section, value) = patch.iter().next().expect("one section");
        assert_eq!(section, "file");
        assert_eq!(value["file_name"], "lake.jpeg");
        assert_eq!(value["stem"], "lake");
        assert_eq!(value["size_bytes"], 5);

        fs::remove_file(&photo).expect("remove");
        let err = body.process(&ctx).expect_err("vanished file");
        assert!(!err.is_fatal());
    }
}
