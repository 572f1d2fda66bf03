//! Shared test infrastructure for integration tests.
//!
//! Each test gets a throwaway library root with a config that keeps every
//! path (including the stop marker) inside it.
#![allow(dead_code)]

use serde_json::{json, Value};
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Output, Stdio};
use tempfile::TempDir;

/// Prints `{"city": "Reno"}` for every entry.
pub const GEOCODE_OK: &str = r#"sh -c 'cat >/dev/null; echo "{\"city\": \"Reno\"}"'"#;

pub struct Library {
    _dir: TempDir,
    pub root: PathBuf,
}

impl Library {
    /// Library with three photos and an ingest/checksum/geocode pipeline.
    pub fn new(geocode_command: &str) -> Self {
        let stages = json!([
            {"name": "ingest", "kind": "ingest", "extensions": ["jpg"]},
            {"name": "checksum", "kind": "checksum", "requires": ["ingest"]},
            {"name": "geocode", "kind": "command", "requires": ["ingest"],
             "command": geocode_command, "section": "location", "timeout_secs": 20}
        ]);
        Self::with_stages(stages)
    }

    pub fn with_stages(stages: Value) -> Self {
        let dir = tempfile::tempdir().expect("temp dir");
        let root = dir.path().to_path_buf();
        let library = Self { _dir: dir, root };
        for name in ["a.jpg", "b.jpg", "c.jpg"] {
            library.add_photo(name, name.as_bytes());
        }
        library.add_photo("notes.txt", b"not a photo");
        library.write_config(&json!({
            "schema_version": 1,
            "paths": {
                "lib_root": library.root.display().to_string(),
                "input": "{lib_root}/albums",
                "stop_marker": "{lib_root}/run.stop"
            },
            "archive": {"targets": [{"name": "albums", "path": "{lib_root}/albums"}]},
            "stages": stages
        }));
        library
    }

    pub fn write_config(&self, config: &Value) {
        let text = serde_json::to_string_pretty(config).expect("serialize config");
        fs::write(self.config_path(), text).expect("write config");
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join("pipeline.json")
    }

    pub fn add_photo(&self, rel: &str, bytes: &[u8]) -> PathBuf {
        let path = self.root.join("albums").join(rel);
        fs::create_dir_all(path.parent().expect("parent")).expect("create album dir");
        fs::write(&path, bytes).expect("write photo");
        path
    }

    pub fn key(&self, rel: &str) -> String {
        self.root.join("albums").join(rel).display().to_string()
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.root.join("pipeline/metadata/master.json")
    }

    pub fn history_path(&self) -> PathBuf {
        self.root.join("pipeline/metadata/history.jsonl")
    }

    pub fn stop_marker(&self) -> PathBuf {
        self.root.join("run.stop")
    }

    pub fn catalog(&self) -> Value {
        let bytes = fs::read(self.catalog_path()).expect("read catalog");
        serde_json::from_slice(&bytes).expect("parse catalog")
    }

    pub fn history(&self) -> Vec<Value> {
        let text = fs::read_to_string(self.history_path()).unwrap_or_default();
        text.lines()
            .map(|line| serde_json::from_str(line).expect("history line"))
            .collect()
    }

    /// Run the binary with this library's config and no stdin.
    pub fn scatalog(&self, args: &[&str]) -> Output {
        self.scatalog_with_input(args, "")
    }

    pub fn scatalog_with_input(&self, args: &[&str], input: &str) -> Output {
        let mut child = Command::new(env!("CARGO_BIN_EXE_scatalog"))
            .arg("--config")
            .arg(self.config_path())
            .args(args)
            .current_dir(&self.root)
            .env_remove("STAGE_CATALOG_LIB_ROOT")
            .env_remove("STAGE_CATALOG_CONFIG")
            .env("RUST_LOG", "warn")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .expect("spawn scatalog");
        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(input.as_bytes());
        }
        child.wait_with_output().expect("wait for scatalog")
    }

    /// `run --yes --json`, returning the parsed report.
    pub fn run_json(&self, extra: &[&str]) -> (Output, Value) {
        let mut args = vec!["run", "--yes", "--json"];
        args.extend_from_slice(extra);
        let output = self.scatalog(&args);
        let report = serde_json::from_slice(&output.stdout).unwrap_or(Value::Null);
        (output, report)
    }
}

pub fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

pub fn stage_summary<'a>(report: &'a Value, stage: &str) -> &'a Value {
    report["stages"]
        .as_array()
        .and_then(|stages| stages.iter().find(|s| s["stage"] == stage))
        .unwrap_or_else(|| panic!("no summary for {stage} in {report}"))
}
