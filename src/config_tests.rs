use super::*;
use serde_json::json;
use std::collections::BTreeMap;

fn parse(value: serde_json::Value) -> PipelineConfig {
    serde_json::from_value(value).expect("parse config")
}

fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: BTreeMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |name| map.get(name).cloned()
}

fn sample() -> PipelineConfig {
    parse(json!({
        "schema_version": 1,
        "paths": {
            "lib_root": "${PHOTO_LIB_ROOT}",
            "catalog": "{lib_root}/meta/master.json",
            "input": "albums",
            "stop_marker": "/tmp/custom.stop"
        },
        "archive": {"targets": [{"name": "albums", "path": "{lib_root}/albums"}]},
        "stages": [
            {"name": "ingest", "kind": "ingest", "extensions": ["jpg"]},
            {"name": "checksum", "kind": "checksum", "requires": ["ingest"]},
            {"name": "geocode", "kind": "command", "requires": ["ingest"],
             "command": "geocode-photo --json", "section": "location", "enabled": false}
        ]
    }))
}

#[test]
fn sample_config_validates_and_keeps_declaration_order() {
    let config = sample();
    validate_config(&config).expect("valid");
    let registry = config.registry().expect("registry");
    let names: Vec<_> = registry.stages().iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["ingest", "checksum", "geocode"]);
    assert!(!registry.get("geocode").expect("geocode").enabled);
    assert!(registry.get("checksum").expect("checksum").enabled);
}

#[test]
fn placeholders_resolve_against_lib_root() {
    let config = sample();
    let env = env_of(&[("PHOTO_LIB_ROOT", "/photos")]);
    let resolved = resolve_paths_with(&config, Path::new("/work"), &env).expect("resolve");
    let paths = &resolved.paths;
    assert_eq!(paths.lib_root(), Path::new("/photos"));
    assert_eq!(paths.catalog_path(), Path::new("/photos/meta/master.json"));
    assert_eq!(paths.input_dir(), Path::new("/photos/albums"));
    assert_eq!(
        paths.archive_dir(),
        Path::new("/photos/pipeline/archive"),
        "unset paths fall back to the default layout"
    );
    assert_eq!(paths.stop_marker_path(), Path::new("/tmp/custom.stop"));
    assert_eq!(resolved.targets.len(), 1);
    assert_eq!(resolved.targets[0].path, PathBuf::from("/photos/albums"));
}

#[test]
fn archive_target_may_not_enclose_catalog_or_archive() {
    let env = env_of(&[("PHOTO_LIB_ROOT", "/photos")]);
    for path in ["{lib_root}/meta", "{lib_root}"] {
        let mut config = sample();
        config.archive.targets[0].path = path.to_string();
        let err = resolve_paths_with(&config, Path::new("/work"), &env)
            .expect_err("target encloses pipeline state");
        assert!(err.to_string().contains("contains the"), "{err}");
    }

    let mut config = sample();
    config.archive.targets[0].path = "{lib_root}/pipeline/archive".to_string();
    let err = resolve_paths_with(&config, Path::new("/work"), &env).expect_err("archive dir");
    assert!(err.to_string().contains("archive directory"), "{err}");
}

#[test]
fn lib_root_env_override_wins() {
    let config = sample();
    let env = env_of(&[
        ("PHOTO_LIB_ROOT", "/photos"),
        (LIB_ROOT_ENV, "/override"),
    ]);
    let resolved = resolve_paths_with(&config, Path::new("/work"), &env).expect("resolve");
    assert_eq!(resolved.paths.lib_root(), Path::new("/override"));
    assert_eq!(
        resolved.paths.catalog_path(),
        Path::new("/override/meta/master.json")
    );
}

#[test]
fn lib_root_defaults_to_current_dir() {
    let config = parse(json!({"schema_version": 1}));
    let resolved = resolve_paths_with(&config, Path::new("/work"), &env_of(&[])).expect("resolve");
    assert_eq!(resolved.paths.lib_root(), Path::new("/work"));
    assert_eq!(
        resolved.paths.catalog_path(),
        Path::new("/work/pipeline/metadata/master.json")
    );
}

#[test]
fn missing_environment_variable_is_an_error() {
    let config = sample();
    let err = resolve_paths_with(&config, Path::new("/work"), &env_of(&[]))
        .expect_err("unset variable");
    assert!(format!("{err:#}").contains("PHOTO_LIB_ROOT"));
}

#[test]
fn rejects_unknown_schema_version() {
    let mut config = sample();
    config.schema_version = 2;
    assert!(validate_config(&config).is_err());
}

#[test]
fn rejects_forward_dependencies_and_duplicates() {
    let forward = parse(json!({
        "schema_version": 1,
        "stages": [
            {"name": "checksum", "kind": "checksum", "requires": ["ingest"]},
            {"name": "ingest", "kind": "ingest"}
        ]
    }));
    assert!(validate_config(&forward).is_err());

    let duplicate = parse(json!({
        "schema_version": 1,
        "stages": [
            {"name": "ingest", "kind": "ingest"},
            {"name": "ingest", "kind": "ingest"}
        ]
    }));
    assert!(validate_config(&duplicate).is_err());
}

#[test]
fn command_stage_needs_parseable_command_and_free_section() {
    let base = |command: serde_json::Value, section: serde_json::Value| {
        parse(json!({
            "schema_version": 1,
            "stages": [{"name": "llm", "kind": "command", "command": command, "section": section}]
        }))
    };
    validate_config(&base(json!("analyze --model 'big one'"), json!("llm_image_analysis")))
        .expect("valid command stage");
    assert!(validate_config(&base(json!("analyze 'unterminated"), json!("llm"))).is_err());
    assert!(validate_config(&base(json!("   "), json!("llm"))).is_err());
    assert!(validate_config(&base(json!("analyze"), json!("pipeline"))).is_err());
}

#[test]
fn unknown_fields_are_rejected() {
    let result: std::result::Result<PipelineConfig, _> = serde_json::from_value(json!({
        "schema_version": 1,
        "stages": [{"name": "ingest", "kind": "ingest", "retries": 3}]
    }));
    assert!(result.is_err());
}

#[test]
fn stub_round_trips_through_validation() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("pipeline.json");
    fs::write(&path, config_stub().expect("stub")).expect("write");
    let config = load_config(&path).expect("load stub");
    assert_eq!(config, default_config());
}
