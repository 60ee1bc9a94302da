//! Batch expansion: deterministic directory materialization and execution.

use geoflow::{
    batch::{BatchExpander, BATCH_CSV},
    command::{builtin_script, CommandRegistry},
    dispatch::PROGRAM_ENV,
    status::{StatusStore, TaskState},
};
use serde_json::{json, Value};
use std::{fs, path::Path, path::PathBuf};

fn registry() -> CommandRegistry {
    std::env::set_var(PROGRAM_ENV, env!("CARGO_BIN_EXE_geoflow"));
    let mut registry = CommandRegistry::new();
    registry.register(builtin_script());
    registry
}

fn write_json(path: &Path, value: &Value) {
    fs::write(path, serde_json::to_string_pretty(value).unwrap()).unwrap();
}

/// A batch root with one zipped set sweeping `a` and `b` into the run
/// config of a single-step pipeline.
fn batch_project(root: &Path) -> PathBuf {
    let base = root.join("sweep");
    fs::create_dir(&base).unwrap();

    write_json(
        &base.join("config_run.json"),
        &json!({
            "execution_control": {"option": "local"},
            "cmd": ["true"],
            "a": 0,
            "b": 0,
        }),
    );
    write_json(
        &base.join("config_pipeline.json"),
        &json!({
            "pipeline": [{"run": "./config_run.json", "command": "script"}],
        }),
    );
    write_json(
        &base.join("config_batch.json"),
        &json!({
            "pipeline_config": "./config_pipeline.json",
            "sets": [{
                "args": {"a": [1, 2], "b": [3, 4]},
                "files": ["./config_run.json"],
                "set_tag": "s1",
            }],
        }),
    );

    base
}

#[test]
fn dry_run_materializes_substituted_directories() {
    let registry = registry();
    let root = tempfile::tempdir().unwrap();
    let base = batch_project(root.path());

    let expander = BatchExpander::new(&registry, &base.join("config_batch.json"), false).unwrap();
    expander.run(true, false).unwrap();

    for (dir_name, a, b) in [("s1_a1_b3", 1, 3), ("s1_a2_b4", 2, 4)] {
        let job_dir = base.join(dir_name);
        assert!(job_dir.is_dir(), "missing job dir {dir_name}");
        assert!(job_dir.join("config_pipeline.json").is_file());

        let run_config: Value =
            serde_json::from_str(&fs::read_to_string(job_dir.join("config_run.json")).unwrap())
                .unwrap();
        assert_eq!(run_config["a"], json!(a));
        assert_eq!(run_config["b"], json!(b));
        // no jobs were submitted during the dry run
        assert!(!job_dir.join(".geoflow").exists());
    }

    let index = fs::read_to_string(base.join(BATCH_CSV)).unwrap();
    assert!(index.lines().count() >= 3);
    assert!(index.contains("s1_a1_b3"));
    assert!(index.contains("s1_a2_b4"));
}

#[test]
fn expansion_is_deterministic() {
    let registry = registry();
    let root = tempfile::tempdir().unwrap();
    let base = batch_project(root.path());
    let batch_config = base.join("config_batch.json");

    let expander = BatchExpander::new(&registry, &batch_config, false).unwrap();
    expander.run(true, false).unwrap();
    let first = fs::read_to_string(base.join("s1_a1_b3").join("config_run.json")).unwrap();
    let first_index = fs::read_to_string(base.join(BATCH_CSV)).unwrap();

    expander.delete().unwrap();
    assert!(!base.join("s1_a1_b3").exists());

    let expander = BatchExpander::new(&registry, &batch_config, false).unwrap();
    expander.run(true, false).unwrap();
    assert_eq!(
        fs::read_to_string(base.join("s1_a1_b3").join("config_run.json")).unwrap(),
        first
    );
    assert_eq!(fs::read_to_string(base.join(BATCH_CSV)).unwrap(), first_index);
}

#[test]
fn delete_removes_only_indexed_directories() {
    let registry = registry();
    let root = tempfile::tempdir().unwrap();
    let base = batch_project(root.path());

    let expander = BatchExpander::new(&registry, &base.join("config_batch.json"), false).unwrap();
    expander.run(true, false).unwrap();

    // an unrelated directory survives the delete
    let keep = base.join("unrelated");
    fs::create_dir(&keep).unwrap();

    expander.delete().unwrap();
    assert!(!base.join("s1_a1_b3").exists());
    assert!(!base.join("s1_a2_b4").exists());
    assert!(!base.join(BATCH_CSV).exists());
    assert!(keep.is_dir());
}

#[test]
fn full_run_executes_each_sub_pipeline() {
    let registry = registry();
    let root = tempfile::tempdir().unwrap();
    let base = batch_project(root.path());

    let expander = BatchExpander::new(&registry, &base.join("config_batch.json"), false).unwrap();
    expander.run(false, false).unwrap();

    for dir_name in ["s1_a1_b3", "s1_a2_b4"] {
        let job_dir = base.join(dir_name);
        let mut store = StatusStore::open(&job_dir).unwrap();
        store.update_from_task_files(true).unwrap();

        let rows = store.summary(None);
        assert_eq!(rows.len(), 1, "expected one task in {dir_name}");
        assert_eq!(rows[0].state, TaskState::Successful);
    }
}

#[test]
fn generated_directories_are_their_own_projects() {
    let registry = registry();
    let root = tempfile::tempdir().unwrap();
    let base = batch_project(root.path());

    let expander = BatchExpander::new(&registry, &base.join("config_batch.json"), false).unwrap();
    expander.run(false, false).unwrap();

    // job names are keyed by the generated directory, not the batch root
    let mut store = StatusStore::open(&base.join("s1_a1_b3")).unwrap();
    store.update_from_task_files(true).unwrap();
    assert_eq!(
        store.task_state("run", "s1_a1_b3_run"),
        TaskState::Successful
    );
}
