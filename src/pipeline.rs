//! Pipeline executor: a state machine over an ordered list of steps. The
//! status store drives every decision; the executor only ever submits the
//! first step that is not done.

use crate::{
    backend::{Backend, QueueProbe, SchedulerKind},
    command::CommandRegistry,
    config::{self, ConfigError},
    dispatch::{self, DispatchError},
    status::{field, StatusError, StatusStore, TaskState},
};
use cowstr::CowStr;
use globset::{Glob, GlobMatcher};
use ignore::WalkBuilder;
use once_cell::sync::Lazy;
use serde_json::Value;
use std::{
    path::{Path, PathBuf},
    process::{Command, Stdio},
    thread,
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, info, warn};

/// File-name pattern that marks a config file as a pipeline config.
static PIPELINE_CONFIG_GLOB: Lazy<GlobMatcher> =
    Lazy::new(|| Glob::new("*pipeline*").expect("static glob").compile_matcher());

/// Seconds between polls in monitor mode.
pub const DEFAULT_POLL_SECONDS: u64 = 5;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Status(#[from] StatusError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error("Could not find required key \"pipeline\" in the pipeline config")]
    MissingPipelineKey,
    #[error("Config key \"pipeline\" must be a list of {{step: config_path}} mappings")]
    NotAList,
    #[error("Invalid pipeline step entry: {0}")]
    BadStep(String),
    #[error("Pipeline contains duplicate step names: {0:?}")]
    DuplicateSteps(Vec<String>),
    #[error("Pipeline step depends on non-existent file: {0}")]
    MissingStepConfig(PathBuf),
    #[error("Failed to resolve pipeline config path {0}")]
    ConfigPath(PathBuf, #[source] std::io::Error),
    #[error("Pipeline failed at step {index}: {step:?} for {config_path}")]
    StepFailed {
        index: usize,
        step: String,
        config_path: PathBuf,
    },
    #[error("Failed to spawn the background monitor process")]
    Background(#[source] std::io::Error),
}

/// One step reference from the pipeline config.
#[derive(Debug, Clone)]
pub struct PipelineStep {
    pub name: CowStr,
    pub config_path: PathBuf,
    command: Option<CowStr>,
}

impl PipelineStep {
    /// Parse a `{step-alias: config-path}` mapping with an optional second
    /// `command` key naming a distinct entry point.
    fn parse(value: &Value) -> Result<Self, PipelineError> {
        let mapping = value
            .as_object()
            .ok_or_else(|| PipelineError::BadStep(value.to_string()))?;

        if mapping.len() > 2 {
            return Err(PipelineError::BadStep(format!(
                "step mappings can have at most two keys, got: {value}"
            )));
        }

        let command = match mapping.get("command") {
            Some(command) => Some(CowStr::from(command.as_str().ok_or_else(|| {
                PipelineError::BadStep(format!("\"command\" must be a string, got: {command}"))
            })?)),
            None if mapping.len() > 1 => {
                return Err(PipelineError::BadStep(format!(
                    "the only extra key allowed in a step mapping is \"command\", got: {value}"
                )))
            }
            None => None,
        };

        let (name, config_path) = mapping
            .iter()
            .find(|(key, _)| key.as_str() != "command")
            .ok_or_else(|| PipelineError::BadStep(value.to_string()))?;
        let config_path = config_path
            .as_str()
            .ok_or_else(|| PipelineError::BadStep(format!("config path must be a string: {value}")))?;

        Ok(Self {
            name: CowStr::from(name.as_str()),
            config_path: PathBuf::from(config_path),
            command,
        })
    }

    /// The registered entry point to run; the alias unless overridden.
    pub fn command(&self) -> &str {
        self.command.as_deref().unwrap_or(&self.name)
    }
}

/// Aggregated state of one step, derived from its tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    /// No task records yet, or tasks reset to not-submitted.
    Pending,
    /// At least one task is submitted or running.
    Active,
    /// Every task is successful.
    Done,
    /// No task is active and at least one has failed.
    Failed,
}

/// What one invocation cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Dispatched the named step (fresh tasks or failed-task resubmission).
    Submitted(String),
    /// The named step still has live tasks; nothing to do but wait.
    Active(String),
    /// Every step is done.
    Complete,
}

pub struct Pipeline<'a> {
    registry: &'a CommandRegistry,
    config_path: PathBuf,
    project_dir: PathBuf,
    steps: Vec<PipelineStep>,
    verbose: bool,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        registry: &'a CommandRegistry,
        config_path: &Path,
        verbose: bool,
    ) -> Result<Self, PipelineError> {
        let config_path = config_path
            .canonicalize()
            .map_err(|error| PipelineError::ConfigPath(config_path.to_path_buf(), error))?;
        let project_dir = config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let config = config::load_config(&config_path)?;
        let steps = parse_pipeline_steps(config.get("pipeline"))?;

        let pipeline = Self {
            registry,
            config_path,
            project_dir,
            steps,
            verbose,
        };
        pipeline.init_status()?;
        Ok(pipeline)
    }

    pub fn steps(&self) -> &[PipelineStep] {
        &self.steps
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    /// Record each step's pipeline index so the status store can order and
    /// reset steps even before they have any tasks.
    fn init_status(&self) -> Result<(), PipelineError> {
        let mut store = StatusStore::open(&self.project_dir)?;
        store.update_from_task_files(false)?;
        for (index, step) in self.steps.iter().enumerate() {
            store.set_step_index(&step.name, index as u64);
        }
        store.dump_sorted()?;
        Ok(())
    }

    /// Open the store, fold pending task files, and reconcile against the
    /// scheduler. Every invocation cycle starts here.
    fn refreshed_store(&self) -> Result<StatusStore, PipelineError> {
        let mut store = StatusStore::open(&self.project_dir)?;
        store.update_from_task_files(true)?;
        store.reconcile(&mut QueueProbe::new())?;
        Ok(store)
    }

    fn step_status(&self, store: &StatusStore, step: &PipelineStep) -> StepStatus {
        let mut any = false;
        let mut all_successful = true;
        let mut any_processing = false;
        let mut any_failed = false;

        for (_, entry) in store.task_entries(&step.name) {
            any = true;
            match TaskState::from_value(entry.get(field::JOB_STATUS)) {
                TaskState::Successful => {}
                TaskState::Failed => {
                    any_failed = true;
                    all_successful = false;
                }
                TaskState::Submitted | TaskState::Running => {
                    any_processing = true;
                    all_successful = false;
                }
                TaskState::NotSubmitted => all_successful = false,
            }
        }

        if !any {
            StepStatus::Pending
        } else if any_processing {
            StepStatus::Active
        } else if all_successful {
            StepStatus::Done
        } else if any_failed {
            StepStatus::Failed
        } else {
            StepStatus::Pending
        }
    }

    /// Perform one invocation cycle: reconcile, find the first step that is
    /// not done, and act on it.
    pub fn one_shot(&self) -> Result<CycleOutcome, PipelineError> {
        let store = self.refreshed_store()?;

        for step in &self.steps {
            match self.step_status(&store, step) {
                StepStatus::Done => {
                    debug!(step = %step.name, "Successful");
                    continue;
                }
                StepStatus::Pending | StepStatus::Failed => {
                    // for a failed step, dispatch dedupe resubmits only the
                    // failed tasks and leaves successful siblings alone
                    dispatch::dispatch_step(
                        self.registry,
                        &step.name,
                        Some(step.command()),
                        &step.config_path,
                        self.verbose,
                    )?;
                    return Ok(CycleOutcome::Submitted(step.name.to_string()));
                }
                StepStatus::Active => {
                    info!(step = %step.name, "Step is still processing");
                    return Ok(CycleOutcome::Active(step.name.to_string()));
                }
            }
        }

        info!(
            "Pipeline in {} is complete",
            self.project_dir.display()
        );
        Ok(CycleOutcome::Complete)
    }

    /// Foreground monitor: drive every step to completion, polling with a
    /// bounded sleep. A step that fails while being watched is terminal.
    pub fn monitor(&self, poll: Duration) -> Result<(), PipelineError> {
        for (index, step) in self.steps.iter().enumerate() {
            let mut dispatched = false;

            loop {
                let store = self.refreshed_store()?;
                match self.step_status(&store, step) {
                    StepStatus::Done => {
                        info!(step = %step.name, "Step is complete");
                        break;
                    }
                    StepStatus::Pending | StepStatus::Failed if !dispatched => {
                        dispatch::dispatch_step(
                            self.registry,
                            &step.name,
                            Some(step.command()),
                            &step.config_path,
                            self.verbose,
                        )?;
                        dispatched = true;
                    }
                    StepStatus::Failed => {
                        return Err(PipelineError::StepFailed {
                            index,
                            step: step.name.to_string(),
                            config_path: step.config_path.clone(),
                        });
                    }
                    StepStatus::Active | StepStatus::Pending => {
                        thread::sleep(poll);
                    }
                }
            }
        }

        info!(
            "Pipeline in {} is complete",
            self.project_dir.display()
        );
        Ok(())
    }

    /// Best-effort cancellation of every job this pipeline submitted.
    pub fn cancel_all(&self) -> Result<(), PipelineError> {
        let mut store = StatusStore::open(&self.project_dir)?;
        store.update_from_task_files(false)?;

        let mut slurm = Backend::new(SchedulerKind::Slurm);
        let mut pbs = Backend::new(SchedulerKind::Pbs);

        for row in store.summary(None) {
            let Some(job_id) = row.job_id else { continue };
            let kind = row
                .hardware
                .as_deref()
                .and_then(|option| SchedulerKind::from_option(option).ok())
                .unwrap_or_default();
            let result = match kind {
                SchedulerKind::Slurm => slurm.cancel(job_id),
                SchedulerKind::Pbs => pbs.cancel(job_id),
                SchedulerKind::Local => continue,
            };
            if let Err(error) = result {
                warn!(job_id, error = ?error, "Failed to cancel job: {error}");
            }
        }

        info!("Pipeline jobs in {} cancelled", self.project_dir.display());
        Ok(())
    }

    /// Detach a monitor process that outlives the parent shell session and
    /// record its PID so later invocations refuse to double-drive.
    pub fn kickoff_background(config_path: &Path) -> Result<u32, PipelineError> {
        use std::os::unix::process::CommandExt;

        let config_path = config_path
            .canonicalize()
            .map_err(|error| PipelineError::ConfigPath(config_path.to_path_buf(), error))?;
        let project_dir = config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let child = Command::new(dispatch::program_name())
            .arg("pipeline")
            .arg("-c")
            .arg(&config_path)
            .arg("--monitor")
            .current_dir(&project_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .spawn()
            .map_err(PipelineError::Background)?;

        let pid = child.id();
        StatusStore::record_monitor_pid(&project_dir, pid as i32)?;
        info!("Kicking off pipeline job in the background. Monitor PID: {pid}");
        Ok(pid)
    }
}

fn parse_pipeline_steps(value: Option<&Value>) -> Result<Vec<PipelineStep>, PipelineError> {
    let value = value.ok_or(PipelineError::MissingPipelineKey)?;
    let entries = value.as_array().ok_or(PipelineError::NotAList)?;

    let mut steps = Vec::with_capacity(entries.len());
    let mut duplicates = Vec::new();
    for entry in entries {
        let step = PipelineStep::parse(entry)?;
        if steps.iter().any(|existing: &PipelineStep| existing.name == step.name) {
            duplicates.push(step.name.to_string());
        }
        if !step.config_path.exists() {
            return Err(PipelineError::MissingStepConfig(step.config_path));
        }
        steps.push(step);
    }

    if !duplicates.is_empty() {
        return Err(PipelineError::DuplicateSteps(duplicates));
    }

    Ok(steps)
}

/// Files in `dir` whose names match the pipeline-config pattern.
pub fn pipeline_configs_in(dir: &Path) -> Vec<PathBuf> {
    let mut candidates: Vec<PathBuf> = match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.is_file()
                    && path
                        .file_name()
                        .is_some_and(|name| PIPELINE_CONFIG_GLOB.is_match(name))
            })
            .collect(),
        Err(_) => Vec::new(),
    };
    candidates.sort();
    candidates
}

/// Locate every subdirectory of `root` (root included) holding exactly one
/// pipeline config file. Directories with multiple candidates are skipped
/// with a warning.
pub fn find_pipeline_configs(root: &Path) -> Vec<(PathBuf, PathBuf)> {
    let mut found = Vec::new();

    let walker = WalkBuilder::new(root)
        .standard_filters(false)
        .hidden(true)
        .build();
    for entry in walker.flatten() {
        if !entry.file_type().is_some_and(|file_type| file_type.is_dir()) {
            continue;
        }
        let dir = entry.path();

        let mut candidates = pipeline_configs_in(dir);
        match candidates.len() {
            0 => {}
            1 => found.push((dir.to_path_buf(), candidates.remove(0))),
            _ => warn!(
                dir = %dir.display(),
                "Could not determine the pipeline config: multiple files match *pipeline*"
            ),
        }
    }

    found.sort();
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn step_entries_parse_alias_command_and_path() {
        let step = PipelineStep::parse(&json!({"run": "./config_run.json"})).unwrap();
        assert_eq!(step.name.as_str(), "run");
        assert_eq!(step.command(), "run");

        let step = PipelineStep::parse(&json!({
            "run-2": "./config_run_2.json",
            "command": "run"
        }))
        .unwrap();
        assert_eq!(step.name.as_str(), "run-2");
        assert_eq!(step.command(), "run");

        assert!(PipelineStep::parse(&json!({"a": "x.json", "b": "y.json"})).is_err());
        assert!(PipelineStep::parse(&json!({"a": "x.json", "command": "c", "b": "y"})).is_err());
        assert!(PipelineStep::parse(&json!("run")).is_err());
    }

    #[test]
    fn duplicate_step_names_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let step_config = dir.path().join("config_run.json");
        std::fs::write(&step_config, "{}").unwrap();

        let value = json!([
            {"run": step_config.to_string_lossy()},
            {"run": step_config.to_string_lossy()}
        ]);
        let err = parse_pipeline_steps(Some(&value)).unwrap_err();
        assert!(matches!(err, PipelineError::DuplicateSteps(_)));
    }

    #[test]
    fn missing_step_config_is_rejected() {
        let value = json!([{"run": "/nonexistent/config_run.json"}]);
        let err = parse_pipeline_steps(Some(&value)).unwrap_err();
        assert!(matches!(err, PipelineError::MissingStepConfig(_)));
    }

    #[test]
    fn zero_step_pipeline_is_a_noop() {
        let steps = parse_pipeline_steps(Some(&json!([]))).unwrap();
        assert!(steps.is_empty());
    }

    #[test]
    fn recursive_discovery_requires_exactly_one_config() {
        let root = tempfile::tempdir().unwrap();

        let single = root.path().join("project_a");
        std::fs::create_dir(&single).unwrap();
        std::fs::write(single.join("config_pipeline.json"), "{}").unwrap();

        let multiple = root.path().join("project_b");
        std::fs::create_dir(&multiple).unwrap();
        std::fs::write(multiple.join("config_pipeline.json"), "{}").unwrap();
        std::fs::write(multiple.join("other_pipeline.json"), "{}").unwrap();

        let none = root.path().join("project_c");
        std::fs::create_dir(&none).unwrap();
        std::fs::write(none.join("config_run.json"), "{}").unwrap();

        let found = find_pipeline_configs(root.path());
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].0, single);
        assert!(found[0].1.ends_with("config_pipeline.json"));
    }
}
