//! Step dispatcher: fans one logical step out into N concrete cluster jobs
//! by taking the product over the step's declared split keys.

use crate::{
    backend::{Backend, ExecutionControl, SubmitError, SubmitRequest},
    command::{
        task_field,
        CommandError,
        CommandRegistry,
        EntryPoint,
        PreprocessContext,
        SplitKey,
        TASK_KEY,
    },
    config::{self, Config, ConfigError, ConfigFormat},
    points::{PointsError, SiteTable},
    status::{field, StatusError, StatusStore, TaskState, DT_FMT},
};
use chrono::Local;
use itertools::Itertools;
use serde_json::{json, Map, Value};
use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, info};

/// The split key whose chunking is delegated to the site-table partitioner.
pub const PROJECT_POINTS_KEY: &str = "project_points";

/// Environment override for the program named in generated command lines.
/// Defaults to the current executable.
pub const PROGRAM_ENV: &str = "GEOFLOW_PROGRAM";

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error(transparent)]
    Status(#[from] StatusError),
    #[error(transparent)]
    Points(#[from] PointsError),
    #[error(transparent)]
    Resources(#[from] SubmitError),
    #[error("Failed to resolve config path {0}")]
    ConfigPath(PathBuf, #[source] std::io::Error),
    #[error("Failed to submit job {job:?}")]
    Submit {
        job: String,
        #[source]
        source: SubmitError,
    },
    #[error("Step {step:?}: declared split key {key:?} is missing from the config")]
    MissingSplitKey { step: String, key: String },
    #[error("Step {step:?}: split key {key:?} must hold a sequence")]
    SplitKeyNotAList { step: String, key: String },
    #[error("Step {step:?}: split key {key:?} is empty; a step with zero tasks is illegal")]
    EmptySplitKey { step: String, key: String },
    #[error("Step {step:?}: zipped split keys {keys:?} must share a length, got {lengths:?}")]
    ZippedLengthMismatch {
        step: String,
        keys: Vec<String>,
        lengths: Vec<usize>,
    },
    #[error("Step {step:?}: duplicate task tag {tag:?}")]
    DuplicateTag { step: String, tag: String },
    #[error(
        "Task {job:?} already ran successfully with different inputs; \
         reset the status before re-running with a changed config"
    )]
    ConfigChanged { job: String },
}

/// One slice of one split axis: the tag fragment plus the scalar
/// assignments it pins in the task config.
#[derive(Debug, Clone)]
struct TaskSlice {
    fragment: String,
    assignments: Vec<(String, Value)>,
}

/// What a dispatch invocation did.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub step: String,
    pub submitted: usize,
    pub skipped: usize,
    pub job_names: Vec<String>,
}

/// Dispatch one step: derive its tasks, skip the ones that are already
/// done or live, and submit the rest.
pub fn dispatch_step(
    registry: &CommandRegistry,
    step: &str,
    command: Option<&str>,
    config_path: &Path,
    verbose: bool,
) -> Result<DispatchOutcome, DispatchError> {
    StepDispatcher::new(registry, step, command, config_path, verbose)?.run()
}

pub struct StepDispatcher<'a> {
    registry: &'a CommandRegistry,
    step: String,
    command: String,
    config_path: PathBuf,
    project_dir: PathBuf,
    verbose: bool,
}

impl<'a> StepDispatcher<'a> {
    pub fn new(
        registry: &'a CommandRegistry,
        step: &str,
        command: Option<&str>,
        config_path: &Path,
        verbose: bool,
    ) -> Result<Self, DispatchError> {
        let config_path = config_path
            .canonicalize()
            .map_err(|error| DispatchError::ConfigPath(config_path.to_path_buf(), error))?;
        let project_dir = config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        Ok(Self {
            registry,
            step: step.to_owned(),
            command: command.unwrap_or(step).to_owned(),
            config_path,
            project_dir,
            verbose,
        })
    }

    pub fn run(&self) -> Result<DispatchOutcome, DispatchError> {
        let entry = self.registry.get(&self.command)?;
        let mut config = config::load_config(&self.config_path)?;

        let on_hpc = config
            .get("execution_control")
            .and_then(Value::as_object)
            .and_then(|block| block.get("option"))
            .and_then(Value::as_str)
            .is_some_and(|option| option != "local");
        config::reject_placeholders(&config, on_hpc)?;

        let log_directory = match config.remove("log_directory").as_ref().and_then(Value::as_str) {
            Some(dir) => PathBuf::from(dir),
            None => self.project_dir.join("logs"),
        };
        let verbose = self.verbose
            || config
                .remove("log_level")
                .as_ref()
                .and_then(Value::as_str)
                .is_some_and(|level| level.eq_ignore_ascii_case("debug"));

        // lift entry-point-declared extension keys out of the exec block
        // before the remaining keys are validated against the backend
        let mut exec_extras: Vec<(String, Value)> = Vec::new();
        if let Some(block) = config
            .get_mut("execution_control")
            .and_then(Value::as_object_mut)
        {
            for key in &entry.exec_extensions {
                if let Some(value) = block.remove(key.as_str()) {
                    exec_extras.push((key.to_string(), value));
                }
            }
        }

        let resources = ExecutionControl::from_config(&mut config)?;

        let mut store = StatusStore::open(&self.project_dir)?;
        store.update_from_task_files(false)?;
        let job_base = format!("{}_{}", store.name(), self.step.replace('-', "_"));

        info!(
            step = %self.step,
            command = %self.command,
            option = %resources.option,
            "Dispatching step from config file {}",
            self.config_path.display()
        );

        if let Some(preprocessor) = entry.preprocessor {
            let context = PreprocessContext {
                step: &self.step,
                command: &self.command,
                job_name: &job_base,
                project_dir: &self.project_dir,
                config_path: &self.config_path,
                log_directory: &log_directory,
                verbose,
            };
            preprocessor(&mut config, &context)
                .map_err(|error| CommandError::Preprocess(self.command.clone(), error))?;
        }

        let axes = self.build_axes(entry, &config, &resources)?;
        let tasks = enumerate_tasks(&axes);
        let tags = self.tag_tasks(&tasks)?;
        debug!(step = %self.step, count = tasks.len(), "Enumerated tasks");

        let stdout_dir = resources.stdout_dir(&log_directory);
        let mut backend = Backend::new(resources.option);
        let program = program_name();

        let mut submitted = 0;
        let mut skipped = 0;
        let mut job_names = Vec::with_capacity(tasks.len());

        for (slices, tag) in tasks.iter().zip(&tags) {
            let job_name = format!("{job_base}{tag}");
            let (task_config_path, config_hash) =
                self.materialize(&config, entry, &resources, &exec_extras, slices, tag, &job_name)?;

            if !self.should_submit(&mut store, &mut backend, &job_name, &config_hash)? {
                skipped += 1;
                job_names.push(job_name);
                continue;
            }

            let cmd = format!(
                "{program} {} -c {}{}",
                self.step,
                task_config_path.display(),
                if verbose { " -v" } else { "" }
            );
            fs::create_dir_all(&stdout_dir)
                .map_err(|error| DispatchError::ConfigPath(stdout_dir.clone(), error))?;

            let request = SubmitRequest {
                name: &job_name,
                cmd: &cmd,
                project_dir: &self.project_dir,
                stdout_dir: &stdout_dir,
                resources: &resources,
            };

            let mut attrs = Map::new();
            attrs.insert(field::HARDWARE.to_owned(), json!(resources.option.as_str()));
            if let Some(qos) = resources.qos {
                attrs.insert(field::QOS.to_owned(), json!(qos.as_str()));
            }
            attrs.insert(
                field::TIME_SUBMITTED.to_owned(),
                json!(Local::now().format(DT_FMT).to_string()),
            );
            attrs.insert(field::CONFIG_HASH.to_owned(), json!(config_hash));
            attrs.insert(
                field::RESOURCES.to_owned(),
                serde_json::to_value(&resources).map_err(ConfigError::Json)?,
            );

            if resources.option.is_hpc() {
                let outcome = backend
                    .submit(&request)
                    .map_err(|source| DispatchError::Submit {
                        job: job_name.clone(),
                        source,
                    })?;
                if let Some(job_id) = outcome.job_id {
                    attrs.insert(field::JOB_ID.to_owned(), json!(job_id));
                    attrs.insert(
                        field::STDOUT_LOG.to_owned(),
                        json!(format!("{}/{job_name}_{job_id}.o", stdout_dir.display())),
                    );
                    attrs.insert(
                        field::STDOUT_ERR_LOG.to_owned(),
                        json!(format!("{}/{job_name}_{job_id}.e", stdout_dir.display())),
                    );
                }
                StatusStore::mark_submitted(&self.project_dir, &self.step, &job_name, true, attrs)?;
                info!(step = %self.step, job = %job_name, "Kicked off job");
            } else {
                // the local child runs synchronously, so the submitted
                // record must land before the run starts
                StatusStore::mark_submitted(&self.project_dir, &self.step, &job_name, true, attrs)?;
                backend
                    .submit(&request)
                    .map_err(|source| DispatchError::Submit {
                        job: job_name.clone(),
                        source,
                    })?;
            }

            submitted += 1;
            job_names.push(job_name);
        }

        info!(
            step = %self.step,
            submitted,
            skipped,
            "Dispatch complete"
        );

        Ok(DispatchOutcome {
            step: self.step.clone(),
            submitted,
            skipped,
            job_names,
        })
    }

    fn build_axes(
        &self,
        entry: &EntryPoint,
        config: &Config,
        resources: &ExecutionControl,
    ) -> Result<Vec<Vec<TaskSlice>>, DispatchError> {
        let mut axes = Vec::new();

        for split in &entry.split_keys {
            match split {
                SplitKey::Scalar(key) if key.as_str() == PROJECT_POINTS_KEY => {
                    let value = config.get(key.as_str()).ok_or_else(|| {
                        DispatchError::MissingSplitKey {
                            step: self.step.clone(),
                            key: key.to_string(),
                        }
                    })?;
                    let table = SiteTable::parse(value)?;
                    let nodes = resources.nodes.unwrap_or(1).max(1) as usize;
                    let chunks = table.split(nodes);
                    let width = chunks.len().saturating_sub(1).to_string().len();

                    axes.push(
                        chunks
                            .into_iter()
                            .enumerate()
                            .map(|(index, chunk)| TaskSlice {
                                fragment: format!("_j{index:0width$}"),
                                assignments: vec![(key.to_string(), chunk.to_value())],
                            })
                            .collect(),
                    );
                }
                SplitKey::Scalar(key) => {
                    let values = self.split_values(config, key.as_str())?;
                    axes.push(
                        values
                            .iter()
                            .map(|value| TaskSlice {
                                fragment: format!("_{}{}", abbrev(key), value_fragment(value)),
                                assignments: vec![(key.to_string(), value.clone())],
                            })
                            .collect(),
                    );
                }
                SplitKey::Zipped(keys) => {
                    let lists: Vec<(&str, &Vec<Value>)> = keys
                        .iter()
                        .map(|key| self.split_values(config, key.as_str()).map(|list| (key.as_str(), list)))
                        .collect::<Result<_, _>>()?;

                    let lengths: Vec<usize> = lists.iter().map(|(_, list)| list.len()).collect();
                    if lengths.windows(2).any(|pair| pair[0] != pair[1]) {
                        return Err(DispatchError::ZippedLengthMismatch {
                            step: self.step.clone(),
                            keys: keys.iter().map(|key| key.to_string()).collect(),
                            lengths,
                        });
                    }

                    axes.push(
                        (0..lengths[0])
                            .map(|index| TaskSlice {
                                fragment: lists
                                    .iter()
                                    .map(|(key, list)| {
                                        format!("_{}{}", abbrev(key), value_fragment(&list[index]))
                                    })
                                    .collect(),
                                assignments: lists
                                    .iter()
                                    .map(|(key, list)| ((*key).to_owned(), list[index].clone()))
                                    .collect(),
                            })
                            .collect(),
                    );
                }
            }
        }

        Ok(axes)
    }

    fn split_values<'c>(
        &self,
        config: &'c Config,
        key: &str,
    ) -> Result<&'c Vec<Value>, DispatchError> {
        let value = config
            .get(key)
            .ok_or_else(|| DispatchError::MissingSplitKey {
                step: self.step.clone(),
                key: key.to_owned(),
            })?;
        let values = value
            .as_array()
            .ok_or_else(|| DispatchError::SplitKeyNotAList {
                step: self.step.clone(),
                key: key.to_owned(),
            })?;
        if values.is_empty() {
            return Err(DispatchError::EmptySplitKey {
                step: self.step.clone(),
                key: key.to_owned(),
            });
        }
        Ok(values)
    }

    fn tag_tasks(&self, tasks: &[Vec<&TaskSlice>]) -> Result<Vec<String>, DispatchError> {
        // a single task gets the empty tag so lone jobs keep clean names
        if tasks.len() == 1 {
            return Ok(vec![String::new()]);
        }

        let mut seen = BTreeSet::new();
        let mut tags = Vec::with_capacity(tasks.len());
        for slices in tasks {
            let tag: String = slices.iter().map(|slice| slice.fragment.as_str()).collect();
            if !seen.insert(tag.clone()) {
                return Err(DispatchError::DuplicateTag {
                    step: self.step.clone(),
                    tag,
                });
            }
            tags.push(tag);
        }

        Ok(tags)
    }

    /// Clone the step config, pin this task's split-key slices, and persist
    /// the result next to the step config. Returns the path and the config
    /// hash used for change detection.
    fn materialize(
        &self,
        base: &Config,
        entry: &EntryPoint,
        resources: &ExecutionControl,
        exec_extras: &[(String, Value)],
        slices: &[&TaskSlice],
        tag: &str,
        job_name: &str,
    ) -> Result<(PathBuf, String), DispatchError> {
        let mut task_config = base.clone();
        for slice in slices {
            for (key, value) in &slice.assignments {
                task_config.insert(key.clone(), value.clone());
            }
        }

        for (key, value) in exec_extras {
            task_config.insert(key.clone(), value.clone());
        }
        if let Some(max_workers) = resources.max_workers {
            task_config.insert("max_workers".to_owned(), json!(max_workers));
        }
        if let Some(sites_per_worker) = resources.sites_per_worker {
            task_config.insert("sites_per_worker".to_owned(), json!(sites_per_worker));
        }
        if entry.accepts_tag {
            task_config.insert("tag".to_owned(), json!(tag));
        }

        let canonical = serde_json::to_string(&Value::Object(task_config.clone()))
            .map_err(ConfigError::Json)?;
        let config_hash = blake3::hash(canonical.as_bytes()).to_hex().to_string();

        task_config.insert(
            TASK_KEY.to_owned(),
            json!({
                task_field::JOB_NAME: job_name,
                task_field::PIPELINE_STEP: self.step,
                task_field::COMMAND_NAME: self.command,
                task_field::TAG: tag,
                task_field::PROJECT_DIR: self.project_dir.to_string_lossy(),
            }),
        );

        let stem = self
            .config_path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "config".to_owned());
        let extension = ConfigFormat::from_path(&self.config_path)?.extension();
        let task_config_path = self
            .project_dir
            .join(format!("{stem}{tag}.task.{extension}"));

        config::dump_config(&task_config_path, &Value::Object(task_config))?;
        Ok((task_config_path, config_hash))
    }

    /// The dedupe rule: skip successful tasks with unchanged inputs and
    /// tasks the scheduler still reports live; everything else submits.
    fn should_submit(
        &self,
        store: &mut StatusStore,
        backend: &mut Backend,
        job_name: &str,
        config_hash: &str,
    ) -> Result<bool, DispatchError> {
        match store.task_state(&self.step, job_name) {
            TaskState::Successful => {
                let stored = store
                    .task_field(&self.step, job_name, field::CONFIG_HASH)
                    .and_then(Value::as_str);
                if let Some(stored) = stored {
                    if stored != config_hash {
                        return Err(DispatchError::ConfigChanged {
                            job: job_name.to_owned(),
                        });
                    }
                }
                info!(job = %job_name, "Job is successful, not re-running");
                Ok(false)
            }
            TaskState::Submitted | TaskState::Running => {
                let live = store
                    .task_field(&self.step, job_name, field::JOB_ID)
                    .and_then(Value::as_u64)
                    .map(|job_id| backend.query(job_id).is_live())
                    .unwrap_or(false);
                if live {
                    info!(job = %job_name, "Job is already in the queue, not resubmitting");
                    Ok(false)
                } else {
                    Ok(true)
                }
            }
            TaskState::Failed | TaskState::NotSubmitted => Ok(true),
        }
    }
}

fn enumerate_tasks(axes: &[Vec<TaskSlice>]) -> Vec<Vec<&TaskSlice>> {
    // no split keys: one task covering the whole step
    if axes.is_empty() {
        return vec![Vec::new()];
    }

    axes.iter()
        .map(|axis| axis.iter())
        .multi_cartesian_product()
        .collect()
}

pub(crate) fn program_name() -> String {
    if let Ok(program) = std::env::var(PROGRAM_ENV) {
        return program;
    }
    std::env::current_exe()
        .map(|path| path.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "geoflow".to_owned())
}

/// Shorten a split key for use in a tag fragment: underscores go, and so
/// do vowels everywhere but the leading character.
pub(crate) fn abbrev(key: &str) -> String {
    key.chars()
        .enumerate()
        .filter(|(index, ch)| {
            *ch != '_' && (*index == 0 || !matches!(ch, 'a' | 'e' | 'i' | 'o' | 'u'))
        })
        .map(|(_, ch)| ch)
        .collect()
}

/// Render a split-key value as a filesystem-safe tag fragment. Numbers
/// lose their decimal point; strings keep only benign characters.
pub(crate) fn value_fragment(value: &Value) -> String {
    match value {
        Value::Number(number) => number.to_string().replace('.', ""),
        Value::String(text) => text
            .chars()
            .filter(|ch| ch.is_ascii_alphanumeric() || *ch == '-')
            .collect(),
        Value::Bool(flag) => flag.to_string(),
        other => other
            .to_string()
            .chars()
            .filter(char::is_ascii_alphanumeric)
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::RunContext;

    fn noop(_: &Config, _: &RunContext<'_>) -> anyhow::Result<Option<PathBuf>> {
        Ok(None)
    }

    fn dispatcher<'a>(
        registry: &'a CommandRegistry,
        dir: &Path,
        config: &Value,
    ) -> StepDispatcher<'a> {
        let config_path = dir.join("config_run.json");
        fs::write(&config_path, serde_json::to_string_pretty(config).unwrap()).unwrap();
        StepDispatcher::new(registry, "run", None, &config_path, false).unwrap()
    }

    fn slices_of(axes: &[Vec<TaskSlice>]) -> Vec<String> {
        enumerate_tasks(axes)
            .iter()
            .map(|slices| slices.iter().map(|slice| slice.fragment.as_str()).collect())
            .collect()
    }

    #[test]
    fn abbrev_drops_underscores_and_inner_vowels() {
        assert_eq!(abbrev("a"), "a");
        assert_eq!(abbrev("years"), "yrs");
        assert_eq!(abbrev("turbine_height"), "trbnhght");
        assert_eq!(abbrev("elevation"), "elvtn");
    }

    #[test]
    fn value_fragments_are_filesystem_safe() {
        assert_eq!(value_fragment(&json!(1)), "1");
        assert_eq!(value_fragment(&json!(0.5)), "05");
        assert_eq!(value_fragment(&json!(-2)), "-2");
        assert_eq!(value_fragment(&json!("batch-h")), "batch-h");
        assert_eq!(value_fragment(&json!("a b/c")), "abc");
    }

    #[test]
    fn zipped_tuple_produces_lockstep_tags() {
        let mut registry = CommandRegistry::new();
        registry.register(crate::command::EntryPoint::new("run", noop).with_zipped_keys(&["a", "b"]));
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = dispatcher(
            &registry,
            dir.path(),
            &json!({"a": [1, 2, 3], "b": [4, 5, 6]}),
        );

        let entry = registry.get("run").unwrap();
        let config = config::load_config(&dispatcher.config_path).unwrap();
        let axes = dispatcher
            .build_axes(entry, &config, &ExecutionControl::default())
            .unwrap();

        assert_eq!(slices_of(&axes), vec!["_a1_b4", "_a2_b5", "_a3_b6"]);
    }

    #[test]
    fn product_keys_cover_the_full_cross() {
        let mut registry = CommandRegistry::new();
        registry.register(
            crate::command::EntryPoint::new("run", noop)
                .with_split_key("a")
                .with_split_key("b"),
        );
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = dispatcher(&registry, dir.path(), &json!({"a": [1, 2, 3], "b": [4, 5]}));

        let entry = registry.get("run").unwrap();
        let config = config::load_config(&dispatcher.config_path).unwrap();
        let axes = dispatcher
            .build_axes(entry, &config, &ExecutionControl::default())
            .unwrap();

        let tags = slices_of(&axes);
        assert_eq!(tags.len(), 6);
        assert_eq!(tags[0], "_a1_b4");
        assert_eq!(tags[5], "_a3_b5");
        assert_eq!(tags.iter().collect::<BTreeSet<_>>().len(), 6);
    }

    #[test]
    fn points_axis_delegates_to_the_partitioner() {
        let mut registry = CommandRegistry::new();
        registry.register(crate::command::EntryPoint::new("run", noop).with_split_key("project_points"));
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = dispatcher(
            &registry,
            dir.path(),
            &json!({
                "project_points": {"start": 0, "stop": 10},
                "execution_control": {"option": "local", "nodes": 3}
            }),
        );

        let entry = registry.get("run").unwrap();
        let mut config = config::load_config(&dispatcher.config_path).unwrap();
        let resources = ExecutionControl::from_config(&mut config).unwrap();
        let axes = dispatcher.build_axes(entry, &config, &resources).unwrap();

        assert_eq!(slices_of(&axes), vec!["_j0", "_j1", "_j2"]);
        assert_eq!(axes[0][0].assignments[0].1, json!([0, 1, 2, 3]));
        assert_eq!(axes[0][2].assignments[0].1, json!([7, 8, 9]));
    }

    #[test]
    fn zipped_length_mismatch_is_rejected() {
        let mut registry = CommandRegistry::new();
        registry.register(crate::command::EntryPoint::new("run", noop).with_zipped_keys(&["a", "b"]));
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = dispatcher(&registry, dir.path(), &json!({"a": [1, 2], "b": [4]}));

        let entry = registry.get("run").unwrap();
        let config = config::load_config(&dispatcher.config_path).unwrap();
        let err = dispatcher
            .build_axes(entry, &config, &ExecutionControl::default())
            .unwrap_err();
        assert!(matches!(err, DispatchError::ZippedLengthMismatch { .. }));
    }

    #[test]
    fn non_sequence_and_empty_split_keys_are_rejected() {
        let mut registry = CommandRegistry::new();
        registry.register(crate::command::EntryPoint::new("run", noop).with_split_key("years"));
        let dir = tempfile::tempdir().unwrap();

        let dispatcher_bad = dispatcher(&registry, dir.path(), &json!({"years": 2007}));
        let entry = registry.get("run").unwrap();
        let config = config::load_config(&dispatcher_bad.config_path).unwrap();
        let err = dispatcher_bad
            .build_axes(entry, &config, &ExecutionControl::default())
            .unwrap_err();
        assert!(matches!(err, DispatchError::SplitKeyNotAList { .. }));

        let dispatcher_empty = dispatcher(&registry, dir.path(), &json!({"years": []}));
        let config = config::load_config(&dispatcher_empty.config_path).unwrap();
        let err = dispatcher_empty
            .build_axes(entry, &config, &ExecutionControl::default())
            .unwrap_err();
        assert!(matches!(err, DispatchError::EmptySplitKey { .. }));
    }

    #[test]
    fn single_task_gets_the_empty_tag() {
        let mut registry = CommandRegistry::new();
        registry.register(crate::command::EntryPoint::new("run", noop));
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = dispatcher(&registry, dir.path(), &json!({"years": [2007]}));

        let axes: Vec<Vec<TaskSlice>> = Vec::new();
        let tasks = enumerate_tasks(&axes);
        assert_eq!(tasks.len(), 1);
        assert_eq!(dispatcher.tag_tasks(&tasks).unwrap(), vec![""]);
    }

    #[test]
    fn materialized_task_config_pins_slices() {
        let mut registry = CommandRegistry::new();
        registry.register(
            crate::command::EntryPoint::new("run", noop)
                .with_zipped_keys(&["a", "b"])
                .accepts_tag(),
        );
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = dispatcher(
            &registry,
            dir.path(),
            &json!({"a": [1, 2], "b": [4, 5], "other": "kept"}),
        );

        let entry = registry.get("run").unwrap();
        let config = config::load_config(&dispatcher.config_path).unwrap();
        let axes = dispatcher
            .build_axes(entry, &config, &ExecutionControl::default())
            .unwrap();
        let tasks = enumerate_tasks(&axes);

        let (path, hash_first) = dispatcher
            .materialize(
                &config,
                entry,
                &ExecutionControl::default(),
                &[],
                &tasks[0],
                "_a1_b4",
                "proj_run_a1_b4",
            )
            .unwrap();

        assert!(path.file_name().unwrap().to_string_lossy().ends_with("_a1_b4.task.json"));
        let task_config = config::load_config(&path).unwrap();
        assert_eq!(task_config["a"], json!(1));
        assert_eq!(task_config["b"], json!(4));
        assert_eq!(task_config["other"], json!("kept"));
        assert_eq!(task_config["tag"], json!("_a1_b4"));
        assert_eq!(task_config[TASK_KEY][task_field::PIPELINE_STEP], json!("run"));

        // a different slice hashes differently; the same slice is stable
        let (_, hash_second) = dispatcher
            .materialize(
                &config,
                entry,
                &ExecutionControl::default(),
                &[],
                &tasks[1],
                "_a2_b5",
                "proj_run_a2_b5",
            )
            .unwrap();
        let (_, hash_again) = dispatcher
            .materialize(
                &config,
                entry,
                &ExecutionControl::default(),
                &[],
                &tasks[0],
                "_a1_b4",
                "proj_run_a1_b4",
            )
            .unwrap();
        assert_ne!(hash_first, hash_second);
        assert_eq!(hash_first, hash_again);
    }
}
