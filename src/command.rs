//! Entry-point descriptors: the contract between user compute code and the
//! driver. Each entry point declares its command name, split keys, and hooks
//! up front; no signature introspection happens anywhere.

use crate::{
    config::{self, Config, ConfigError},
    status::{RunHandle, StatusError},
};
use cowstr::CowStr;
use serde_json::{Map, Value};
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, info};

/// Reserved top-level key in task configs holding platform bookkeeping.
/// Its presence marks a config as a derived task config rather than a
/// user-written step config.
pub const TASK_KEY: &str = "task";

/// Keys inside the [`TASK_KEY`] block.
pub mod task_field {
    pub const JOB_NAME: &str = "job_name";
    pub const PIPELINE_STEP: &str = "pipeline_step";
    pub const COMMAND_NAME: &str = "command_name";
    pub const TAG: &str = "tag";
    pub const PROJECT_DIR: &str = "project_dir";
}

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("Command {requested:?} is not registered; available commands are: {available:?}")]
    Unknown {
        requested: String,
        available: Vec<String>,
    },
    #[error("Config pre-processor for {0:?} failed: {1:#}")]
    Preprocess(String, #[source] anyhow::Error),
    #[error("Entry point {0:?} failed: {1:#}")]
    Run(String, #[source] anyhow::Error),
    #[error("Config file {0} is not a task config (missing the task block)")]
    NotATaskConfig(PathBuf),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Status(#[from] StatusError),
}

/// A split key declaration: either one key whose sequence fans out on its
/// own axis, or a group of keys advanced together in lock-step.
#[derive(Debug, Clone)]
pub enum SplitKey {
    Scalar(CowStr),
    Zipped(Vec<CowStr>),
}

impl SplitKey {
    pub fn keys(&self) -> Vec<&str> {
        match self {
            Self::Scalar(key) => vec![key.as_str()],
            Self::Zipped(keys) => keys.iter().map(CowStr::as_str).collect(),
        }
    }
}

/// Platform-supplied parameters handed to a config pre-processor.
#[derive(Debug, Clone)]
pub struct PreprocessContext<'a> {
    pub step: &'a str,
    pub command: &'a str,
    pub job_name: &'a str,
    pub project_dir: &'a Path,
    pub config_path: &'a Path,
    pub log_directory: &'a Path,
    pub verbose: bool,
}

/// Platform-supplied parameters handed to a run function on the node.
#[derive(Debug, Clone)]
pub struct RunContext<'a> {
    pub step: &'a str,
    pub job_name: &'a str,
    pub tag: &'a str,
    pub project_dir: &'a Path,
}

/// Pre-processors run in the driver process before any submission and may
/// mutate the step config in place.
pub type Preprocessor = fn(&mut Config, &PreprocessContext<'_>) -> anyhow::Result<()>;

/// Run functions execute on the node and return an optional output
/// artifact path for the status record.
pub type Runner = fn(&Config, &RunContext<'_>) -> anyhow::Result<Option<PathBuf>>;

/// Descriptor for one registered compute entry point.
pub struct EntryPoint {
    pub name: CowStr,
    pub split_keys: Vec<SplitKey>,
    pub preprocessor: Option<Preprocessor>,
    pub runner: Runner,
    /// Inject the task tag into the task config under `"tag"`.
    pub accepts_tag: bool,
    /// Extra `execution_control` keys this entry point understands; they
    /// are lifted out of the block and passed through in the task config.
    pub exec_extensions: Vec<CowStr>,
    /// Step-specific keys merged into generated template configs.
    pub template_defaults: Config,
}

impl std::fmt::Debug for EntryPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryPoint")
            .field("name", &self.name)
            .field("split_keys", &self.split_keys)
            .field("accepts_tag", &self.accepts_tag)
            .finish_non_exhaustive()
    }
}

impl EntryPoint {
    pub fn new(name: &str, runner: Runner) -> Self {
        Self {
            name: CowStr::from(name),
            split_keys: Vec::new(),
            preprocessor: None,
            runner,
            accepts_tag: false,
            exec_extensions: Vec::new(),
            template_defaults: Config::new(),
        }
    }

    pub fn with_split_key(mut self, key: &str) -> Self {
        self.split_keys.push(SplitKey::Scalar(CowStr::from(key)));
        self
    }

    pub fn with_zipped_keys(mut self, keys: &[&str]) -> Self {
        self.split_keys
            .push(SplitKey::Zipped(keys.iter().copied().map(CowStr::from).collect()));
        self
    }

    pub fn with_preprocessor(mut self, preprocessor: Preprocessor) -> Self {
        self.preprocessor = Some(preprocessor);
        self
    }

    pub fn accepts_tag(mut self) -> Self {
        self.accepts_tag = true;
        self
    }

    pub fn with_exec_extension(mut self, key: &str) -> Self {
        self.exec_extensions.push(CowStr::from(key));
        self
    }

    pub fn with_template_defaults(mut self, defaults: Config) -> Self {
        self.template_defaults = defaults;
        self
    }

    /// `true` if `project_points` appears among the declared split keys.
    pub fn is_split_spatially(&self) -> bool {
        self.split_keys
            .iter()
            .any(|split| split.keys().contains(&crate::dispatch::PROJECT_POINTS_KEY))
    }
}

/// The set of registered entry points, keyed by command name.
#[derive(Debug, Default)]
pub struct CommandRegistry {
    commands: BTreeMap<CowStr, EntryPoint>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, entry: EntryPoint) -> &mut Self {
        self.commands.insert(entry.name.clone(), entry);
        self
    }

    pub fn get(&self, name: &str) -> Result<&EntryPoint, CommandError> {
        self.commands
            .get(name)
            .ok_or_else(|| CommandError::Unknown {
                requested: name.to_owned(),
                available: self.names(),
            })
    }

    pub fn names(&self) -> Vec<String> {
        self.commands.keys().map(|name| name.to_string()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &EntryPoint> {
        self.commands.values()
    }
}

/// Node-side execution of one task config: resolve the entry point, wrap
/// the run function in a status guard, and always leave a terminal record.
pub fn execute_task(
    registry: &CommandRegistry,
    alias: &str,
    config_path: &Path,
    verbose: bool,
) -> Result<(), CommandError> {
    let config = config::load_config(config_path)?;
    execute_task_config(registry, alias, config_path, config, verbose)
}

pub fn execute_task_config(
    registry: &CommandRegistry,
    alias: &str,
    config_path: &Path,
    mut config: Config,
    verbose: bool,
) -> Result<(), CommandError> {
    let Some(task_block) = config.remove(TASK_KEY) else {
        return Err(CommandError::NotATaskConfig(config_path.to_path_buf()));
    };
    let task_block = task_block.as_object().cloned().unwrap_or_default();

    let get = |key: &str, fallback: &str| -> String {
        task_block
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or(fallback)
            .to_owned()
    };

    let command = get(task_field::COMMAND_NAME, alias);
    let step = get(task_field::PIPELINE_STEP, alias);
    let tag = get(task_field::TAG, "");
    let job_name = get(task_field::JOB_NAME, &format!("{step}{tag}"));
    let project_dir = task_block
        .get(task_field::PROJECT_DIR)
        .and_then(Value::as_str)
        .map(PathBuf::from)
        .or_else(|| config_path.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."));

    let entry = registry.get(&command)?;

    info!(
        step = %step,
        job = %job_name,
        command = %command,
        "Executing task from config file {}",
        config_path.display()
    );
    if verbose {
        let task_config_value = Value::Object(config.clone());
        debug!("Task config: {}", task_config_value);
    }

    let attrs = status_attrs(&config);
    let handle = RunHandle::begin(&project_dir, &step, &job_name, attrs)?;

    let context = RunContext {
        step: &step,
        job_name: &job_name,
        tag: &tag,
        project_dir: &project_dir,
    };

    match (entry.runner)(&config, &context) {
        Ok(out_file) => {
            handle.finish(out_file.as_deref());
            Ok(())
        }
        Err(error) => {
            handle.fail(&format!("{error:#}"));
            Err(CommandError::Run(command, error))
        }
    }
}

/// Keys excluded from the attributes written into the status record. Large
/// inputs have no business in a status file.
const STATUS_EXCLUDE_KEY: &str = "exclude_from_status";

fn status_attrs(config: &Config) -> Map<String, Value> {
    let mut exclude: Vec<String> = vec![crate::dispatch::PROJECT_POINTS_KEY.to_owned()];
    if let Some(extra) = config.get(STATUS_EXCLUDE_KEY).and_then(Value::as_array) {
        exclude.extend(
            extra
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_ascii_lowercase),
        );
    }

    config
        .iter()
        .filter(|(key, _)| {
            let key = key.to_ascii_lowercase();
            key != STATUS_EXCLUDE_KEY && !exclude.contains(&key)
        })
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Built-in entry point that runs shell commands as a pipeline step. Each
/// element of the `cmd` list becomes its own task.
pub fn builtin_script() -> EntryPoint {
    EntryPoint::new("script", run_script).with_split_key("cmd")
}

fn run_script(config: &Config, context: &RunContext<'_>) -> anyhow::Result<Option<PathBuf>> {
    let cmd = config
        .get("cmd")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow::anyhow!("script step requires a \"cmd\" string"))?;

    info!(job = %context.job_name, "Running script command: {cmd}");
    let output = std::process::Command::new("sh")
        .arg("-c")
        .arg(cmd)
        .current_dir(context.project_dir)
        .output()?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    if !stdout.trim().is_empty() {
        info!("Script stdout:\n{stdout}");
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.trim().is_empty() {
        tracing::warn!("Script stderr:\n{stderr}");
    }

    if !output.status.success() {
        anyhow::bail!("script command exited with status {}", output.status);
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn noop(_: &Config, _: &RunContext<'_>) -> anyhow::Result<Option<PathBuf>> {
        Ok(None)
    }

    #[test]
    fn registry_lookup_and_error() {
        let mut registry = CommandRegistry::new();
        registry.register(EntryPoint::new("run", noop).with_split_key("years"));
        registry.register(builtin_script());

        assert!(registry.get("run").is_ok());
        let err = registry.get("collect").unwrap_err();
        let message = err.to_string();
        assert!(message.contains("collect"));
        assert!(message.contains("run") && message.contains("script"));
    }

    #[test]
    fn spatial_split_detection() {
        let entry = EntryPoint::new("run", noop)
            .with_split_key("project_points")
            .with_zipped_keys(&["a", "b"]);
        assert!(entry.is_split_spatially());

        let entry = EntryPoint::new("run", noop).with_split_key("years");
        assert!(!entry.is_split_spatially());
    }

    #[test]
    fn status_attrs_exclude_points_and_requested_keys() {
        let config: Config = serde_json::from_value(json!({
            "project_points": [0, 1, 2],
            "years": [2007],
            "secret_input": "big blob",
            "exclude_from_status": ["secret_input"]
        }))
        .unwrap();

        let attrs = status_attrs(&config);
        assert!(attrs.contains_key("years"));
        assert!(!attrs.contains_key("project_points"));
        assert!(!attrs.contains_key("secret_input"));
        assert!(!attrs.contains_key("exclude_from_status"));
    }

    #[test]
    fn execute_task_requires_task_block() {
        let registry = CommandRegistry::new();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config_run.json");
        std::fs::write(&path, "{\"years\": [2007]}").unwrap();

        let err = execute_task(&registry, "run", &path, false).unwrap_err();
        assert!(matches!(err, CommandError::NotATaskConfig(_)));
    }
}
