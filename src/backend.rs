//! Uniform interface over cluster schedulers and local subprocess execution.

pub mod local;
pub mod pbs;
pub mod slurm;

use crate::config::Config;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    fmt,
    fs,
    io,
    path::{Path, PathBuf},
    process::{Command, Stdio},
};
use thiserror::Error;
use tracing::{debug, warn};

use local::LocalBackend;
use pbs::PbsManager;
use slurm::SlurmManager;

/// Default directory for .stdout and .stderr files, relative to the project.
pub const DEFAULT_STDOUT_DIR: &str = "./stdout";

/// Schedulers reject names longer than this; fail before they do.
pub const MAX_JOB_NAME_LEN: usize = 100;

static USER: Lazy<String> =
    Lazy::new(|| std::env::var("USER").unwrap_or_else(|_| "unknown".into()));

#[derive(Error, Debug)]
pub enum SubmitError {
    #[error("Failed to spawn subprocess {0:?}")]
    Spawn(String, #[source] io::Error),
    #[error("Submission failed with exit code {code} and stderr:\n{stderr}")]
    Rejected { code: i32, stderr: String },
    #[error("Cannot submit job with name longer than {MAX_JOB_NAME_LEN} chars: {0:?}")]
    NameTooLong(String),
    #[error("Execution option {0:?} not recognized; available options are: local, slurm, pbs")]
    UnknownScheduler(String),
    #[error("Invalid execution_control block")]
    BadResources(#[source] serde_json::Error),
    #[error("The execution_control block is missing required key {0:?}")]
    MissingResource(&'static str),
    #[error("Failed to write submission script {0}")]
    Script(PathBuf, #[source] io::Error),
    #[error("Could not parse a job id from scheduler output {0:?}")]
    NoJobId(String),
}

/// The closed set of submission targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerKind {
    #[default]
    Local,
    Slurm,
    Pbs,
}

impl SchedulerKind {
    pub fn is_hpc(self) -> bool {
        !matches!(self, Self::Local)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Slurm => "slurm",
            Self::Pbs => "pbs",
        }
    }

    pub fn from_option(option: &str) -> Result<Self, SubmitError> {
        match option.to_ascii_lowercase().trim() {
            "local" => Ok(Self::Local),
            "slurm" => Ok(Self::Slurm),
            "pbs" => Ok(Self::Pbs),
            other => Err(SubmitError::UnknownScheduler(other.to_owned())),
        }
    }
}

impl fmt::Display for SchedulerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Quality-of-service values accepted by the categorical schedulers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum QosOption {
    Normal,
    High,
    Standby,
    #[default]
    Unspecified,
}

impl QosOption {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::High => "high",
            Self::Standby => "standby",
            Self::Unspecified => "unspecified",
        }
    }
}

impl fmt::Display for QosOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the scheduler queue currently reports for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Queued,
    Running,
    Unknown,
}

impl QueueState {
    pub fn is_live(self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Option<Vec<String>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        None => None,
        Some(OneOrMany::One(module)) => Some(vec![module]),
        Some(OneOrMany::Many(modules)) => Some(modules),
    })
}

/// The `execution_control` block of a step config. Keys that no backend
/// recognizes fail fast at parse time.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ExecutionControl {
    #[serde(default)]
    pub option: SchedulerKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocation: Option<String>,
    /// Walltime request in hours; fractional values are allowed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub walltime: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qos: Option<QosOption>,
    /// Node memory request in GB.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<u64>,
    /// Number of nodes to split `project_points` across. Consumed by the
    /// dispatcher, never passed to the scheduler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conda_env: Option<String>,
    #[serde(
        default,
        deserialize_with = "one_or_many",
        skip_serializing_if = "Option::is_none"
    )]
    pub module: Option<Vec<String>>,
    /// Extra shell commands to run before the command line.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sh_script: Option<String>,
    /// Passed through to user code in the task config.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_workers: Option<u64>,
    /// Passed through to user code in the task config.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sites_per_worker: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout_path: Option<String>,
}

/// Keys users sometimes leave at the top level of a step config even though
/// they belong inside `execution_control`.
const STRAY_EXEC_KEYS: [&str; 2] = ["max_workers", "sites_per_worker"];

impl ExecutionControl {
    /// Extract the `execution_control` block from a step config, folding in
    /// stray top-level execution keys with a warning.
    pub fn from_config(config: &mut Config) -> Result<Self, SubmitError> {
        let mut block = match config.remove("execution_control") {
            Some(value) => value,
            None => Value::Object(Default::default()),
        };

        for key in STRAY_EXEC_KEYS {
            if let Some(value) = config.remove(key) {
                warn!(
                    key,
                    "Found execution key outside of the execution_control block; moving it inside"
                );
                if let Value::Object(mapping) = &mut block {
                    mapping.entry(key).or_insert(value);
                }
            }
        }

        serde_json::from_value(block).map_err(SubmitError::BadResources)
    }

    pub fn stdout_dir(&self, log_directory: &Path) -> PathBuf {
        match &self.stdout_path {
            Some(path) => PathBuf::from(path),
            None => log_directory.join("stdout"),
        }
    }

    fn require_allocation(&self) -> Result<&str, SubmitError> {
        self.allocation
            .as_deref()
            .ok_or(SubmitError::MissingResource("allocation"))
    }

    fn require_walltime(&self) -> Result<f64, SubmitError> {
        self.walltime.ok_or(SubmitError::MissingResource("walltime"))
    }
}

/// Everything a backend needs to know to submit one task.
#[derive(Debug, Clone)]
pub struct SubmitRequest<'a> {
    /// Unique job name; also names the submission script and stdout files.
    pub name: &'a str,
    /// Full command line executed on the node.
    pub cmd: &'a str,
    /// Working directory for the job.
    pub project_dir: &'a Path,
    pub stdout_dir: &'a Path,
    pub resources: &'a ExecutionControl,
}

/// A scheduler-assigned job id; `None` for synchronous local runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitOutcome {
    pub job_id: Option<u64>,
}

/// Polymorphic submission backend. Variants are a closed set; adding a
/// scheduler means adding a variant here and a manager module next to the
/// existing ones.
#[derive(Debug)]
pub enum Backend {
    Local(LocalBackend),
    Slurm(SlurmManager),
    Pbs(PbsManager),
}

impl Backend {
    pub fn new(kind: SchedulerKind) -> Self {
        match kind {
            SchedulerKind::Local => Self::Local(LocalBackend::default()),
            SchedulerKind::Slurm => Self::Slurm(SlurmManager::new(&USER)),
            SchedulerKind::Pbs => Self::Pbs(PbsManager::new(&USER)),
        }
    }

    pub fn kind(&self) -> SchedulerKind {
        match self {
            Self::Local(_) => SchedulerKind::Local,
            Self::Slurm(_) => SchedulerKind::Slurm,
            Self::Pbs(_) => SchedulerKind::Pbs,
        }
    }

    /// Submit one job. Returns once the scheduler has accepted it (or, for
    /// the local variant, once the child process has finished).
    pub fn submit(&mut self, request: &SubmitRequest<'_>) -> Result<SubmitOutcome, SubmitError> {
        if request.name.len() > MAX_JOB_NAME_LEN {
            return Err(SubmitError::NameTooLong(request.name.to_owned()));
        }

        match self {
            Self::Local(backend) => backend.submit(request),
            Self::Slurm(manager) => manager.submit(request),
            Self::Pbs(manager) => manager.submit(request),
        }
    }

    /// Check what the scheduler queue reports for a job id.
    pub fn query(&mut self, job_id: u64) -> QueueState {
        match self {
            Self::Local(_) => QueueState::Unknown,
            Self::Slurm(manager) => manager.check_job(job_id),
            Self::Pbs(manager) => manager.check_job(job_id),
        }
    }

    /// Best-effort cancellation by job id.
    pub fn cancel(&mut self, job_id: u64) -> Result<(), SubmitError> {
        match self {
            Self::Local(_) => Ok(()),
            Self::Slurm(manager) => manager.cancel(job_id),
            Self::Pbs(manager) => manager.cancel(job_id),
        }
    }

    /// Drop the cached queue snapshot so the next query hits the scheduler.
    pub fn reset_query_cache(&mut self) {
        match self {
            Self::Local(_) => {}
            Self::Slurm(manager) => manager.reset_query_cache(),
            Self::Pbs(manager) => manager.reset_query_cache(),
        }
    }
}

/// Lazily-created backends for queue probing across heterogeneous jobs,
/// e.g. when reconciling a status store that mixes local and SLURM entries.
#[derive(Debug, Default)]
pub struct QueueProbe {
    slurm: Option<SlurmManager>,
    pbs: Option<PbsManager>,
}

impl QueueProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn query(&mut self, kind: SchedulerKind, job_id: u64) -> QueueState {
        match kind {
            SchedulerKind::Local => QueueState::Unknown,
            SchedulerKind::Slurm => self
                .slurm
                .get_or_insert_with(|| SlurmManager::new(&USER))
                .check_job(job_id),
            SchedulerKind::Pbs => self
                .pbs
                .get_or_insert_with(|| PbsManager::new(&USER))
                .check_job(job_id),
        }
    }
}

/// Format a fractional-hours walltime request as `HH:MM:SS`.
pub fn format_walltime(hours: f64) -> String {
    let minutes = (60.0 * hours.fract()).round() as u64;
    format!("{:02}:{minutes:02}:00", hours.trunc() as u64)
}

/// Shell lines that activate the requested environment, if any.
pub fn format_env(resources: &ExecutionControl) -> Vec<String> {
    let mut lines = Vec::new();
    for module in resources.module.iter().flatten() {
        lines.push(format!("module load {module}"));
    }
    if let Some(conda_env) = &resources.conda_env {
        lines.push(format!("echo source activate {conda_env}"));
        lines.push(format!("source activate {conda_env}"));
        lines.push("echo conda env activate complete!".into());
    }
    lines
}

/// Write a submission script to disk.
pub fn make_sh(path: &Path, script: &str) -> Result<(), SubmitError> {
    debug!(
        path = %path.display(),
        "The submission script contains the following:\n{script}"
    );
    fs::write(path, script).map_err(|error| SubmitError::Script(path.to_path_buf(), error))
}

/// Run a command to completion, capturing stdout/stderr. Non-zero exit is a
/// submission failure.
pub fn run_command(program: &str, args: &[&str]) -> Result<(String, String), SubmitError> {
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .map_err(|error| SubmitError::Spawn(program.to_owned(), error))?;

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();

    if !output.status.success() {
        return Err(SubmitError::Rejected {
            code: output.status.code().unwrap_or(i32::MIN),
            stderr,
        });
    }

    Ok((stdout, stderr))
}

/// Extract a numeric job id from scheduler submission output.
pub fn parse_job_id(stdout: &str) -> Result<u64, SubmitError> {
    let digits: String = stdout.chars().filter(char::is_ascii_digit).collect();
    digits
        .parse()
        .map_err(|_| SubmitError::NoJobId(stdout.to_owned()))
}

/// Parse a space-delimited scheduler queue printout into per-job rows.
pub(crate) fn parse_queue_rows<'a>(
    header: &[&str],
    rows: impl Iterator<Item = &'a str>,
    id_column: &str,
) -> std::collections::BTreeMap<u64, std::collections::BTreeMap<String, String>> {
    let mut queue = std::collections::BTreeMap::new();
    let id_index = match header.iter().position(|column| *column == id_column) {
        Some(index) => index,
        None => return queue,
    };

    for row in rows {
        let fields: Vec<&str> = row.split_whitespace().collect();
        if fields.len() != header.len() {
            continue;
        }
        let Ok(job_id) = fields[id_index].parse::<u64>() else {
            continue;
        };
        let job = header
            .iter()
            .zip(&fields)
            .map(|(column, field)| ((*column).to_owned(), (*field).to_owned()))
            .collect();
        queue.insert(job_id, job);
    }

    queue
}
