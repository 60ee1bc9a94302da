//! Persistent per-project record of all tasks' states and metadata.
//!
//! The store is the sole source of truth for pipeline progress. Terminating
//! jobs on separate hosts never write the aggregated snapshot directly;
//! each writes its own single-record file (temp file + atomic rename), and
//! a fold step merges those into the snapshot. This keeps concurrent
//! updates lock-free on a shared POSIX filesystem.

use crate::{
    backend::{QueueProbe, SchedulerKind},
    config::merge_values,
};
use chrono::Local;
use nix::{sys::signal::kill, unistd::Pid};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::{
    fmt,
    fs,
    path::{Path, PathBuf},
    time::Instant,
};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Hidden per-project state directory.
pub const STATE_DIR: &str = ".geoflow";
/// Timestamp format used in all status records.
pub const DT_FMT: &str = "%d-%b-%Y %H:%M:%S";

const STATUS_FILE_SUFFIX: &str = "_status.json";
const TASK_FILE_PREFIX: &str = "task_";
const MONITOR_FILE: &str = "monitor.json";

/// Stable status-record key names.
pub mod field {
    pub const JOB_STATUS: &str = "job_status";
    pub const PIPELINE_INDEX: &str = "pipeline_index";
    pub const JOB_ID: &str = "job_id";
    pub const HARDWARE: &str = "hardware";
    pub const QOS: &str = "qos";
    pub const TIME_SUBMITTED: &str = "time_submitted";
    pub const TIME_START: &str = "time_start";
    pub const TIME_END: &str = "time_end";
    pub const TIME_RECONCILED: &str = "time_reconciled";
    pub const RUNTIME_SECONDS: &str = "runtime_seconds";
    pub const OUT_FILE: &str = "out_file";
    pub const CONFIG_HASH: &str = "config_hash";
    pub const MONITOR_PID: &str = "monitor_pid";
    pub const HOSTNAME: &str = "hostname";
    pub const ERROR_MESSAGE: &str = "error_message";
    pub const STDOUT_LOG: &str = "stdout_log";
    pub const STDOUT_ERR_LOG: &str = "stdout_err_log";
    pub const RESOURCES: &str = "resources";
}

#[derive(Error, Debug)]
pub enum StatusError {
    #[error("Failed to read status file {0}")]
    Read(PathBuf, #[source] std::io::Error),
    #[error("Failed to write status file {0}")]
    Write(PathBuf, #[source] std::io::Error),
    #[error("Status file {0} is not valid JSON")]
    Corrupt(PathBuf, #[source] serde_json::Error),
    #[error("Need a project directory, not a config file: {0}")]
    NotADirectory(PathBuf),
    #[error("Step {0:?} not found in the status record")]
    UnknownStep(String),
}

/// Lifecycle state of one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskState {
    NotSubmitted,
    Submitted,
    Running,
    Successful,
    Failed,
}

impl TaskState {
    /// Submitted or running: the scheduler still owes us a terminal state.
    pub fn is_processing(self) -> bool {
        matches!(self, Self::Submitted | Self::Running)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Successful | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotSubmitted => "not-submitted",
            Self::Submitted => "submitted",
            Self::Running => "running",
            Self::Successful => "successful",
            Self::Failed => "failed",
        }
    }

    pub fn from_value(value: Option<&Value>) -> Self {
        value
            .cloned()
            .and_then(|value| serde_json::from_value(value).ok())
            .unwrap_or(Self::NotSubmitted)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One flattened row of the aggregated view, for tabulation.
#[derive(Debug, Clone)]
pub struct TaskRow {
    pub step: String,
    pub job_name: String,
    pub pipeline_index: Option<u64>,
    pub state: TaskState,
    pub job_id: Option<u64>,
    pub hardware: Option<String>,
    pub qos: Option<String>,
    pub time_submitted: Option<String>,
    pub time_start: Option<String>,
    pub time_end: Option<String>,
    pub runtime_seconds: Option<f64>,
}

/// The per-project status store.
#[derive(Debug)]
pub struct StatusStore {
    project_dir: PathBuf,
    name: String,
    state_dir: PathBuf,
    snapshot_path: PathBuf,
    data: Map<String, Value>,
}

impl StatusStore {
    /// Open (or lazily create) the store for a project directory.
    pub fn open(project_dir: &Path) -> Result<Self, StatusError> {
        if project_dir.is_file() {
            return Err(StatusError::NotADirectory(project_dir.to_path_buf()));
        }

        let name = project_name(project_dir);
        let state_dir = project_dir.join(STATE_DIR);
        let snapshot_path = state_dir.join(format!("{name}{STATUS_FILE_SUFFIX}"));
        let data = load_json_map(&snapshot_path)?.unwrap_or_default();

        Ok(Self {
            project_dir: project_dir.to_path_buf(),
            name,
            state_dir,
            snapshot_path,
            data,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    pub fn data(&self) -> &Map<String, Value> {
        &self.data
    }

    /// Persist the snapshot. The write goes to a temp file first and is
    /// moved into place with a rename, so readers always see a valid file.
    pub fn dump(&self) -> Result<(), StatusError> {
        write_json_atomic(&self.state_dir, &self.snapshot_path, &Value::Object(self.data.clone()))
    }

    /// Re-read the snapshot from disk, discarding in-memory state.
    pub fn reload(&mut self) -> Result<(), StatusError> {
        self.data = load_json_map(&self.snapshot_path)?.unwrap_or_default();
        Ok(())
    }

    /// Fold all single-record task files into the snapshot. With `purge`,
    /// the single-record files are removed and the snapshot is re-dumped.
    pub fn update_from_task_files(&mut self, purge: bool) -> Result<&mut Self, StatusError> {
        if !self.state_dir.is_dir() {
            return Ok(self);
        }

        let mut task_files: Vec<PathBuf> = fs::read_dir(&self.state_dir)
            .map_err(|error| StatusError::Read(self.state_dir.clone(), error))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| {
                        name.starts_with(TASK_FILE_PREFIX) && name.ends_with(".json")
                    })
            })
            .collect();
        task_files.sort();

        for task_file in task_files {
            let Some(record) = load_json_map(&task_file)? else {
                continue;
            };
            let mut merged = Value::Object(std::mem::take(&mut self.data));
            merge_values(&mut merged, &Value::Object(record));
            if let Value::Object(mapping) = merged {
                self.data = mapping;
            }

            if purge {
                if let Err(error) = fs::remove_file(&task_file) {
                    warn!(
                        error = ?error,
                        path = %task_file.display(),
                        "Failed to purge folded task file"
                    );
                }
            }
        }

        if purge {
            self.dump()?;
        }

        Ok(self)
    }

    /// Iterate the task entries of a step, skipping step-level bookkeeping.
    pub fn task_entries<'a>(
        &'a self,
        step: &str,
    ) -> impl Iterator<Item = (&'a str, &'a Map<String, Value>)> {
        self.data
            .get(step)
            .and_then(Value::as_object)
            .into_iter()
            .flatten()
            .filter(|(key, _)| key.as_str() != field::PIPELINE_INDEX)
            .filter_map(|(key, value)| value.as_object().map(|entry| (key.as_str(), entry)))
    }

    pub fn task_state(&self, step: &str, job_name: &str) -> TaskState {
        let entry = self
            .data
            .get(step)
            .and_then(Value::as_object)
            .and_then(|step_map| step_map.get(job_name))
            .and_then(Value::as_object);
        TaskState::from_value(entry.and_then(|entry| entry.get(field::JOB_STATUS)))
    }

    pub fn task_field(&self, step: &str, job_name: &str, key: &str) -> Option<&Value> {
        self.data
            .get(step)?
            .as_object()?
            .get(job_name)?
            .as_object()?
            .get(key)
    }

    pub fn step_index(&self, step: &str) -> Option<u64> {
        self.data
            .get(step)?
            .as_object()?
            .get(field::PIPELINE_INDEX)?
            .as_u64()
    }

    pub fn set_step_index(&mut self, step: &str, index: u64) {
        let step_map = self
            .data
            .entry(step.to_owned())
            .or_insert_with(|| Value::Object(Default::default()));
        if let Some(mapping) = step_map.as_object_mut() {
            mapping.insert(field::PIPELINE_INDEX.to_owned(), json!(index));
        }
    }

    /// Rewrite the snapshot with steps ordered by pipeline index.
    pub fn dump_sorted(&mut self) -> Result<(), StatusError> {
        let mut keys: Vec<String> = self.data.keys().cloned().collect();
        // non-pipeline entries sort to the top
        keys.sort_by_key(|key| (self.step_index(key).map_or(-1, |index| index as i64), key.clone()));

        let mut sorted = Map::new();
        for key in keys {
            if let Some(value) = self.data.remove(&key) {
                sorted.insert(key, value);
            }
        }
        self.data = sorted;
        self.dump()
    }

    /// Reset all steps strictly after the named one back to not-submitted.
    /// Artifact files on disk are untouched.
    pub fn reset_after(&mut self, step: &str) -> Result<(), StatusError> {
        let reset_index = self
            .step_index(step)
            .ok_or_else(|| StatusError::UnknownStep(step.to_owned()))?;

        let steps: Vec<String> = self.data.keys().cloned().collect();
        for step_name in steps {
            let Some(step_index) = self.step_index(&step_name) else {
                continue;
            };
            if step_index > reset_index {
                self.data.insert(
                    step_name,
                    json!({ field::PIPELINE_INDEX: step_index }),
                );
            }
        }

        self.dump()
    }

    /// Query the scheduler for every processing entry; entries the queue no
    /// longer knows (and that never recorded an end time) flip to failed.
    pub fn reconcile(&mut self, probe: &mut QueueProbe) -> Result<(), StatusError> {
        let steps: Vec<String> = self.data.keys().cloned().collect();
        let mut changed = false;

        for step in &steps {
            let Some(step_map) = self.data.get_mut(step).and_then(Value::as_object_mut) else {
                continue;
            };

            for (job_name, entry) in step_map.iter_mut() {
                if job_name == field::PIPELINE_INDEX {
                    continue;
                }
                let Some(entry) = entry.as_object_mut() else {
                    continue;
                };

                let state = TaskState::from_value(entry.get(field::JOB_STATUS));
                if !state.is_processing() || entry.contains_key(field::TIME_END) {
                    continue;
                }

                let hardware = entry
                    .get(field::HARDWARE)
                    .and_then(Value::as_str)
                    .and_then(|option| SchedulerKind::from_option(option).ok())
                    .unwrap_or_default();
                let job_id = entry.get(field::JOB_ID).and_then(Value::as_u64);

                let live = match (hardware.is_hpc(), job_id) {
                    (true, Some(job_id)) => probe.query(hardware, job_id).is_live(),
                    // local jobs have no queue to be alive in
                    _ => false,
                };

                if !live {
                    info!(
                        step = %step,
                        job = %job_name,
                        "Job is no longer in the scheduler queue; marking it failed"
                    );
                    entry.insert(field::JOB_STATUS.to_owned(), json!(TaskState::Failed));
                    entry.insert(
                        field::TIME_RECONCILED.to_owned(),
                        json!(Local::now().format(DT_FMT).to_string()),
                    );
                    entry.insert(
                        field::ERROR_MESSAGE.to_owned(),
                        json!("job left the queue without recording an end time"),
                    );
                    changed = true;
                }
            }
        }

        if changed {
            self.dump()?;
        }

        Ok(())
    }

    /// Collect a field (by default the output artifact path) from every task
    /// of a step.
    pub fn parse_step_status(&self, step: &str, key: &str) -> Vec<Value> {
        self.task_entries(step)
            .filter_map(|(_, entry)| entry.get(key))
            .filter(|value| !value.is_null())
            .cloned()
            .collect()
    }

    pub fn job_exists(&self, job_name: &str, step: Option<&str>) -> bool {
        match step {
            Some(step) => self.task_entries(step).any(|(name, _)| name == job_name),
            None => self
                .data
                .keys()
                .any(|step| self.task_entries(step).any(|(name, _)| name == job_name)),
        }
    }

    /// Flatten the aggregated view into rows, tabulated by step and task.
    pub fn summary(&self, steps: Option<&[String]>) -> Vec<TaskRow> {
        let mut rows = Vec::new();
        for (step, _) in &self.data {
            if let Some(steps) = steps {
                if !steps.iter().any(|requested| requested == step) {
                    continue;
                }
            }

            let pipeline_index = self.step_index(step);
            for (job_name, entry) in self.task_entries(step) {
                rows.push(TaskRow {
                    step: step.clone(),
                    job_name: job_name.to_owned(),
                    pipeline_index,
                    state: TaskState::from_value(entry.get(field::JOB_STATUS)),
                    job_id: entry.get(field::JOB_ID).and_then(Value::as_u64),
                    hardware: entry
                        .get(field::HARDWARE)
                        .and_then(Value::as_str)
                        .map(str::to_owned),
                    qos: entry.get(field::QOS).and_then(Value::as_str).map(str::to_owned),
                    time_submitted: entry
                        .get(field::TIME_SUBMITTED)
                        .and_then(Value::as_str)
                        .map(str::to_owned),
                    time_start: entry
                        .get(field::TIME_START)
                        .and_then(Value::as_str)
                        .map(str::to_owned),
                    time_end: entry
                        .get(field::TIME_END)
                        .and_then(Value::as_str)
                        .map(str::to_owned),
                    runtime_seconds: entry.get(field::RUNTIME_SECONDS).and_then(Value::as_f64),
                });
            }
        }

        rows.sort_by_key(|row| (row.pipeline_index, row.step.clone(), row.job_name.clone()));
        rows
    }

    /// Write a single-record status file for one task. Safe under
    /// concurrent writers; records are merged by the fold step.
    pub fn write_task_file(
        project_dir: &Path,
        step: &str,
        job_name: &str,
        attrs: &Map<String, Value>,
    ) -> Result<(), StatusError> {
        let state_dir = project_dir.join(STATE_DIR);
        let path = state_dir.join(format!("{TASK_FILE_PREFIX}{job_name}.json"));
        let record = json!({ step: { job_name: Value::Object(attrs.clone()) } });
        write_json_atomic(&state_dir, &path, &record)
    }

    /// Mark a job as submitted in the aggregated snapshot, creating the
    /// store on first use. Existing entries are only replaced on request.
    pub fn mark_submitted(
        project_dir: &Path,
        step: &str,
        job_name: &str,
        replace: bool,
        mut attrs: Map<String, Value>,
    ) -> Result<(), StatusError> {
        let mut store = Self::open(project_dir)?;
        store.update_from_task_files(false)?;

        if store.job_exists(job_name, Some(step)) && !replace {
            debug!(job_name, "Job already recorded; not marking as submitted");
            return Ok(());
        }

        attrs.insert(field::JOB_STATUS.to_owned(), json!(TaskState::Submitted));
        let step_map = store
            .data
            .entry(step.to_owned())
            .or_insert_with(|| Value::Object(Default::default()));
        if let Some(mapping) = step_map.as_object_mut() {
            mapping.insert(job_name.to_owned(), Value::Object(attrs));
        }

        store.dump()
    }

    /// Record the PID of a monitor process for this project.
    pub fn record_monitor_pid(project_dir: &Path, pid: i32) -> Result<(), StatusError> {
        let state_dir = project_dir.join(STATE_DIR);
        let path = state_dir.join(MONITOR_FILE);
        write_json_atomic(&state_dir, &path, &json!({ field::MONITOR_PID: pid }))
    }

    /// PID of a previously recorded monitor process, if any.
    pub fn monitor_pid(project_dir: &Path) -> Result<Option<i32>, StatusError> {
        let path = project_dir.join(STATE_DIR).join(MONITOR_FILE);
        let Some(record) = load_json_map(&path)? else {
            return Ok(None);
        };
        Ok(record
            .get(field::MONITOR_PID)
            .and_then(Value::as_i64)
            .map(|pid| pid as i32))
    }

    pub fn clear_monitor_pid(project_dir: &Path) {
        let path = project_dir.join(STATE_DIR).join(MONITOR_FILE);
        if let Err(error) = fs::remove_file(&path) {
            if error.kind() != std::io::ErrorKind::NotFound {
                warn!(error = ?error, "Failed to remove monitor token");
            }
        }
    }

    /// Remove all persisted status for a project.
    pub fn remove_state_dir(project_dir: &Path) -> Result<(), StatusError> {
        let state_dir = project_dir.join(STATE_DIR);
        if state_dir.is_dir() {
            fs::remove_dir_all(&state_dir)
                .map_err(|error| StatusError::Write(state_dir.clone(), error))?;
        }
        Ok(())
    }
}

/// `true` if a process with this PID is alive on this host.
pub fn pid_alive(pid: i32) -> bool {
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// RAII guard around a task run on the compute node. Entering writes a
/// `running` record; finishing writes `successful` with the runtime and
/// optional output artifact. Dropping without finishing (including on
/// panic) writes `failed`, so an end-of-job record always lands.
pub struct RunHandle {
    project_dir: PathBuf,
    step: String,
    job_name: String,
    attrs: Map<String, Value>,
    started: Instant,
    finished: bool,
}

impl RunHandle {
    pub fn begin(
        project_dir: &Path,
        step: &str,
        job_name: &str,
        mut attrs: Map<String, Value>,
    ) -> Result<Self, StatusError> {
        attrs.insert(field::JOB_STATUS.to_owned(), json!(TaskState::Running));
        attrs.insert(
            field::TIME_START.to_owned(),
            json!(Local::now().format(DT_FMT).to_string()),
        );
        if let Ok(hostname) = nix::unistd::gethostname() {
            attrs.insert(
                field::HOSTNAME.to_owned(),
                json!(hostname.to_string_lossy()),
            );
        }

        StatusStore::write_task_file(project_dir, step, job_name, &attrs)?;

        Ok(Self {
            project_dir: project_dir.to_path_buf(),
            step: step.to_owned(),
            job_name: job_name.to_owned(),
            attrs,
            started: Instant::now(),
            finished: false,
        })
    }

    fn write_terminal(&mut self, state: TaskState) {
        let runtime = self.started.elapsed().as_secs_f64();
        self.attrs.insert(field::JOB_STATUS.to_owned(), json!(state));
        self.attrs.insert(
            field::TIME_END.to_owned(),
            json!(Local::now().format(DT_FMT).to_string()),
        );
        self.attrs
            .insert(field::RUNTIME_SECONDS.to_owned(), json!(runtime));

        if let Err(error) = StatusStore::write_task_file(
            &self.project_dir,
            &self.step,
            &self.job_name,
            &self.attrs,
        ) {
            warn!(error = ?error, "Failed to write end-of-job status record");
        }
        self.finished = true;

        info!(
            step = %self.step,
            job = %self.job_name,
            runtime = %elapsed_time_as_str(runtime),
            "Task {state}"
        );
    }

    pub fn finish(mut self, out_file: Option<&Path>) {
        if let Some(out_file) = out_file {
            self.attrs.insert(
                field::OUT_FILE.to_owned(),
                json!(out_file.to_string_lossy()),
            );
        }
        self.write_terminal(TaskState::Successful);
    }

    pub fn fail(mut self, message: &str) {
        self.attrs
            .insert(field::ERROR_MESSAGE.to_owned(), json!(message));
        self.write_terminal(TaskState::Failed);
    }
}

impl Drop for RunHandle {
    fn drop(&mut self) {
        if !self.finished {
            self.attrs.insert(
                field::ERROR_MESSAGE.to_owned(),
                json!("run aborted without a terminal state"),
            );
            self.write_terminal(TaskState::Failed);
        }
    }
}

/// Format elapsed seconds as `h:mm:ss`, with a day count for long runs.
pub fn elapsed_time_as_str(seconds_elapsed: f64) -> String {
    let total = seconds_elapsed.max(0.0) as u64;
    let (days, rest) = (total / 86_400, total % 86_400);
    let (hours, rest) = (rest / 3600, rest % 3600);
    let (minutes, seconds) = (rest / 60, rest % 60);

    let time_str = format!("{hours}:{minutes:02}:{seconds:02}");
    if days > 0 {
        let plural = if days == 1 { "" } else { "s" };
        format!("{days} day{plural}, {time_str}")
    } else {
        time_str
    }
}

fn project_name(project_dir: &Path) -> String {
    project_dir
        .canonicalize()
        .unwrap_or_else(|_| project_dir.to_path_buf())
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "project".to_owned())
        .replace('-', "_")
}

fn load_json_map(path: &Path) -> Result<Option<Map<String, Value>>, StatusError> {
    if !path.is_file() {
        return Ok(None);
    }
    let text =
        fs::read_to_string(path).map_err(|error| StatusError::Read(path.to_path_buf(), error))?;
    let value: Value = serde_json::from_str(&text)
        .map_err(|error| StatusError::Corrupt(path.to_path_buf(), error))?;
    Ok(value.as_object().cloned())
}

fn write_json_atomic(dir: &Path, path: &Path, value: &Value) -> Result<(), StatusError> {
    fs::create_dir_all(dir).map_err(|error| StatusError::Write(dir.to_path_buf(), error))?;

    let temp_name = format!(
        ".{}.tmp.{}",
        path.file_name().unwrap_or_default().to_string_lossy(),
        std::process::id()
    );
    let temp_path = dir.join(temp_name);
    let text = serde_json::to_string_pretty(value)
        .map_err(|error| StatusError::Corrupt(path.to_path_buf(), error))?;

    fs::write(&temp_path, text).map_err(|error| StatusError::Write(temp_path.clone(), error))?;
    fs::rename(&temp_path, path).map_err(|error| StatusError::Write(path.to_path_buf(), error))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submitted_attrs(job_id: u64) -> Map<String, Value> {
        let mut attrs = Map::new();
        attrs.insert(field::JOB_ID.to_owned(), json!(job_id));
        attrs.insert(field::HARDWARE.to_owned(), json!("slurm"));
        attrs
    }

    #[test]
    fn task_states_serialize_kebab_case() {
        assert_eq!(json!(TaskState::NotSubmitted), json!("not-submitted"));
        assert_eq!(json!(TaskState::Successful), json!("successful"));
        assert_eq!(
            TaskState::from_value(Some(&json!("running"))),
            TaskState::Running
        );
        assert_eq!(TaskState::from_value(None), TaskState::NotSubmitted);
    }

    #[test]
    fn fold_merges_concurrent_task_files() {
        let dir = tempfile::tempdir().unwrap();
        StatusStore::mark_submitted(dir.path(), "run", "proj_run_j0", true, submitted_attrs(1))
            .unwrap();
        StatusStore::mark_submitted(dir.path(), "run", "proj_run_j1", true, submitted_attrs(2))
            .unwrap();

        // two jobs finishing on different hosts write single-record files
        let mut done = Map::new();
        done.insert(field::JOB_STATUS.to_owned(), json!(TaskState::Successful));
        StatusStore::write_task_file(dir.path(), "run", "proj_run_j0", &done).unwrap();
        let mut failed = Map::new();
        failed.insert(field::JOB_STATUS.to_owned(), json!(TaskState::Failed));
        StatusStore::write_task_file(dir.path(), "run", "proj_run_j1", &failed).unwrap();

        let mut store = StatusStore::open(dir.path()).unwrap();
        store.update_from_task_files(true).unwrap();

        assert_eq!(store.task_state("run", "proj_run_j0"), TaskState::Successful);
        assert_eq!(store.task_state("run", "proj_run_j1"), TaskState::Failed);
        // merging kept the submission-time fields
        assert_eq!(
            store.task_field("run", "proj_run_j0", field::JOB_ID),
            Some(&json!(1))
        );

        // purge removed the single-record files
        let leftovers: Vec<_> = fs::read_dir(dir.path().join(STATE_DIR))
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| {
                entry
                    .file_name()
                    .to_string_lossy()
                    .starts_with(TASK_FILE_PREFIX)
            })
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn fold_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        StatusStore::mark_submitted(dir.path(), "run", "proj_run", true, submitted_attrs(7))
            .unwrap();

        let mut store = StatusStore::open(dir.path()).unwrap();
        store.update_from_task_files(true).unwrap();
        let first = store.data().clone();
        store.update_from_task_files(true).unwrap();
        assert_eq!(store.data(), &first);
    }

    #[test]
    fn reconcile_fails_vanished_jobs() {
        let dir = tempfile::tempdir().unwrap();
        // a local job that never wrote a terminal record
        let mut attrs = Map::new();
        attrs.insert(field::HARDWARE.to_owned(), json!("local"));
        StatusStore::mark_submitted(dir.path(), "run", "proj_run", true, attrs).unwrap();

        let mut store = StatusStore::open(dir.path()).unwrap();
        let mut probe = QueueProbe::new();
        store.reconcile(&mut probe).unwrap();

        assert_eq!(store.task_state("run", "proj_run"), TaskState::Failed);
        assert!(store
            .task_field("run", "proj_run", field::TIME_RECONCILED)
            .is_some());
    }

    #[test]
    fn reconcile_leaves_terminal_states_alone() {
        let dir = tempfile::tempdir().unwrap();
        let mut done = Map::new();
        done.insert(field::JOB_STATUS.to_owned(), json!(TaskState::Successful));
        StatusStore::write_task_file(dir.path(), "run", "proj_run", &done).unwrap();

        let mut store = StatusStore::open(dir.path()).unwrap();
        store.update_from_task_files(false).unwrap();
        store.reconcile(&mut QueueProbe::new()).unwrap();

        assert_eq!(store.task_state("run", "proj_run"), TaskState::Successful);
    }

    #[test]
    fn reset_after_preserves_earlier_steps() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = StatusStore::open(dir.path()).unwrap();
        store.set_step_index("prep", 0);
        store.set_step_index("run", 1);
        store.set_step_index("collect", 2);

        let mut done = Map::new();
        done.insert(field::JOB_STATUS.to_owned(), json!(TaskState::Successful));
        for step in ["prep", "run", "collect"] {
            if let Some(mapping) = store.data.get_mut(step).and_then(Value::as_object_mut) {
                mapping.insert("job".to_owned(), Value::Object(done.clone()));
            }
        }

        store.reset_after("prep").unwrap();

        assert_eq!(store.task_state("prep", "job"), TaskState::Successful);
        assert_eq!(store.task_state("run", "job"), TaskState::NotSubmitted);
        assert_eq!(store.task_state("collect", "job"), TaskState::NotSubmitted);
        assert_eq!(store.step_index("run"), Some(1));

        assert!(store.reset_after("nope").is_err());
    }

    #[test]
    fn run_handle_records_success_and_failure() {
        let dir = tempfile::tempdir().unwrap();

        let handle = RunHandle::begin(dir.path(), "run", "proj_run_j0", Map::new()).unwrap();
        handle.finish(Some(Path::new("out.h5")));

        let handle = RunHandle::begin(dir.path(), "run", "proj_run_j1", Map::new()).unwrap();
        handle.fail("user code raised");

        // dropped without finishing, e.g. a panic unwinding through the run
        drop(RunHandle::begin(dir.path(), "run", "proj_run_j2", Map::new()).unwrap());

        let mut store = StatusStore::open(dir.path()).unwrap();
        store.update_from_task_files(true).unwrap();

        assert_eq!(store.task_state("run", "proj_run_j0"), TaskState::Successful);
        assert_eq!(
            store.task_field("run", "proj_run_j0", field::OUT_FILE),
            Some(&json!("out.h5"))
        );
        assert_eq!(store.task_state("run", "proj_run_j1"), TaskState::Failed);
        assert_eq!(store.task_state("run", "proj_run_j2"), TaskState::Failed);
        assert!(store
            .task_field("run", "proj_run_j1", field::RUNTIME_SECONDS)
            .is_some());
    }

    #[test]
    fn monitor_token_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(StatusStore::monitor_pid(dir.path()).unwrap(), None);

        StatusStore::record_monitor_pid(dir.path(), 4242).unwrap();
        assert_eq!(StatusStore::monitor_pid(dir.path()).unwrap(), Some(4242));

        StatusStore::clear_monitor_pid(dir.path());
        assert_eq!(StatusStore::monitor_pid(dir.path()).unwrap(), None);
    }

    #[test]
    fn own_pid_is_alive() {
        assert!(pid_alive(std::process::id() as i32));
        assert!(!pid_alive(i32::MAX - 1));
    }

    #[test]
    fn elapsed_time_formatting() {
        assert_eq!(elapsed_time_as_str(0.0), "0:00:00");
        assert_eq!(elapsed_time_as_str(59.9), "0:00:59");
        assert_eq!(elapsed_time_as_str(3_661.0), "1:01:01");
        assert_eq!(elapsed_time_as_str(90_000.0), "1 day, 1:00:00");
    }
}
