//! SLURM submission manager.

use super::{
    format_env,
    format_walltime,
    make_sh,
    parse_job_id,
    parse_queue_rows,
    run_command,
    QosOption,
    QueueState,
    SubmitError,
    SubmitOutcome,
    SubmitRequest,
};
use std::{collections::BTreeMap, fs};
use tracing::{debug, info, warn};

const SUBMIT_CMD: &str = "sbatch";
const CANCEL_CMD: &str = "scancel";
const QUEUE_CMD: &str = "squeue";

const ID_COLUMN: &str = "JOBID";
const NAME_COLUMN: &str = "NAME";
const STATUS_COLUMN: &str = "ST";

/// Pending in squeue output.
const SUBMITTED_STATUS: &str = "PD";

type Queue = BTreeMap<u64, BTreeMap<String, String>>;

#[derive(Debug)]
pub struct SlurmManager {
    user: String,
    queue: Option<Queue>,
}

impl SlurmManager {
    pub fn new(user: &str) -> Self {
        Self {
            user: user.to_owned(),
            queue: None,
        }
    }

    pub fn reset_query_cache(&mut self) {
        self.queue = None;
    }

    fn queue(&mut self) -> Option<&Queue> {
        if self.queue.is_none() {
            let format = format!(
                "%.15i %.30P %.{}j %.20u %.10t %.15M %.25R %q",
                super::MAX_JOB_NAME_LEN
            );
            match run_command(QUEUE_CMD, &["-u", &self.user, &format!("--format={format}")]) {
                Ok((stdout, _)) => {
                    let mut lines = stdout.lines();
                    let header: Vec<&str> = lines
                        .next()
                        .unwrap_or_default()
                        .split_whitespace()
                        .collect();
                    self.queue = Some(parse_queue_rows(&header, lines, ID_COLUMN));
                }
                Err(error) => {
                    warn!(error = ?error, "Failed to query the SLURM queue: {error}");
                    return None;
                }
            }
        }

        self.queue.as_ref()
    }

    pub fn check_job(&mut self, job_id: u64) -> QueueState {
        let Some(queue) = self.queue() else {
            // an unreachable scheduler must not read as "job gone"
            return QueueState::Queued;
        };

        match queue.get(&job_id) {
            Some(job) if job.get(STATUS_COLUMN).map(String::as_str) == Some(SUBMITTED_STATUS) => {
                QueueState::Queued
            }
            Some(_) => QueueState::Running,
            None => QueueState::Unknown,
        }
    }

    fn find_by_name(&mut self, name: &str) -> Option<u64> {
        let queue = self.queue()?;
        queue
            .iter()
            .find(|(_, job)| job.get(NAME_COLUMN).map(String::as_str) == Some(name))
            .map(|(job_id, _)| *job_id)
    }

    pub fn submit(&mut self, request: &SubmitRequest<'_>) -> Result<SubmitOutcome, SubmitError> {
        request.resources.require_allocation()?;
        request.resources.require_walltime()?;

        if let Some(job_id) = self.find_by_name(request.name) {
            info!(
                name = request.name,
                job_id,
                "Not submitting job because it is already in the queue"
            );
            return Ok(SubmitOutcome {
                job_id: Some(job_id),
            });
        }

        let script = self.make_script(request);
        let script_path = request.project_dir.join(format!("{}.sh", request.name));
        make_sh(&script_path, &script)?;

        let submission = run_command(SUBMIT_CMD, &[&script_path.to_string_lossy()]);
        if let Err(error) = fs::remove_file(&script_path) {
            debug!(error = ?error, "Failed to clean up submission script");
        }

        let (stdout, stderr) = submission?;
        if !stderr.is_empty() {
            warn!("Received a warning during submission: {stderr}");
        }

        let job_id = parse_job_id(&stdout)?;
        debug!(name = request.name, job_id, "Job submitted successfully");

        if let Some(queue) = &mut self.queue {
            let mut job = BTreeMap::new();
            job.insert(NAME_COLUMN.to_owned(), request.name.to_owned());
            job.insert(STATUS_COLUMN.to_owned(), SUBMITTED_STATUS.to_owned());
            queue.insert(job_id, job);
        }

        Ok(SubmitOutcome {
            job_id: Some(job_id),
        })
    }

    pub fn cancel(&mut self, job_id: u64) -> Result<(), SubmitError> {
        run_command(CANCEL_CMD, &[&job_id.to_string()]).map(|_| ())
    }

    fn make_script(&self, request: &SubmitRequest<'_>) -> String {
        let resources = request.resources;
        let name = request.name;
        let stdout_dir = request.stdout_dir.display();
        let qos = resources.qos.unwrap_or(QosOption::Normal);

        let mut lines = vec!["#!/bin/bash".to_owned()];
        if let Some(allocation) = &resources.allocation {
            lines.push(format!("#SBATCH --account={allocation}"));
        }
        if let Some(walltime) = resources.walltime {
            lines.push(format!("#SBATCH --time={}", format_walltime(walltime)));
        }
        lines.push(format!("#SBATCH --job-name={name}  # job name"));
        lines.push("#SBATCH --nodes=1  # number of nodes".to_owned());
        lines.push(format!("#SBATCH --output={stdout_dir}/{name}_%j.o"));
        lines.push(format!("#SBATCH --error={stdout_dir}/{name}_%j.e"));
        if !matches!(qos, QosOption::Unspecified) {
            lines.push(format!("#SBATCH --qos={qos}"));
        }
        if let Some(queue) = &resources.queue {
            lines.push(format!("#SBATCH --partition={queue}"));
        }
        if let Some(feature) = &resources.feature {
            lines.push(format!("#SBATCH {feature}  # extra feature"));
        }
        if let Some(memory) = resources.memory {
            lines.push(format!("#SBATCH --mem={}  # node RAM in MB", memory * 1000));
        }

        lines.extend(format_env(resources));
        lines.push("echo Running on: $HOSTNAME".to_owned());
        if let Some(sh_script) = &resources.sh_script {
            lines.push(sh_script.clone());
        }
        lines.push(format!("cd {}", request.project_dir.display()));
        lines.push(request.cmd.to_owned());

        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ExecutionControl;
    use serde_json::json;
    use std::path::Path;

    fn request<'a>(resources: &'a ExecutionControl) -> SubmitRequest<'a> {
        SubmitRequest {
            name: "study_run_j0",
            cmd: "geoflow run -c ./config_run_j0.task.json",
            project_dir: Path::new("/projects/study"),
            stdout_dir: Path::new("/projects/study/logs/stdout"),
            resources,
        }
    }

    #[test]
    fn script_contains_directives_in_order() {
        let resources: ExecutionControl = serde_json::from_value(json!({
            "option": "slurm",
            "allocation": "windstudy",
            "walltime": 0.5,
            "qos": "high",
            "memory": 90,
            "feature": "--partition=debug",
            "conda_env": "analysis",
            "sh_script": "echo hello"
        }))
        .unwrap();

        let manager = SlurmManager::new("tester");
        let script = manager.make_script(&request(&resources));
        let lines: Vec<&str> = script.lines().collect();

        assert_eq!(lines[0], "#!/bin/bash");
        assert_eq!(lines[1], "#SBATCH --account=windstudy");
        assert_eq!(lines[2], "#SBATCH --time=00:30:00");
        assert!(script.contains("#SBATCH --qos=high"));
        assert!(script.contains("#SBATCH --mem=90000"));
        assert!(script.contains("source activate analysis"));
        assert!(script.contains("echo hello"));
        assert!(script.ends_with("geoflow run -c ./config_run_j0.task.json"));

        let cd_line = lines.iter().position(|line| *line == "cd /projects/study");
        assert!(cd_line.unwrap() == lines.len() - 2);
    }

    #[test]
    fn minimal_script_skips_unset_directives() {
        let resources = ExecutionControl::default();
        let manager = SlurmManager::new("tester");
        let script = manager.make_script(&request(&resources));

        assert!(!script.contains("--account"));
        assert!(!script.contains("--time"));
        assert!(!script.contains("--mem"));
        assert!(script.contains("#SBATCH --qos=normal"));
    }

    #[test]
    fn queue_snapshot_lookup() {
        let mut manager = SlurmManager::new("tester");
        let header = ["JOBID", "PARTITION", "NAME", "USER", "ST"];
        let rows = "101 debug study_run_j0 tester PD\n102 debug study_run_j1 tester R";
        manager.queue = Some(parse_queue_rows(&header, rows.lines(), ID_COLUMN));

        assert_eq!(manager.check_job(101), QueueState::Queued);
        assert_eq!(manager.check_job(102), QueueState::Running);
        assert_eq!(manager.check_job(999), QueueState::Unknown);
        assert_eq!(manager.find_by_name("study_run_j1"), Some(102));
    }
}
