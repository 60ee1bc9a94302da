//! PBS submission manager.

use super::{
    format_env,
    format_walltime,
    make_sh,
    parse_job_id,
    parse_queue_rows,
    run_command,
    QueueState,
    SubmitError,
    SubmitOutcome,
    SubmitRequest,
};
use std::{collections::BTreeMap, fs};
use tracing::{debug, info, warn};

const SUBMIT_CMD: &str = "qsub";
const CANCEL_CMD: &str = "qdel";
const QUEUE_CMD: &str = "qstat";

// qstat prints multi-word headers with inconsistent spacing, so rows are
// mapped onto these canonical single-word columns instead.
const QUEUE_COLUMNS: [&str; 6] = ["JobId", "Name", "User", "TimeUse", "S", "Queue"];
const ID_COLUMN: &str = "JobId";
const NAME_COLUMN: &str = "Name";
const STATUS_COLUMN: &str = "S";

const SUBMITTED_STATUS: &str = "Q";
const RUNNING_STATUS: &str = "R";

type Queue = BTreeMap<u64, BTreeMap<String, String>>;

#[derive(Debug)]
pub struct PbsManager {
    user: String,
    queue: Option<Queue>,
}

impl PbsManager {
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
            match run_command(QUEUE_CMD, &["-u", &self.user]) {
                Ok((stdout, _)) => {
                    // the first two rows are the banner and the column rule
                    let rows = stdout.lines().skip(2);
                    self.queue = Some(parse_queue_rows(&QUEUE_COLUMNS, rows, ID_COLUMN));
                }
                Err(error) => {
                    warn!(error = ?error, "Failed to query the PBS queue: {error}");
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

        match queue.get(&job_id).and_then(|job| job.get(STATUS_COLUMN)) {
            Some(status) if status == SUBMITTED_STATUS => QueueState::Queued,
            Some(_) => QueueState::Running,
            None => QueueState::Unknown,
        }
    }

    fn job_is_live(&mut self, name: &str) -> Option<u64> {
        let queue = self.queue()?;
        queue
            .iter()
            .find(|(_, job)| {
                job.get(NAME_COLUMN).map(String::as_str) == Some(name)
                    && matches!(
                        job.get(STATUS_COLUMN).map(String::as_str),
                        Some(SUBMITTED_STATUS) | Some(RUNNING_STATUS)
                    )
            })
            .map(|(job_id, _)| *job_id)
    }

    pub fn submit(&mut self, request: &SubmitRequest<'_>) -> Result<SubmitOutcome, SubmitError> {
        request.resources.require_allocation()?;
        request.resources.require_walltime()?;

        if let Some(job_id) = self.job_is_live(request.name) {
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

        let mut features = Vec::new();
        if let Some(feature) = &resources.feature {
            features.push(feature.replace(' ', ""));
        }
        if let Some(walltime) = resources.walltime {
            features.push(format!("walltime={}", format_walltime(walltime)));
        }
        if let Some(memory) = resources.memory {
            features.push(format!("mem={memory}gb"));
        }
        if let Some(qos) = resources.qos {
            features.push(format!("qos={qos}"));
        }

        let mut lines = vec!["#!/bin/bash".to_owned()];
        lines.push(format!("#PBS -N {name} # job name"));
        if let Some(allocation) = &resources.allocation {
            lines.push(format!("#PBS -A {allocation} # allocation account"));
        }
        if let Some(queue) = &resources.queue {
            lines.push(format!("#PBS -q {queue} # queue"));
        }
        lines.push(format!("#PBS -o {stdout_dir}/{name}_$PBS_JOBID.o"));
        lines.push(format!("#PBS -e {stdout_dir}/{name}_$PBS_JOBID.e"));
        if !features.is_empty() {
            lines.push(format!("#PBS -l {}", features.join(",")));
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
