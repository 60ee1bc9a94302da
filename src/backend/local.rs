//! Local submission: the command runs synchronously in a child process.

use super::{SubmitError, SubmitOutcome, SubmitRequest};
use std::{
    io::Read,
    process::{Command, Stdio},
    time::Duration,
};
use tracing::{debug, info, warn};
use wait_timeout::ChildExt;

#[derive(Debug, Default)]
pub struct LocalBackend;

impl LocalBackend {
    /// Run the command line in a child shell and wait for it. A configured
    /// walltime bounds the child's runtime; the task's own success or
    /// failure is recorded by the node side, not here.
    pub fn submit(&self, request: &SubmitRequest<'_>) -> Result<SubmitOutcome, SubmitError> {
        info!(name = request.name, "Running job locally");
        debug!("Submitting the following command:\n{}", request.cmd);

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(request.cmd)
            .current_dir(request.project_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|error| SubmitError::Spawn(request.cmd.to_owned(), error))?;

        let timeout = request
            .resources
            .walltime
            .map(|hours| Duration::from_secs_f64(hours * 3600.0));

        let status = match timeout {
            Some(timeout) => match child
                .wait_timeout(timeout)
                .map_err(|error| SubmitError::Spawn(request.cmd.to_owned(), error))?
            {
                Some(status) => Some(status),
                None => {
                    warn!(
                        name = request.name,
                        "Local job exceeded its walltime; killing it"
                    );
                    let _ = child.kill();
                    let _ = child.wait();
                    None
                }
            },
            None => Some(
                child
                    .wait()
                    .map_err(|error| SubmitError::Spawn(request.cmd.to_owned(), error))?,
            ),
        };

        let mut stdout = String::new();
        if let Some(mut pipe) = child.stdout.take() {
            let _ = pipe.read_to_string(&mut stdout);
        }
        let mut stderr = String::new();
        if let Some(mut pipe) = child.stderr.take() {
            let _ = pipe.read_to_string(&mut stderr);
        }

        if !stdout.is_empty() {
            info!("Subprocess received stdout:\n{stdout}");
        }
        if !stderr.is_empty() {
            warn!("Subprocess received stderr:\n{stderr}");
        }

        match status {
            Some(status) if status.success() => {
                info!(name = request.name, "Completed local job")
            }
            Some(status) => warn!(
                name = request.name,
                code = status.code(),
                "Local job exited with a failure status"
            ),
            None => {}
        }

        Ok(SubmitOutcome { job_id: None })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ExecutionControl;

    fn resources() -> ExecutionControl {
        ExecutionControl::default()
    }

    #[test]
    fn runs_in_the_project_directory() {
        let dir = tempfile::tempdir().unwrap();
        let resources = resources();
        let request = SubmitRequest {
            name: "touch_marker",
            cmd: "touch ran_here",
            project_dir: dir.path(),
            stdout_dir: dir.path(),
            resources: &resources,
        };

        let outcome = LocalBackend.submit(&request).unwrap();
        assert_eq!(outcome.job_id, None);
        assert!(dir.path().join("ran_here").exists());
    }

    #[test]
    fn child_failure_is_not_a_submission_error() {
        let dir = tempfile::tempdir().unwrap();
        let resources = resources();
        let request = SubmitRequest {
            name: "fails",
            cmd: "exit 3",
            project_dir: dir.path(),
            stdout_dir: dir.path(),
            resources: &resources,
        };

        assert!(LocalBackend.submit(&request).is_ok());
    }
}
