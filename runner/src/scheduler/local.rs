use super::SchedulerError;
use crate::{config::DispatchConfig, database::RunStatus, dispatch::JobDescriptor};
use std::{
    fs,
    fs::File,
    path::PathBuf,
    process::{Command, Stdio},
    time::Duration,
};
use tracing::warn;
use wait_timeout::ChildExt;

#[derive(Debug, Clone)]
pub struct ProcessScheduler {
    pub rhessys_path: PathBuf,
    pub wall_time: Option<Duration>,
}

impl ProcessScheduler {
    pub fn load(config: &DispatchConfig) -> Self {
        Self {
            rhessys_path: config.rhessys_path(),
            wall_time: config
                .wall_time_minutes
                .map(|minutes| Duration::from_secs(u64::from(minutes) * 60)),
        }
    }

    pub fn build_submit_command(&self, job: &JobDescriptor) -> String {
        job.cmd_raw.clone()
    }

    /// Run the job in place and report how it went. Standard output streams
    /// into `<output dir>/<job id>.out`, standard error into a matching
    /// `.err` file that is kept only when the job wrote to it. Jobs past
    /// their wall time are killed and retired as failed.
    pub fn execute(&self, job: &JobDescriptor, job_id: &str) -> Result<RunStatus, SchedulerError> {
        let output_dir = self.rhessys_path.join(&job.output_path);
        let stdout_path = output_dir.join(format!("{job_id}.out"));
        let stderr_path = output_dir.join(format!("{job_id}.err"));
        let stdout = File::create(&stdout_path)?;
        let stderr = File::create(&stderr_path)?;

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&job.cmd_raw)
            .current_dir(&self.rhessys_path)
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .spawn()?;

        let mut timed_out = false;
        let status = match self.wall_time {
            Some(limit) => match child.wait_timeout(limit)? {
                Some(status) => status,
                None => {
                    timed_out = true;
                    child.kill()?;
                    child.wait()?
                }
            },
            None => child.wait()?,
        };

        if stderr_path
            .metadata()
            .map(|metadata| metadata.len() == 0)
            .unwrap_or(false)
        {
            fs::remove_file(&stderr_path)?;
        }

        if timed_out {
            warn!(
                "Job {job_id} was killed after exceeding its wall time of {:?}",
                self.wall_time
            );
            return Ok(RunStatus::Exit);
        }

        Ok(match status.success() {
            true => RunStatus::Done,
            false => RunStatus::Exit,
        })
    }
}
