use super::{SchedulerError, SubmitOptions};
use crate::{config::DispatchConfig, database::RunStatus, dispatch::JobDescriptor};
use once_cell::sync::Lazy;
use regex::Regex;
use std::str::FromStr;

/// First line printed by `bsub` on a successful submission.
pub static SUBMIT_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^Job\s<([0-9]+)>\s.+$").expect("hardcoded pattern"));

/// Data rows of `bjobs -a`: job id, user, status code, rest.
pub static STATUS_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([0-9]+)\s+\w+\s+(\w+)\s+.+$").expect("hardcoded pattern"));

#[derive(Debug, Clone)]
pub struct LsfScheduler {
    pub run_cmd: String,
    pub status_cmd: String,
}

impl LsfScheduler {
    pub fn load(config: &DispatchConfig) -> Self {
        match &config.simulator_path {
            Some(path) => Self {
                run_cmd: path.join("bsub").to_string_lossy().into_owned(),
                status_cmd: path.join("bjobs").to_string_lossy().into_owned(),
            },
            None => Self {
                run_cmd: "bsub".to_owned(),
                status_cmd: "bjobs".to_owned(),
            },
        }
    }

    pub fn build_submit_command(&self, job: &JobDescriptor, options: &SubmitOptions) -> String {
        let mut command = self.run_cmd.clone();

        if options.exclusive {
            command.push_str(" -n 1,1 -R \"span[hosts=1]\" -x");
        }
        if let Some(queue) = &options.queue {
            command.push_str(&format!(" -q {queue}"));
        }
        if let Some(limit) = options.mem_limit_gb {
            // bsub takes the limit in KB
            command.push_str(&format!(" -M {}", limit * 1_000_000));
        }
        if let Some(minutes) = options.wall_time_minutes {
            command.push_str(&format!(" -W {minutes}"));
        }
        command.push_str(&format!(" -o {} {}", job.output_path, job.cmd_raw));

        command
    }

    pub fn build_status_command(&self) -> String {
        // -a includes jobs that finished recently
        format!("{} -a", self.status_cmd)
    }

    pub fn parse_submit_output(
        &self,
        command: &str,
        stdout: &str,
        stderr: &str,
    ) -> Result<String, SchedulerError> {
        stdout
            .lines()
            .next()
            .and_then(|line| SUBMIT_PATTERN.captures(line))
            .and_then(|captures| captures.get(1))
            .map(|job_id| job_id.as_str().to_owned())
            .ok_or_else(|| SchedulerError::Protocol {
                command: command.to_owned(),
                stdout: stdout.to_owned(),
                stderr: stderr.to_owned(),
            })
    }

    pub fn parse_status_line(&self, line: &str) -> Option<(String, String)> {
        let captures = STATUS_PATTERN.captures(line)?;

        match (captures.get(1), captures.get(2)) {
            (Some(job_id), Some(code)) => {
                Some((job_id.as_str().to_owned(), code.as_str().to_owned()))
            }
            _ => None,
        }
    }

    pub fn map_status_code(&self, code: &str) -> Result<RunStatus, SchedulerError> {
        // clusters report the user-suspended state as PSUSP, the store keeps PUSP
        let code = if code == "PSUSP" { "PUSP" } else { code };

        Ok(RunStatus::from_str(code)?)
    }
}
