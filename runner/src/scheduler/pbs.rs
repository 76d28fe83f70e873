use super::{SchedulerError, SubmitOptions};
use crate::{
    config::DispatchConfig,
    database::{RunStatus, UnknownStatusCode},
    dispatch::JobDescriptor,
};
use once_cell::sync::Lazy;
use regex::Regex;
use std::{fs, path::PathBuf};

/// Line printed by `qsub` on a successful submission, e.g. `4174.head-node`.
pub static SUBMIT_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([0-9]+\.\S+)$").expect("hardcoded pattern"));

/// Data rows of `qstat`: job id, then the single-letter state in column five.
pub static STATUS_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([0-9]+\.\S+)\s+\S+\s+\S+\s+\S+\s+(\S+)\s\S+$").expect("hardcoded pattern")
});

#[derive(Debug, Clone)]
pub struct PbsScheduler {
    pub run_cmd: String,
    pub status_cmd: String,
    pub rhessys_path: PathBuf,
}

impl PbsScheduler {
    pub fn load(config: &DispatchConfig) -> Self {
        let (run_cmd, status_cmd) = match &config.simulator_path {
            Some(path) => (
                path.join("qsub").to_string_lossy().into_owned(),
                path.join("qstat").to_string_lossy().into_owned(),
            ),
            None => ("qsub".to_owned(), "qstat".to_owned()),
        };

        Self {
            run_cmd,
            status_cmd,
            rhessys_path: config.rhessys_path(),
        }
    }

    /// PBS takes a script file instead of a command line, so the job command
    /// is written to `pbs.script` in the run's output directory first.
    pub fn build_submit_command(
        &self,
        job: &JobDescriptor,
        options: &SubmitOptions,
    ) -> Result<String, SchedulerError> {
        let script = self.rhessys_path.join(&job.output_path).join("pbs.script");
        fs::write(script, format!("#!/bin/bash\n\n{}\n", job.cmd_raw))?;

        let mut command = self.run_cmd.clone();

        if let Some(queue) = &options.queue {
            command.push_str(&format!(" -q {queue}"));
        }

        let mut resources = Vec::new();
        if let Some(limit) = options.mem_limit_gb {
            resources.push(format!("mem={limit}gb"));
        }
        if let Some(minutes) = options.wall_time_minutes {
            resources.push(format!("walltime={}:{:02}:00", minutes / 60, minutes % 60));
        }
        if !resources.is_empty() {
            command.push_str(&format!(" -l {}", resources.join(",")));
        }
        if options.exclusive {
            command.push_str(" -n");
        }
        command.push_str(&format!(
            " -o {path}/pbs.out -e {path}/pbs.err {path}/pbs.script",
            path = job.output_path
        ));

        Ok(command)
    }

    pub fn build_status_command(&self) -> String {
        self.status_cmd.clone()
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
        match code {
            "C" => Ok(RunStatus::Done),
            "E" => Ok(RunStatus::Exit),
            "H" | "W" => Ok(RunStatus::Wait),
            "Q" => Ok(RunStatus::Pend),
            "R" => Ok(RunStatus::Run),
            "S" => Ok(RunStatus::Ssusp),
            "T" => Ok(RunStatus::Unkwn),
            other => Err(UnknownStatusCode(other.to_owned()).into()),
        }
    }
}
