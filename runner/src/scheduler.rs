use crate::{
    config::{DispatchConfig, ParallelMode},
    database::RunStatus,
    dispatch::JobDescriptor,
};
use std::{io, path::Path, process, process::Command};
use thiserror::Error;

pub mod local;
pub mod lsf;
pub mod pbs;

use local::ProcessScheduler;
use lsf::LsfScheduler;
use pbs::PbsScheduler;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Unexpected reply from `{command}`: stdout {stdout:?}, stderr {stderr:?}")]
    Protocol {
        command: String,
        stdout: String,
        stderr: String,
    },
    #[error(transparent)]
    UnknownStatus(#[from] crate::database::UnknownStatusCode),
    #[error("Failed to run a scheduler command")]
    Exec(#[from] io::Error),
}

/// Per-job submission settings handed to the backends.
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    pub queue: Option<String>,
    pub mem_limit_gb: Option<u32>,
    pub wall_time_minutes: Option<u32>,
    pub exclusive: bool,
}

/// The configured scheduler backend. LSF and PBS jobs are submitted through
/// the cluster command line tools and reconciled by polling, local
/// subprocess jobs run in place and report their outcome on return.
#[derive(Debug, Clone)]
pub enum Schedulers {
    Lsf(LsfScheduler),
    Pbs(PbsScheduler),
    Process(ProcessScheduler),
}

impl Schedulers {
    pub fn load(config: &DispatchConfig) -> Self {
        match config.parallel_mode {
            ParallelMode::Lsf => Schedulers::Lsf(LsfScheduler::load(config)),
            ParallelMode::Pbs => Schedulers::Pbs(PbsScheduler::load(config)),
            ParallelMode::Process => Schedulers::Process(ProcessScheduler::load(config)),
        }
    }

    /// Whether jobs are executed in place instead of being polled for.
    pub fn is_direct(&self) -> bool {
        matches!(self, Schedulers::Process(_))
    }

    pub fn build_submit_command(
        &self,
        job: &JobDescriptor,
        options: &SubmitOptions,
    ) -> Result<String, SchedulerError> {
        match self {
            Schedulers::Lsf(lsf) => Ok(lsf.build_submit_command(job, options)),
            Schedulers::Pbs(pbs) => pbs.build_submit_command(job, options),
            Schedulers::Process(process) => Ok(process.build_submit_command(job)),
        }
    }

    pub fn build_status_command(&self) -> String {
        match self {
            Schedulers::Lsf(lsf) => lsf.build_status_command(),
            Schedulers::Pbs(pbs) => pbs.build_status_command(),
            Schedulers::Process(_) => unreachable!("local subprocess jobs are executed directly"),
        }
    }

    /// Extract the scheduler-assigned job id from the submission reply.
    pub fn parse_submit_output(
        &self,
        command: &str,
        stdout: &str,
        stderr: &str,
    ) -> Result<String, SchedulerError> {
        match self {
            Schedulers::Lsf(lsf) => lsf.parse_submit_output(command, stdout, stderr),
            Schedulers::Pbs(pbs) => pbs.parse_submit_output(command, stdout, stderr),
            Schedulers::Process(_) => unreachable!("local subprocess jobs are executed directly"),
        }
    }

    /// Pick the job id and status code out of one line of status output.
    /// Headers, separators and any other noise come back as `None`.
    pub fn parse_status_line(&self, line: &str) -> Option<(String, String)> {
        match self {
            Schedulers::Lsf(lsf) => lsf.parse_status_line(line),
            Schedulers::Pbs(pbs) => pbs.parse_status_line(line),
            Schedulers::Process(_) => unreachable!("local subprocess jobs are executed directly"),
        }
    }

    /// Translate a backend status code into the stored vocabulary. Codes
    /// outside the backend's documented set are an error, not a guess.
    pub fn map_status_code(&self, code: &str) -> Result<RunStatus, SchedulerError> {
        match self {
            Schedulers::Lsf(lsf) => lsf.map_status_code(code),
            Schedulers::Pbs(pbs) => pbs.map_status_code(code),
            Schedulers::Process(_) => unreachable!("local subprocess jobs are executed directly"),
        }
    }

    pub fn execute_direct(
        &self,
        job: &JobDescriptor,
        job_id: &str,
    ) -> Result<RunStatus, SchedulerError> {
        match self {
            Schedulers::Process(process) => process.execute(job, job_id),
            _ => unreachable!("only the local subprocess backend executes jobs directly"),
        }
    }
}

/// Run a scheduler command line through the shell, like a user would.
pub fn run_shell(command: &str, cwd: &Path) -> Result<process::Output, SchedulerError> {
    Ok(Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(cwd)
        .output()?)
}
