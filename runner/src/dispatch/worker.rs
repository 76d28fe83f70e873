use crate::{
    config::DispatchConfig,
    database::{ConnectionError, RunStatus, SharedConnection},
    dispatch::JobDescriptor,
    queue::{DispatchQueue, QueueError},
    scheduler::{run_shell, SchedulerError, Schedulers},
};
use chrono::Utc;
use std::{thread, time::Duration};
use thiserror::Error;
use tracing::{debug, error, info};

/// Delay before the first status poll, giving submissions time to appear.
const INIT_SLEEP: Duration = Duration::from_secs(15);
/// Base delay between status polls, scaled by the polling delay multiplier.
const JOB_STATUS_SLEEP: Duration = Duration::from_secs(60);
/// Delay before a runner winds down after its last run retired.
const EXIT_SLEEP: Duration = Duration::from_secs(5);
/// How long a queue read may block before the runner polls again.
const QUEUE_GET_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error(transparent)]
    Store(#[from] ConnectionError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error("Queue protocol violation")]
    Queue(#[from] QueueError),
}

/// Polling cadence of a job runner, adjustable for tests.
#[derive(Debug, Clone, Copy)]
pub struct PollTiming {
    pub init_sleep: Duration,
    pub status_sleep: Duration,
    pub queue_timeout: Duration,
    pub exit_sleep: Duration,
}

impl PollTiming {
    pub fn from_multiplier(polling_delay: u32) -> Self {
        Self {
            init_sleep: INIT_SLEEP,
            status_sleep: JOB_STATUS_SLEEP * polling_delay.max(1),
            queue_timeout: QUEUE_GET_TIMEOUT,
            exit_sleep: EXIT_SLEEP,
        }
    }
}

/// Consumes job descriptors from the dispatch queue, pushes them to the
/// scheduler backend and reconciles the job record store with what the
/// scheduler reports, until the queue closes and the session has no live
/// runs left.
pub struct JobRunner {
    index: u32,
    session_id: i64,
    config: DispatchConfig,
    connection: SharedConnection,
    queue: DispatchQueue<JobDescriptor>,
    scheduler: Schedulers,
    timing: PollTiming,
    max_active_jobs: u32,
    active_jobs: u32,
}

impl JobRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        index: u32,
        session_id: i64,
        config: DispatchConfig,
        connection: SharedConnection,
        queue: DispatchQueue<JobDescriptor>,
        scheduler: Schedulers,
        timing: PollTiming,
        max_active_jobs: u32,
    ) -> Self {
        Self {
            index,
            session_id,
            config,
            connection,
            queue,
            scheduler,
            timing,
            max_active_jobs,
            active_jobs: 0,
        }
    }

    /// A failed runner poisons the queue on the way out, so the producer
    /// and any sibling runners stop instead of waiting forever.
    pub fn run(mut self) -> Result<(), WorkerError> {
        let outcome = match self.scheduler.is_direct() {
            true => self.run_direct(),
            false => self.run_polled(),
        };

        if let Err(error) = &outcome {
            error!(error = ?error, "Job runner {} failed: {error}", self.index);
            self.queue.poison();
        }

        outcome
    }

    /// Submit jobs while there is headroom, poll the scheduler in between
    /// and keep polling after the queue closes until the store confirms
    /// that no run is live anymore.
    fn run_polled(&mut self) -> Result<(), WorkerError> {
        debug!("Job runner {} waits for the scheduler to settle", self.index);
        thread::sleep(self.timing.init_sleep);

        loop {
            if self.active_jobs < self.max_active_jobs {
                match self.queue.get_timeout(self.timing.queue_timeout) {
                    Ok(job) => {
                        self.submit(&job)?;
                        continue;
                    }
                    Err(QueueError::Empty) => {}
                    Err(QueueError::Closed) => break,
                    Err(error) => return Err(error.into()),
                }
            } else {
                thread::sleep(self.timing.status_sleep);
            }

            let retired = self.poll_once()?;
            self.active_jobs = self.active_jobs.saturating_sub(retired);
        }

        while self.connection.count_live_runs(self.session_id)? > 0 {
            thread::sleep(self.timing.status_sleep);
            let retired = self.poll_once()?;
            self.active_jobs = self.active_jobs.saturating_sub(retired);
        }

        thread::sleep(self.timing.exit_sleep);
        debug!("Job runner {} is done", self.index);

        Ok(())
    }

    /// Run each job in place. The descriptor carries a preassigned job id,
    /// there is no scheduler to hand one out.
    fn run_direct(&mut self) -> Result<(), WorkerError> {
        loop {
            let job = match self.queue.get_timeout(self.timing.queue_timeout) {
                Ok(job) => job,
                Err(QueueError::Empty) => continue,
                Err(QueueError::Closed) => break,
                Err(error) => return Err(error.into()),
            };

            let job_id = job.job_id.clone().unwrap_or_else(|| "0".to_owned());
            let run_id = match job.run_id {
                Some(run_id) => run_id,
                None => self.connection.insert_run(
                    job.session_id,
                    &job.worldfile,
                    &job.parameters,
                    &job.cmd_raw,
                    &job.output_path,
                    &job_id,
                )?,
            };

            self.connection.update_run_status(run_id, RunStatus::Run)?;
            let status = self.scheduler.execute_direct(&job, &job_id)?;
            self.connection
                .update_run_endtime(run_id, Utc::now(), status)?;
            info!("Run {run_id} (job {job_id}) finished as {status}");
            self.queue.task_done()?;
        }

        debug!("Job runner {} is done", self.index);

        Ok(())
    }

    /// Push one job to the scheduler and record the job id it hands out.
    fn submit(&mut self, job: &JobDescriptor) -> Result<(), WorkerError> {
        if let Some(run_id) = job.run_id {
            match self.connection.get_run(run_id)? {
                // on restart, a run can retire through an earlier poll
                // before its descriptor comes up for resubmission
                Some(run) if run.status.is_terminal() => {
                    info!(
                        "Run {run_id} already finished as {}, not resubmitting",
                        run.status
                    );

                    return Ok(());
                }
                Some(_) => {}
                None => return Err(ConnectionError::NotFound(run_id).into()),
            }
        }

        let options = self.config.submit_options();
        let command = self.scheduler.build_submit_command(job, &options)?;
        debug!("Submitting: {command}");
        let output = run_shell(&command, &self.config.rhessys_path())?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let job_id = self.scheduler.parse_submit_output(&command, &stdout, &stderr)?;

        match job.run_id {
            Some(run_id) => {
                self.connection.update_run_job_id(run_id, &job_id)?;
                info!("Resubmitted run {run_id} as job {job_id}");
            }
            None => {
                let run_id = self.connection.insert_run(
                    job.session_id,
                    &job.worldfile,
                    &job.parameters,
                    &job.cmd_raw,
                    &job.output_path,
                    &job_id,
                )?;
                info!("Submitted run {run_id} as job {job_id}");
            }
        }

        self.active_jobs += 1;

        Ok(())
    }

    /// One pass over the scheduler's status report. Lines that do not
    /// parse are noise, job ids without a stored run in this session
    /// belong to someone else, and runs that are already retired stay
    /// retired, whatever a stale report claims. Returns how many runs
    /// were retired in this pass.
    fn poll_once(&self) -> Result<u32, WorkerError> {
        let command = self.scheduler.build_status_command();
        let output = run_shell(&command, &self.config.rhessys_path())?;
        let stdout = String::from_utf8_lossy(&output.stdout);

        let mut retired = 0;
        for line in stdout.lines() {
            let (job_id, code) = match self.scheduler.parse_status_line(line) {
                Some(parsed) => parsed,
                None => continue,
            };
            let run = match self.connection.get_run_in_session(self.session_id, &job_id)? {
                Some(run) => run,
                None => continue,
            };
            if run.status.is_terminal() {
                continue;
            }

            let status = self.scheduler.map_status_code(&code)?;
            if status == run.status {
                continue;
            }

            if status.is_terminal() {
                self.connection
                    .update_run_endtime(run.id, Utc::now(), status)?;
                info!("Run {} (job {job_id}) finished as {status}", run.id);
                retired += 1;
                self.queue.task_done()?;
            } else {
                self.connection.update_run_status(run.id, status)?;
                debug!("Run {} (job {job_id}) moved to {status}", run.id);
            }
        }

        Ok(retired)
    }
}
