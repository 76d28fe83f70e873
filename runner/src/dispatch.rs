use crate::{
    collector,
    config::{ConfigErrors, DispatchConfig, ParallelMode},
    database::{ConnectionError, SessionStatus, SharedConnection},
    params,
    params::{CalibrationValues, ParamSpec, TemplateError},
    queue::{DispatchQueue, QueueError},
    scheduler::Schedulers,
};
use chrono::Utc;
use itertools::Itertools;
use std::{collections::BTreeMap, fs, path::Path, thread};
use thiserror::Error;
use tracing::{error, info, warn};
use worker::{JobRunner, PollTiming, WorkerError};

pub mod worker;

#[cfg(test)]
mod dispatch_test;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error(transparent)]
    Worker(#[from] WorkerError),
    #[error("A job runner thread panicked")]
    WorkerPanic,
    #[error("The job record store failed")]
    Store(#[from] ConnectionError),
    #[error("The session setup was invalid")]
    Config(#[from] ConfigErrors),
    #[error("IO operation failed")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error("Queue protocol violation")]
    Queue(#[from] QueueError),
    #[error("No session {0} in the store")]
    UnknownSession(i64),
}

/// Everything a job runner needs to submit one calibration run.
#[derive(Debug, Clone)]
pub struct JobDescriptor {
    pub session_id: i64,
    pub worldfile: String,
    pub parameters: CalibrationValues,
    pub cmd_raw: String,
    pub output_path: String,
    /// preassigned job id, only used by the local subprocess backend
    pub job_id: Option<String>,
    /// run row to resubmit, set when restarting a session
    pub run_id: Option<i64>,
}

/// Owns one dispatch invocation end to end: builds the job descriptors,
/// feeds them through the bounded queue to the job runners and settles the
/// session record when the queue drains.
pub struct DispatchCoordinator {
    config: DispatchConfig,
    connection: SharedConnection,
    timing: PollTiming,
}

impl DispatchCoordinator {
    pub fn new(config: DispatchConfig, connection: SharedConnection) -> Self {
        let timing = PollTiming::from_multiplier(config.polling_delay);

        Self {
            config,
            connection,
            timing,
        }
    }

    #[cfg(test)]
    fn with_timing(config: DispatchConfig, connection: SharedConnection, timing: PollTiming) -> Self {
        Self {
            config,
            connection,
            timing,
        }
    }

    /// Dispatch a new session, or resubmit an aborted one. Returns the
    /// session id once every run is retired.
    pub fn run(&self) -> Result<i64, DispatchError> {
        match self.config.restart_session {
            Some(session_id) => self.restart(session_id),
            None => self.dispatch_new(),
        }
    }

    fn dispatch_new(&self) -> Result<i64, DispatchError> {
        self.config.validate_capacity()?;

        let template = fs::read_to_string(self.config.cmd_proto_path())?;
        let template = template.trim();
        let spec = ParamSpec::from_template(template, self.config.sv_mirrors_s)?;

        let worldfiles = collector::worldfiles(&self.config)?;
        if template.contains("$flowtable") {
            collector::verify_flow_tables(&self.config, &worldfiles)?;
        }
        let tecfile = collector::tecfile(&self.config)?;
        let binary = collector::rhessys_binary(&self.config)?;

        let session_id = self.connection.insert_session(
            &self.config.user,
            &self.config.project,
            self.config.notes.as_deref(),
            self.config.iterations,
            self.config.processes,
            &self.config.basedir.to_string_lossy(),
            template,
        )?;
        info!(
            "Opened session {session_id}: {} iterations over {} worldfiles",
            self.config.iterations,
            worldfiles.len()
        );

        // the model binary and tecfile are the same for every run
        let mut session_variables = BTreeMap::new();
        session_variables.insert("rhessys".to_owned(), binary);
        session_variables.insert("tecfile".to_owned(), tecfile);
        let template = params::substitute(template, &session_variables);

        let jobs = self.build_jobs(session_id, &template, &spec, &worldfiles)?;

        self.run_session(session_id, self.config.processes, jobs)
    }

    /// Draw one parameter set per iteration and expand it into a descriptor
    /// per worldfile, each with its own output directory.
    fn build_jobs(
        &self,
        session_id: i64,
        template: &str,
        spec: &ParamSpec,
        worldfiles: &BTreeMap<String, String>,
    ) -> Result<Vec<JobDescriptor>, DispatchError> {
        let direct = self.config.parallel_mode == ParallelMode::Process;
        let mut rng = rand::rng();
        let mut jobs = Vec::new();

        for iteration in 1..=self.config.iterations {
            let values = spec.generate(&mut rng);

            for (worldfile, worldfile_path) in worldfiles {
                let output_path = self.create_output_path(session_id, worldfile, iteration)?;
                let mut variables = values.to_map();
                variables.insert("worldfile".to_owned(), worldfile_path.clone());
                variables.insert(
                    "flowtable".to_owned(),
                    collector::flow_table_path(worldfile),
                );
                variables.insert("output_path".to_owned(), format!("{output_path}/rhessys"));

                jobs.push(JobDescriptor {
                    session_id,
                    worldfile: worldfile.clone(),
                    parameters: values,
                    cmd_raw: params::substitute(template, &variables),
                    output_path,
                    job_id: direct.then(|| iteration.to_string()),
                    run_id: None,
                });
            }
        }

        Ok(jobs)
    }

    fn create_output_path(
        &self,
        session_id: i64,
        worldfile: &str,
        iteration: u32,
    ) -> Result<String, DispatchError> {
        let relative = format!("output/SESSION_{session_id}_{worldfile}_ITR_{iteration}");
        fs::create_dir_all(self.config.rhessys_path().join(&relative))?;

        Ok(relative)
    }

    fn restart(&self, session_id: i64) -> Result<i64, DispatchError> {
        let session = self
            .connection
            .get_session(session_id)?
            .ok_or(DispatchError::UnknownSession(session_id))?;

        if Path::new(&session.basedir) != self.config.basedir {
            warn!(
                "Session {session_id} was started from {}, not {}",
                session.basedir,
                self.config.basedir.to_string_lossy()
            );
        }

        let unfinished = self
            .connection
            .get_runs_in_session(session_id, Some("status not in ('DONE', 'EXIT')"))?;
        if unfinished.is_empty() {
            info!("Session {session_id} has no unfinished runs");
            self.connection.update_session_endtime(
                session_id,
                Utc::now(),
                SessionStatus::Complete,
            )?;

            return Ok(session_id);
        }
        info!(
            "Resubmitting {} unfinished runs of session {session_id}",
            unfinished.len()
        );

        let direct = self.config.parallel_mode == ParallelMode::Process;
        let jobs = unfinished
            .into_iter()
            .map(|run| JobDescriptor {
                session_id,
                run_id: Some(run.id),
                job_id: direct.then(|| run.job_id.clone()),
                worldfile: run.worldfile,
                parameters: run.parameters,
                cmd_raw: run.cmd_raw,
                output_path: run.output_path,
            })
            .collect_vec();

        self.run_session(session_id, session.processes, jobs)
    }

    /// Feed the descriptors to a set of job runners and wait for every run
    /// to be retired. The queue also bounds the backlog, so a stalled
    /// scheduler backpressures right up to this producer.
    fn run_session(
        &self,
        session_id: i64,
        processes: u32,
        jobs: Vec<JobDescriptor>,
    ) -> Result<i64, DispatchError> {
        let scheduler = Schedulers::load(&self.config);
        let queue = DispatchQueue::new(processes as usize);
        let workers = match scheduler.is_direct() {
            // local subprocesses occupy their runner, polled backends share one
            true => processes,
            false => 1,
        };

        let handles = (0..workers)
            .map(|index| {
                let runner = JobRunner::new(
                    index,
                    session_id,
                    self.config.clone(),
                    self.connection.clone(),
                    queue.clone(),
                    scheduler.clone(),
                    self.timing,
                    processes,
                );

                thread::spawn(move || runner.run())
            })
            .collect_vec();

        let produced: Result<(), DispatchError> = (|| {
            for job in jobs {
                queue.put(job)?;
            }
            queue.close();
            queue.join()?;

            Ok(())
        })();

        let mut failure = None;
        for handle in handles {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    error!(error = ?error, "A job runner failed: {error}");
                    failure.get_or_insert(DispatchError::Worker(error));
                }
                Err(_) => {
                    error!("A job runner panicked");
                    failure.get_or_insert(DispatchError::WorkerPanic);
                }
            }
        }

        // a failed session keeps status submitted and no end time, the
        // durable sign that it needs to be restarted
        if let Some(error) = failure.or(produced.err()) {
            return Err(error);
        }

        self.connection.update_session_endtime(
            session_id,
            Utc::now(),
            SessionStatus::Complete,
        )?;
        info!("Session {session_id} is complete");

        Ok(session_id)
    }
}
