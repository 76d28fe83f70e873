use super::{ConnectionError, Run, RunStatus, Session, SessionStatus};
use crate::params::CalibrationValues;
use chrono::{DateTime, Utc};
use parking_lot::{lock_api::ArcMutexGuard, FairMutex, RawFairMutex};
use rusqlite::{
    params,
    types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef},
    Connection, OptionalExtension, Row,
};
use std::{path::Path, str::FromStr, sync::Arc};
use tracing::{debug, error, info};
use tracing_unwrap::ResultExt;

#[derive(Debug, Clone)]
/// Transparent, thread safe wrapper over `InnerConnection`
pub struct SharedConnection(Arc<FairMutex<InnerConnection>>);

#[derive(Debug)]
pub struct InnerConnection {
    connection: Connection,
}

impl ToSql for RunStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for RunStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value.as_str().and_then(|text| {
            RunStatus::from_str(text).map_err(|error| FromSqlError::Other(Box::new(error)))
        })
    }
}

impl ToSql for SessionStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for SessionStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value.as_str().and_then(|text| {
            SessionStatus::from_str(text).map_err(|error| FromSqlError::Other(Box::new(error)))
        })
    }
}

impl SharedConnection {
    pub fn new(inner_connection: InnerConnection) -> Self {
        Self(Arc::new(FairMutex::new(inner_connection)))
    }

    fn lock_mut(&mut self) -> ArcMutexGuard<RawFairMutex, InnerConnection> {
        self.0.lock_arc()
    }

    fn lock(&self) -> ArcMutexGuard<RawFairMutex, InnerConnection> {
        self.0.lock_arc()
    }

    pub fn load(path: &Path) -> Result<Self, ConnectionError> {
        Ok(Self::new(InnerConnection::load(path)?))
    }

    pub fn init(&mut self) -> Result<(), ConnectionError> {
        self.lock_mut().init()
    }

    pub fn close(self) -> Result<(), ConnectionError> {
        Arc::try_unwrap(self.0).unwrap_or_log().into_inner().close()
    }

    #[allow(clippy::too_many_arguments)]
    pub fn insert_session(
        &self,
        user: &str,
        project: &str,
        notes: Option<&str>,
        iterations: u32,
        processes: u32,
        basedir: &str,
        cmd_proto: &str,
    ) -> Result<i64, ConnectionError> {
        self.lock()
            .insert_session(user, project, notes, iterations, processes, basedir, cmd_proto)
    }

    pub fn update_session_endtime(
        &self,
        id: i64,
        endtime: DateTime<Utc>,
        status: SessionStatus,
    ) -> Result<(), ConnectionError> {
        self.lock().update_session_endtime(id, endtime, status)
    }

    pub fn get_session(&self, id: i64) -> Result<Option<Session>, ConnectionError> {
        self.lock().get_session(id)
    }

    pub fn insert_run(
        &self,
        session_id: i64,
        worldfile: &str,
        parameters: &CalibrationValues,
        cmd_raw: &str,
        output_path: &str,
        job_id: &str,
    ) -> Result<i64, ConnectionError> {
        self.lock()
            .insert_run(session_id, worldfile, parameters, cmd_raw, output_path, job_id)
    }

    pub fn update_run_status(&self, id: i64, status: RunStatus) -> Result<(), ConnectionError> {
        self.lock().update_run_status(id, status)
    }

    pub fn update_run_endtime(
        &self,
        id: i64,
        endtime: DateTime<Utc>,
        status: RunStatus,
    ) -> Result<(), ConnectionError> {
        self.lock().update_run_endtime(id, endtime, status)
    }

    pub fn update_run_job_id(&self, id: i64, job_id: &str) -> Result<(), ConnectionError> {
        self.lock().update_run_job_id(id, job_id)
    }

    pub fn get_run(&self, id: i64) -> Result<Option<Run>, ConnectionError> {
        self.lock().get_run(id)
    }

    pub fn get_run_in_session(
        &self,
        session_id: i64,
        job_id: &str,
    ) -> Result<Option<Run>, ConnectionError> {
        self.lock().get_run_in_session(session_id, job_id)
    }

    pub fn get_runs_in_session(
        &self,
        session_id: i64,
        where_clause: Option<&str>,
    ) -> Result<Vec<Run>, ConnectionError> {
        self.lock().get_runs_in_session(session_id, where_clause)
    }

    pub fn count_live_runs(&self, session_id: i64) -> Result<u32, ConnectionError> {
        self.lock().count_live_runs(session_id)
    }
}

const SESSION_COLUMNS: &str = "id, starttime, endtime, user, project, notes, \
    iterations, processes, basedir, cmd_proto, status, obs_filename";

const RUN_COLUMNS: &str = "id, session_id, starttime, endtime, worldfile, \
    param_s1, param_s2, param_s3, param_sv1, param_sv2, param_gw1, param_gw2, \
    param_vgsen1, param_vgsen2, param_vgsen3, param_svalt1, param_svalt2, \
    cmd_raw, output_path, job_id, status";

fn session_from_row(row: &Row) -> rusqlite::Result<Session> {
    Ok(Session {
        id: row.get(0)?,
        starttime: row.get(1)?,
        endtime: row.get(2)?,
        user: row.get(3)?,
        project: row.get(4)?,
        notes: row.get(5)?,
        iterations: row.get(6)?,
        processes: row.get(7)?,
        basedir: row.get(8)?,
        cmd_proto: row.get(9)?,
        status: row.get(10)?,
        obs_filename: row.get(11)?,
    })
}

fn run_from_row(row: &Row) -> rusqlite::Result<Run> {
    Ok(Run {
        id: row.get(0)?,
        session_id: row.get(1)?,
        starttime: row.get(2)?,
        endtime: row.get(3)?,
        worldfile: row.get(4)?,
        parameters: CalibrationValues {
            s1: row.get(5)?,
            s2: row.get(6)?,
            s3: row.get(7)?,
            sv1: row.get(8)?,
            sv2: row.get(9)?,
            gw1: row.get(10)?,
            gw2: row.get(11)?,
            vgsen1: row.get(12)?,
            vgsen2: row.get(13)?,
            vgsen3: row.get(14)?,
            svalt1: row.get(15)?,
            svalt2: row.get(16)?,
        },
        cmd_raw: row.get(17)?,
        output_path: row.get(18)?,
        job_id: row.get(19)?,
        status: row.get(20)?,
    })
}

impl InnerConnection {
    pub fn load(path: &Path) -> Result<Self, ConnectionError> {
        let connection = Connection::open(path)?;
        debug!("Opened SQLite connection at {}", path.to_string_lossy());

        Ok(Self { connection })
    }

    pub fn init(&mut self) -> Result<(), ConnectionError> {
        let mut counter = 1;

        for table in SQL_SCHEMA {
            match self.connection.execute(table, []) {
                Ok(_) => info!("Applied SQL schema ({counter}/{SQL_SCHEMA_NUMBER})"),
                Err(error) => {
                    error!(error = ?error, table = table, "Failed to apply SQL schema ({counter}/{SQL_SCHEMA_NUMBER}): {error}");

                    return Err(ConnectionError::SQLite(error));
                }
            };

            counter += 1;
        }

        Ok(())
    }

    pub fn close(mut self) -> Result<(), ConnectionError> {
        let mut counter = 0;

        while let Err((connection, error)) = self.connection.close() {
            counter += 1;
            self.connection = connection;

            error!(error = ?error, "Failed to close SQLite connection: {error}, trying again {counter}/3");

            if counter == 3 {
                error!("Failed to close connection, SOL");

                return Err(ConnectionError::SQLite(error));
            }
        }

        info!("Closed SQLite connection");

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn insert_session(
        &self,
        user: &str,
        project: &str,
        notes: Option<&str>,
        iterations: u32,
        processes: u32,
        basedir: &str,
        cmd_proto: &str,
    ) -> Result<i64, ConnectionError> {
        let id = self
            .connection
            .prepare_cached(
                "insert into session
                (starttime, user, project, notes, iterations, processes, basedir, cmd_proto, status)
                values (?, ?, ?, ?, ?, ?, ?, ?, ?)
                returning id",
            )?
            .query_row(
                params![
                    Utc::now(),
                    user,
                    project,
                    notes,
                    iterations,
                    processes,
                    basedir,
                    cmd_proto,
                    SessionStatus::Submitted
                ],
                |row| row.get(0),
            )?;

        info!(id = id, project = project, "Created session entry");

        Ok(id)
    }

    pub fn update_session_endtime(
        &self,
        id: i64,
        endtime: DateTime<Utc>,
        status: SessionStatus,
    ) -> Result<(), ConnectionError> {
        let affected = self
            .connection
            .prepare_cached("update session set endtime = ?, status = ? where id = ?")?
            .execute(params![endtime, status, id])?;

        if affected == 0 {
            return Err(ConnectionError::NotFound(id));
        }

        debug!(id = id, status = %status, "Updated session endtime");

        Ok(())
    }

    pub fn get_session(&self, id: i64) -> Result<Option<Session>, ConnectionError> {
        self.connection
            .prepare_cached(&format!("select {SESSION_COLUMNS} from session where id = ?"))?
            .query_row(params![id], session_from_row)
            .optional()
            .map_err(ConnectionError::SQLite)
    }

    pub fn insert_run(
        &self,
        session_id: i64,
        worldfile: &str,
        parameters: &CalibrationValues,
        cmd_raw: &str,
        output_path: &str,
        job_id: &str,
    ) -> Result<i64, ConnectionError> {
        let id = self
            .connection
            .prepare_cached(
                "insert into run
                (session_id, starttime, worldfile,
                 param_s1, param_s2, param_s3, param_sv1, param_sv2, param_gw1, param_gw2,
                 param_vgsen1, param_vgsen2, param_vgsen3, param_svalt1, param_svalt2,
                 cmd_raw, output_path, job_id, status)
                values (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                returning id",
            )?
            .query_row(
                params![
                    session_id,
                    Utc::now(),
                    worldfile,
                    parameters.s1,
                    parameters.s2,
                    parameters.s3,
                    parameters.sv1,
                    parameters.sv2,
                    parameters.gw1,
                    parameters.gw2,
                    parameters.vgsen1,
                    parameters.vgsen2,
                    parameters.vgsen3,
                    parameters.svalt1,
                    parameters.svalt2,
                    cmd_raw,
                    output_path,
                    job_id,
                    RunStatus::Pend
                ],
                |row| row.get(0),
            )?;

        debug!(id = id, job_id = job_id, "Created run entry");

        Ok(id)
    }

    pub fn update_run_status(&self, id: i64, status: RunStatus) -> Result<(), ConnectionError> {
        let affected = self
            .connection
            .prepare_cached("update run set status = ? where id = ?")?
            .execute(params![status, id])?;

        if affected == 0 {
            return Err(ConnectionError::NotFound(id));
        }

        debug!(id = id, status = %status, "Updated run status");

        Ok(())
    }

    pub fn update_run_endtime(
        &self,
        id: i64,
        endtime: DateTime<Utc>,
        status: RunStatus,
    ) -> Result<(), ConnectionError> {
        let affected = self
            .connection
            .prepare_cached("update run set endtime = ?, status = ? where id = ?")?
            .execute(params![endtime, status, id])?;

        if affected == 0 {
            return Err(ConnectionError::NotFound(id));
        }

        debug!(id = id, status = %status, "Retired run entry");

        Ok(())
    }

    pub fn update_run_job_id(&self, id: i64, job_id: &str) -> Result<(), ConnectionError> {
        let affected = self
            .connection
            .prepare_cached("update run set job_id = ? where id = ?")?
            .execute(params![job_id, id])?;

        if affected == 0 {
            return Err(ConnectionError::NotFound(id));
        }

        debug!(id = id, job_id = job_id, "Updated run job id");

        Ok(())
    }

    pub fn get_run(&self, id: i64) -> Result<Option<Run>, ConnectionError> {
        self.connection
            .prepare_cached(&format!("select {RUN_COLUMNS} from run where id = ?"))?
            .query_row(params![id], run_from_row)
            .optional()
            .map_err(ConnectionError::SQLite)
    }

    pub fn get_run_in_session(
        &self,
        session_id: i64,
        job_id: &str,
    ) -> Result<Option<Run>, ConnectionError> {
        self.connection
            .prepare_cached(&format!(
                "select {RUN_COLUMNS} from run where session_id = ? and job_id = ?"
            ))?
            .query_row(params![session_id, job_id], run_from_row)
            .optional()
            .map_err(ConnectionError::SQLite)
    }

    /// Fetch the runs of one session, optionally narrowed by a literal SQL
    /// condition such as `status not in ('DONE', 'EXIT')`.
    pub fn get_runs_in_session(
        &self,
        session_id: i64,
        where_clause: Option<&str>,
    ) -> Result<Vec<Run>, ConnectionError> {
        let mut query = format!("select {RUN_COLUMNS} from run where session_id = ?");
        if let Some(clause) = where_clause {
            query.push_str(" and ");
            query.push_str(clause);
        }
        query.push_str(" order by id");

        self.connection
            .prepare(&query)?
            .query_map(params![session_id], run_from_row)?
            .try_fold(Vec::new(), |mut init, result| {
                init.push(result?);

                Ok::<Vec<Run>, ConnectionError>(init)
            })
    }

    /// Number of runs in the session that have not reached a terminal status.
    pub fn count_live_runs(&self, session_id: i64) -> Result<u32, ConnectionError> {
        self.connection
            .prepare_cached(
                "select count(*) from run
                where session_id = ? and status not in ('DONE', 'EXIT')",
            )?
            .query_row(params![session_id], |row| row.get(0))
            .map_err(ConnectionError::SQLite)
    }
}

// Fitness columns stay null until the evaluation tooling fills them in after
// a session completes.
pub const SQL_SCHEMA: [&str; 3] = [
    "create table if not exists session (
    id integer primary key asc,
    starttime text not null,
    endtime text,
    user text not null,
    project text not null,
    notes text,
    iterations integer not null,
    processes integer not null,
    basedir text not null,
    cmd_proto text not null,
    status text not null check (status in ('submitted', 'complete', 'aborted')),
    obs_filename text
);",
    "create table if not exists run (
    id integer primary key asc,
    session_id integer not null references session (id),
    starttime text not null,
    endtime text,
    worldfile text not null,

    param_s1 real,
    param_s2 real,
    param_s3 real,
    param_sv1 real,
    param_sv2 real,
    param_gw1 real,
    param_gw2 real,
    param_vgsen1 real,
    param_vgsen2 real,
    param_vgsen3 real,
    param_svalt1 real,
    param_svalt2 real,

    cmd_raw text not null,
    output_path text not null,
    job_id text not null,
    status text not null check (status in
        ('PEND', 'RUN', 'PUSP', 'USUSP', 'SSUSP', 'DONE', 'EXIT', 'UNKWN', 'WAIT', 'ZOMBI')),

    nse real,
    nse_log real,
    pbias real,
    rsr real,
    user1 real,
    user2 real,
    user3 real,
    fitness_period text check
        (fitness_period in ('daily', 'weekly', 'monthly', 'yearly') or fitness_period is null)
);",
    "create index if not exists job_idx on run (job_id);",
];
pub const SQL_SCHEMA_NUMBER: usize = SQL_SCHEMA.len();
