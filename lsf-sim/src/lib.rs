//! A stand-in LSF command pair for dry runs: `bsub` queues jobs in a local
//! SQLite table, `bjobs` lists them while nudging each towards completion.

use rand::{rngs::StdRng, Rng, SeedableRng};
use rusqlite::{params, Connection};
use std::path::Path;

/// Queue reported for every simulated job.
pub const DEFAULT_QUEUE: &str = "chunk";

/// Chance that a pending job stays pending on one listing.
pub const RUN_THRESHOLD: f64 = 0.10;
/// Chance that a running job keeps running on one listing.
pub const DONE_THRESHOLD: f64 = 0.75;

const SQL_SCHEMA: &str = "create table if not exists jobs (
    lsf_job_id integer primary key,
    raw_cmd text not null,
    lsf_stat text not null default 'PEND' check (lsf_stat in
        ('PEND', 'RUN', 'PSUSP', 'USUSP', 'SSUSP', 'DONE', 'EXIT', 'UNKWN', 'WAIT', 'ZOMBI'))
);";

/// The job table both commands work against.
pub struct SimStore {
    connection: Connection,
}

impl SimStore {
    /// Open the shared job table, at `LSF_SIM_DB` or in the working directory.
    pub fn open() -> Result<Self, rusqlite::Error> {
        let path = std::env::var("LSF_SIM_DB").unwrap_or_else(|_| "lsf-sim.db".to_owned());

        Self::open_at(Path::new(&path))
    }

    pub fn open_at(path: &Path) -> Result<Self, rusqlite::Error> {
        let connection = Connection::open(path)?;
        connection.execute(SQL_SCHEMA, ())?;

        Ok(Self { connection })
    }

    pub fn insert_job(&self, job_id: u32, raw_cmd: &str) -> Result<(), rusqlite::Error> {
        self.connection.execute(
            "insert into jobs (lsf_job_id, raw_cmd) values (?, ?)",
            params![job_id, raw_cmd],
        )?;

        Ok(())
    }

    /// All jobs with their current status, in submission order.
    pub fn jobs(&self) -> Result<Vec<(u32, String)>, rusqlite::Error> {
        let mut statement = self
            .connection
            .prepare("select lsf_job_id, lsf_stat from jobs order by rowid")?;
        let rows = statement.query_map((), |row| Ok((row.get(0)?, row.get(1)?)))?;

        rows.collect()
    }

    pub fn update_status(&self, job_id: u32, status: &str) -> Result<(), rusqlite::Error> {
        self.connection.execute(
            "update jobs set lsf_stat = ? where lsf_job_id = ?",
            params![status, job_id],
        )?;

        Ok(())
    }
}

/// Deterministic when `LSF_SIM_SEED` is set, to make dry runs repeatable.
pub fn seeded_rng() -> StdRng {
    match std::env::var("LSF_SIM_SEED")
        .ok()
        .and_then(|seed| seed.parse().ok())
    {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    }
}

/// Jobs drift towards completion a little on every listing.
pub fn promote<R: Rng>(rng: &mut R, status: &str) -> Option<&'static str> {
    match status {
        "PEND" if rng.random::<f64>() > RUN_THRESHOLD => Some("RUN"),
        "RUN" if rng.random::<f64>() > DONE_THRESHOLD => Some("DONE"),
        _ => None,
    }
}

pub fn submit_line(job_id: u32, queue: &str) -> String {
    format!("Job <{job_id}> is submitted to the default queue <{queue}>.")
}

pub fn header() -> String {
    format!(
        "{:<10}{:<8}{:<6}{:<11}{:<12}{:<12}{:<11}{:<12}",
        "JOBID", "USER", "STAT", "QUEUE", "FROM_HOST", "EXEC_HOST", "JOB_NAME", "SUBMIT_TIME"
    )
}

pub fn job_line(job_id: u32, status: &str) -> String {
    format!(
        "{:<10}{:<8}{:<6}{:<11}{:<12}{:<12}{:<11}{:<12}",
        job_id, "simuser", status, DEFAULT_QUEUE, "localhost", "localhost", "sim", "Jun 10 00:00"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_submit_line_matches_what_clusters_print() {
        assert_eq!(
            submit_line(42, "chunk"),
            "Job <42> is submitted to the default queue <chunk>."
        );
    }

    #[test]
    fn finished_jobs_are_never_promoted() {
        let mut rng = StdRng::seed_from_u64(7);

        for _ in 0..200 {
            assert_eq!(promote(&mut rng, "DONE"), None);
            assert_eq!(promote(&mut rng, "EXIT"), None);
        }
    }

    #[test]
    fn pending_jobs_only_ever_start_running() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut promoted = 0;

        for _ in 0..200 {
            match promote(&mut rng, "PEND") {
                Some("RUN") => promoted += 1,
                Some(other) => panic!("unexpected promotion to {other}"),
                None => {}
            }
        }

        assert!(promoted > 100);
    }

    #[test]
    fn running_jobs_only_ever_finish() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut finished = 0;
        let mut held = 0;

        for _ in 0..200 {
            match promote(&mut rng, "RUN") {
                Some("DONE") => finished += 1,
                Some(other) => panic!("unexpected promotion to {other}"),
                None => held += 1,
            }
        }

        assert!(finished > 0);
        assert!(held > 0);
    }

    #[test]
    fn the_job_table_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = SimStore::open_at(&dir.path().join("sim.db")).unwrap();

        store.insert_job(42, "echo hi").unwrap();
        store.insert_job(43, "echo ho").unwrap();
        store.update_status(42, "RUN").unwrap();

        let jobs = store.jobs().unwrap();
        assert_eq!(jobs, vec![(42, "RUN".to_owned()), (43, "PEND".to_owned())]);
    }

    #[test]
    fn listing_rows_line_up_with_the_header() {
        let header = header();
        let row = job_line(7, "PEND");

        assert!(header.starts_with("JOBID"));
        assert_eq!(header.find("STAT"), row.find("PEND"));
    }
}
