pub mod sqlite;
#[cfg(test)]
mod sqlite_test;

use crate::params::CalibrationValues;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("SQLite error: {0}")]
    SQLite(#[from] rusqlite::Error),
    #[error("No run with id {0} exists")]
    NotFound(i64),
    #[error(transparent)]
    BadStatus(#[from] UnknownStatusCode),
}

/// Status text outside the ten-code vocabulary the store accepts.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown status code: {0}")]
pub struct UnknownStatusCode(pub String);

/// Lifecycle of one dispatched model run, following the LSF status vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Pend,
    Run,
    Pusp,
    Ususp,
    Ssusp,
    Done,
    Exit,
    Unkwn,
    Wait,
    Zombi,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pend => "PEND",
            Self::Run => "RUN",
            Self::Pusp => "PUSP",
            Self::Ususp => "USUSP",
            Self::Ssusp => "SSUSP",
            Self::Done => "DONE",
            Self::Exit => "EXIT",
            Self::Unkwn => "UNKWN",
            Self::Wait => "WAIT",
            Self::Zombi => "ZOMBI",
        }
    }

    /// DONE and EXIT never change again, everything else is still in flight.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Exit)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = UnknownStatusCode;

    fn from_str(code: &str) -> Result<Self, Self::Err> {
        match code {
            "PEND" => Ok(Self::Pend),
            "RUN" => Ok(Self::Run),
            "PUSP" => Ok(Self::Pusp),
            "USUSP" => Ok(Self::Ususp),
            "SSUSP" => Ok(Self::Ssusp),
            "DONE" => Ok(Self::Done),
            "EXIT" => Ok(Self::Exit),
            "UNKWN" => Ok(Self::Unkwn),
            "WAIT" => Ok(Self::Wait),
            "ZOMBI" => Ok(Self::Zombi),
            unknown => Err(UnknownStatusCode(unknown.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    Submitted,
    Complete,
    Aborted,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::Complete => "complete",
            Self::Aborted => "aborted",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = UnknownStatusCode;

    fn from_str(code: &str) -> Result<Self, Self::Err> {
        match code {
            "submitted" => Ok(Self::Submitted),
            "complete" => Ok(Self::Complete),
            "aborted" => Ok(Self::Aborted),
            unknown => Err(UnknownStatusCode(unknown.to_owned())),
        }
    }
}

/// One calibration session, the parent of every run it dispatched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: i64,
    pub starttime: DateTime<Utc>,
    pub endtime: Option<DateTime<Utc>>,
    pub user: String,
    pub project: String,
    pub notes: Option<String>,
    pub iterations: u32,
    pub processes: u32,
    pub basedir: String,
    pub cmd_proto: String,
    pub status: SessionStatus,
    pub obs_filename: Option<String>,
}

/// One dispatched model invocation and the scheduler identity it runs under.
///
/// `job_id` is only meaningful within its session, schedulers recycle ids
/// across restarts and the local backend numbers jobs by iteration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: i64,
    pub session_id: i64,
    pub starttime: DateTime<Utc>,
    pub endtime: Option<DateTime<Utc>>,
    pub worldfile: String,
    pub parameters: CalibrationValues,
    pub cmd_raw: String,
    pub output_path: String,
    pub job_id: String,
    pub status: RunStatus,
}
