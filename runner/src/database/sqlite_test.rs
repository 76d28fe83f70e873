use super::sqlite::SharedConnection;
use super::{ConnectionError, RunStatus, SessionStatus};
use crate::params::CalibrationValues;
use chrono::Utc;
use tempfile::TempDir;

fn open_store() -> (TempDir, SharedConnection) {
    let dir = tempfile::tempdir().unwrap();
    let mut connection = SharedConnection::load(&dir.path().join("calibration.db")).unwrap();
    connection.init().unwrap();

    (dir, connection)
}

fn insert_test_session(connection: &SharedConnection) -> i64 {
    connection
        .insert_session("tester", "unit", None, 4, 2, "/tmp/base", "echo -s $s1 $s2")
        .unwrap()
}

fn insert_test_run(connection: &SharedConnection, session_id: i64, job_id: &str) -> i64 {
    let parameters = CalibrationValues {
        s1: Some(1.5),
        s2: Some(42.0),
        ..CalibrationValues::default()
    };

    connection
        .insert_run(
            session_id,
            "basin.world",
            &parameters,
            "echo -s 1.5 42.0",
            "output/SESSION_1_basin.world_ITR_1",
            job_id,
        )
        .unwrap()
}

#[test]
fn schema_applies_on_reopened_store() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("calibration.db");

    let mut connection = SharedConnection::load(&path).unwrap();
    connection.init().unwrap();
    let session_id = insert_test_session(&connection);
    connection.close().unwrap();

    let mut connection = SharedConnection::load(&path).unwrap();
    connection.init().unwrap();
    assert!(connection.get_session(session_id).unwrap().is_some());
    connection.close().unwrap();
}

#[test]
fn session_round_trip() {
    let (_dir, connection) = open_store();
    let session_id = insert_test_session(&connection);

    let session = connection.get_session(session_id).unwrap().unwrap();
    assert_eq!(session.id, session_id);
    assert_eq!(session.user, "tester");
    assert_eq!(session.project, "unit");
    assert_eq!(session.iterations, 4);
    assert_eq!(session.processes, 2);
    assert_eq!(session.status, SessionStatus::Submitted);
    assert!(session.endtime.is_none());

    connection
        .update_session_endtime(session_id, Utc::now(), SessionStatus::Complete)
        .unwrap();
    let session = connection.get_session(session_id).unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::Complete);
    assert!(session.endtime.is_some());
}

#[test]
fn missing_session_is_none() {
    let (_dir, connection) = open_store();
    assert!(connection.get_session(4711).unwrap().is_none());
}

#[test]
fn run_round_trip() {
    let (_dir, connection) = open_store();
    let session_id = insert_test_session(&connection);
    let run_id = insert_test_run(&connection, session_id, "17");

    let run = connection.get_run(run_id).unwrap().unwrap();
    assert_eq!(run.session_id, session_id);
    assert_eq!(run.worldfile, "basin.world");
    assert_eq!(run.parameters.s1, Some(1.5));
    assert_eq!(run.parameters.s2, Some(42.0));
    assert_eq!(run.parameters.gw1, None);
    assert_eq!(run.job_id, "17");
    assert_eq!(run.status, RunStatus::Pend);
    assert!(run.endtime.is_none());

    assert!(connection.get_run(run_id + 1000).unwrap().is_none());
}

#[test]
fn job_id_lookup_is_scoped_to_the_session() {
    let (_dir, connection) = open_store();
    let first = insert_test_session(&connection);
    let second = insert_test_session(&connection);

    let run_in_first = insert_test_run(&connection, first, "42");
    let run_in_second = insert_test_run(&connection, second, "42");
    assert_ne!(run_in_first, run_in_second);

    let found = connection.get_run_in_session(first, "42").unwrap().unwrap();
    assert_eq!(found.id, run_in_first);

    let found = connection.get_run_in_session(second, "42").unwrap().unwrap();
    assert_eq!(found.id, run_in_second);

    assert!(connection.get_run_in_session(first, "43").unwrap().is_none());
}

#[test]
fn retirement_sets_endtime_and_status() {
    let (_dir, connection) = open_store();
    let session_id = insert_test_session(&connection);
    let run_id = insert_test_run(&connection, session_id, "1");

    assert_eq!(connection.count_live_runs(session_id).unwrap(), 1);

    connection
        .update_run_endtime(run_id, Utc::now(), RunStatus::Done)
        .unwrap();

    let run = connection.get_run(run_id).unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Done);
    assert!(run.endtime.is_some());
    assert_eq!(connection.count_live_runs(session_id).unwrap(), 0);
}

#[test]
fn status_updates_keep_the_run_live() {
    let (_dir, connection) = open_store();
    let session_id = insert_test_session(&connection);
    let run_id = insert_test_run(&connection, session_id, "1");

    connection.update_run_status(run_id, RunStatus::Run).unwrap();

    let run = connection.get_run(run_id).unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Run);
    assert!(run.endtime.is_none());
    assert_eq!(connection.count_live_runs(session_id).unwrap(), 1);
}

#[test]
fn job_id_can_be_reassigned() {
    let (_dir, connection) = open_store();
    let session_id = insert_test_session(&connection);
    let run_id = insert_test_run(&connection, session_id, "1");

    connection.update_run_job_id(run_id, "77").unwrap();

    assert!(connection.get_run_in_session(session_id, "1").unwrap().is_none());
    let found = connection.get_run_in_session(session_id, "77").unwrap().unwrap();
    assert_eq!(found.id, run_id);
}

#[test]
fn updates_on_missing_runs_are_rejected() {
    let (_dir, connection) = open_store();

    let result = connection.update_run_status(99, RunStatus::Run);
    assert!(matches!(result, Err(ConnectionError::NotFound(99))));

    let result = connection.update_run_job_id(99, "1");
    assert!(matches!(result, Err(ConnectionError::NotFound(99))));
}

#[test]
fn where_clause_narrows_session_runs() {
    let (_dir, connection) = open_store();
    let session_id = insert_test_session(&connection);

    let first = insert_test_run(&connection, session_id, "1");
    let second = insert_test_run(&connection, session_id, "2");
    insert_test_run(&connection, session_id, "3");

    connection
        .update_run_endtime(first, Utc::now(), RunStatus::Done)
        .unwrap();
    connection
        .update_run_endtime(second, Utc::now(), RunStatus::Exit)
        .unwrap();

    let all = connection.get_runs_in_session(session_id, None).unwrap();
    assert_eq!(all.len(), 3);

    let live = connection
        .get_runs_in_session(session_id, Some("status not in ('DONE', 'EXIT')"))
        .unwrap();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].job_id, "3");
}
