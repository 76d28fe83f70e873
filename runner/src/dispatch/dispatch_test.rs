use super::{
    worker::{PollTiming, WorkerError},
    DispatchCoordinator, DispatchError,
};
use crate::{
    config,
    config::{DispatchConfig, ParallelMode},
    database::{RunStatus, SessionStatus, SharedConnection},
    params::CalibrationValues,
    scheduler::SchedulerError,
};
use chrono::Utc;
use itertools::Itertools;
use std::{
    fs,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};
use tempfile::TempDir;

struct Harness {
    _dir: TempDir,
    base: PathBuf,
    sim: PathBuf,
    connection: SharedConnection,
}

fn write_script(dir: &Path, name: &str, body: &str) {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
}

fn write_listing(sim: &Path, rows: &[(&str, &str)]) {
    let mut listing = String::from(
        "JOBID     USER    STAT  QUEUE      FROM_HOST   EXEC_HOST   JOB_NAME   SUBMIT_TIME\n",
    );
    for (job_id, code) in rows {
        listing.push_str(&format!(
            "{job_id:<10}tester  {code:<6}day        hostA       hostB       sim        Jun 10 00:00\n"
        ));
    }
    fs::write(sim.join("bjobs.listing"), listing).unwrap();
}

fn submit_count(sim: &Path) -> u32 {
    fs::read_to_string(sim.join("bsub.count"))
        .map(|count| count.trim().parse().unwrap_or(0))
        .unwrap_or(0)
}

fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let started = Instant::now();
    while started.elapsed() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }

    false
}

fn fast_timing() -> PollTiming {
    PollTiming {
        init_sleep: Duration::from_millis(1),
        status_sleep: Duration::from_millis(5),
        queue_timeout: Duration::from_millis(50),
        exit_sleep: Duration::from_millis(1),
    }
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("base");
    config::scaffold(&base).unwrap();
    fs::write(base.join("rhessys/worldfiles/active/basin.world"), "world").unwrap();
    fs::write(base.join("rhessys/flow/basin.world_flow_table.dat"), "flow").unwrap();
    fs::write(base.join("rhessys/tecfiles/active/outputs.tec"), "tec").unwrap();
    write_script(&base.join("rhessys/bin"), "rhessys", "echo simulated $*");

    let sim = dir.path().join("sim");
    fs::create_dir_all(&sim).unwrap();
    write_script(
        &sim,
        "bsub",
        "count=$(cat \"$0.count\" 2>/dev/null || echo 0)\n\
         count=$((count + 1))\n\
         echo \"$count\" > \"$0.count\"\n\
         echo \"Job <$count> is submitted to queue <day>.\"",
    );
    write_script(&sim, "bjobs", "cat \"$0.listing\" 2>/dev/null\nexit 0");
    write_listing(&sim, &[]);

    let mut connection = SharedConnection::load(&base.join("db/calibration.db")).unwrap();
    connection.init().unwrap();

    Harness {
        _dir: dir,
        base,
        sim,
        connection,
    }
}

fn dispatch_config(
    harness: &Harness,
    mode: ParallelMode,
    iterations: u32,
    processes: u32,
) -> DispatchConfig {
    DispatchConfig {
        basedir: harness.base.clone(),
        user: "tester".to_owned(),
        project: "e2e".to_owned(),
        notes: Some("end to end".to_owned()),
        iterations,
        processes,
        queue: "day".to_owned(),
        parallel_mode: mode,
        polling_delay: 1,
        mem_limit_gb: None,
        wall_time_minutes: None,
        exclusive: false,
        simulator_path: matches!(mode, ParallelMode::Lsf).then(|| harness.sim.clone()),
        restart_session: None,
        sv_mirrors_s: false,
    }
}

fn coordinator(harness: &Harness, config: DispatchConfig) -> DispatchCoordinator {
    DispatchCoordinator::with_timing(config, harness.connection.clone(), fast_timing())
}

fn insert_run(harness: &Harness, session_id: i64, job_id: &str) -> i64 {
    harness
        .connection
        .insert_run(
            session_id,
            "basin.world",
            &CalibrationValues::default(),
            "echo run",
            "output/test",
            job_id,
        )
        .unwrap()
}

#[test]
fn a_polled_session_drains_to_completion() {
    let harness = harness();
    write_listing(
        &harness.sim,
        &[("1", "DONE"), ("2", "DONE"), ("3", "DONE"), ("4", "DONE")],
    );

    let session_id = coordinator(&harness, dispatch_config(&harness, ParallelMode::Lsf, 4, 2))
        .run()
        .unwrap();

    let session = harness.connection.get_session(session_id).unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::Complete);
    assert!(session.endtime.is_some());
    assert_eq!(session.cmd_proto, config::DEFAULT_CMD_PROTO);
    assert_eq!(session.iterations, 4);
    assert_eq!(session.processes, 2);

    let runs = harness
        .connection
        .get_runs_in_session(session_id, None)
        .unwrap();
    assert_eq!(runs.len(), 4);
    for (index, run) in runs.iter().enumerate() {
        assert_eq!(run.job_id, (index + 1).to_string());
        assert_eq!(run.status, RunStatus::Done);
        assert!(run.endtime.is_some());
        assert_eq!(run.worldfile, "basin.world");
        assert!(run.cmd_raw.starts_with("bin/rhessys "));
        assert!(run.cmd_raw.contains("-w worldfiles/active/basin.world"));
        assert!(run.cmd_raw.contains("-r flow/basin.world_flow_table.dat"));
        assert!(run.cmd_raw.contains("-t tecfiles/active/outputs.tec"));
        assert!(run
            .cmd_raw
            .contains(&format!("-pre {}/rhessys", run.output_path)));
        assert!(harness.base.join("rhessys").join(&run.output_path).is_dir());

        let s1 = run.parameters.s1.unwrap();
        assert!((0.01..=20.0).contains(&s1));
        let gw1 = run.parameters.gw1.unwrap();
        assert!((0.001..=0.3).contains(&gw1));
    }

    assert_eq!(submit_count(&harness.sim), 4);
}

#[test]
fn active_jobs_stay_within_the_session_limit() {
    let harness = harness();
    write_listing(&harness.sim, &[("1", "RUN"), ("2", "RUN")]);

    let coordinator = coordinator(&harness, dispatch_config(&harness, ParallelMode::Lsf, 4, 2));
    let session = thread::spawn(move || coordinator.run());

    assert!(wait_until(Duration::from_secs(10), || {
        submit_count(&harness.sim) == 2
    }));
    thread::sleep(Duration::from_millis(100));
    // both slots are occupied and nothing finished, submission stalls
    assert_eq!(submit_count(&harness.sim), 2);

    write_listing(
        &harness.sim,
        &[("1", "DONE"), ("2", "DONE"), ("3", "DONE"), ("4", "DONE")],
    );
    let session_id = session.join().unwrap().unwrap();

    assert_eq!(submit_count(&harness.sim), 4);
    assert_eq!(harness.connection.count_live_runs(session_id).unwrap(), 0);
}

#[test]
fn local_subprocess_sessions_run_to_completion() {
    let harness = harness();

    let session_id = coordinator(
        &harness,
        dispatch_config(&harness, ParallelMode::Process, 3, 2),
    )
    .run()
    .unwrap();

    let session = harness.connection.get_session(session_id).unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::Complete);

    let runs = harness
        .connection
        .get_runs_in_session(session_id, None)
        .unwrap();
    assert_eq!(runs.len(), 3);
    for run in &runs {
        assert_eq!(run.status, RunStatus::Done);
        assert!(run.endtime.is_some());

        let stdout = fs::read_to_string(
            harness
                .base
                .join("rhessys")
                .join(&run.output_path)
                .join(format!("{}.out", run.job_id)),
        )
        .unwrap();
        assert!(stdout.starts_with("simulated"));
    }

    let job_ids = runs.iter().map(|run| run.job_id.clone()).sorted().collect_vec();
    assert_eq!(job_ids, ["1", "2", "3"]);
}

#[test]
fn a_protocol_violation_leaves_the_session_submitted() {
    let harness = harness();
    write_script(&harness.sim, "bsub", "echo \"ERROR: not authorized\"");

    let result = coordinator(&harness, dispatch_config(&harness, ParallelMode::Lsf, 1, 1)).run();

    assert!(matches!(
        result,
        Err(DispatchError::Worker(WorkerError::Scheduler(
            SchedulerError::Protocol { .. }
        )))
    ));
    // no end time and no terminal status, the durable crash signal
    let session = harness.connection.get_session(1).unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::Submitted);
    assert!(session.endtime.is_none());
    assert!(harness
        .connection
        .get_runs_in_session(1, None)
        .unwrap()
        .is_empty());
}

#[test]
fn restarting_resubmits_only_unfinished_runs() {
    let harness = harness();
    let session_id = harness
        .connection
        .insert_session(
            "tester",
            "e2e",
            None,
            3,
            2,
            &harness.base.to_string_lossy(),
            "echo",
        )
        .unwrap();
    let finished = insert_run(&harness, session_id, "10");
    harness
        .connection
        .update_run_endtime(finished, Utc::now(), RunStatus::Done)
        .unwrap();
    let pending = insert_run(&harness, session_id, "11");
    let running = insert_run(&harness, session_id, "12");
    harness
        .connection
        .update_run_status(running, RunStatus::Run)
        .unwrap();

    write_listing(&harness.sim, &[("1", "DONE"), ("2", "DONE")]);
    let mut config = dispatch_config(&harness, ParallelMode::Lsf, 0, 0);
    config.restart_session = Some(session_id);

    let settled = coordinator(&harness, config).run().unwrap();
    assert_eq!(settled, session_id);

    let session = harness.connection.get_session(session_id).unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::Complete);

    let untouched = harness.connection.get_run(finished).unwrap().unwrap();
    assert_eq!(untouched.job_id, "10");

    let resubmitted = harness.connection.get_run(pending).unwrap().unwrap();
    assert_eq!(resubmitted.job_id, "1");
    assert_eq!(resubmitted.status, RunStatus::Done);

    let resubmitted = harness.connection.get_run(running).unwrap().unwrap();
    assert_eq!(resubmitted.job_id, "2");
    assert_eq!(resubmitted.status, RunStatus::Done);

    // resubmission reuses the existing records
    let runs = harness
        .connection
        .get_runs_in_session(session_id, None)
        .unwrap();
    assert_eq!(runs.len(), 3);
    assert_eq!(submit_count(&harness.sim), 2);
}

#[test]
fn restarting_a_finished_session_just_settles_it() {
    let harness = harness();
    let session_id = harness
        .connection
        .insert_session(
            "tester",
            "e2e",
            None,
            1,
            1,
            &harness.base.to_string_lossy(),
            "echo",
        )
        .unwrap();
    let finished = insert_run(&harness, session_id, "10");
    harness
        .connection
        .update_run_endtime(finished, Utc::now(), RunStatus::Exit)
        .unwrap();

    let mut config = dispatch_config(&harness, ParallelMode::Lsf, 0, 0);
    config.restart_session = Some(session_id);

    coordinator(&harness, config).run().unwrap();

    let session = harness.connection.get_session(session_id).unwrap().unwrap();
    assert_eq!(session.status, SessionStatus::Complete);
    assert_eq!(submit_count(&harness.sim), 0);
}

#[test]
fn restarting_an_unknown_session_fails() {
    let harness = harness();
    let mut config = dispatch_config(&harness, ParallelMode::Lsf, 0, 0);
    config.restart_session = Some(99);

    assert!(matches!(
        coordinator(&harness, config).run(),
        Err(DispatchError::UnknownSession(99))
    ));
}
