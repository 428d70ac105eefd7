use super::{local::LocalJobExecutor, ExecutorError, JobExecutor};
use crate::{
    job::{Job, JobError},
    status::Status,
};
use std::{
    collections::BTreeMap,
    fs,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

fn write_script(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("objective.sh");
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();

    path
}

fn executor<T>(dir: &Path, body: &str, n_max_jobs: usize) -> LocalJobExecutor<T> {
    let script = write_script(dir, body);

    LocalJobExecutor::new(&script, n_max_jobs, &dir.join("work"))
        .unwrap()
        .with_poll_interval(Duration::from_millis(20))
}

/// collect until `n` jobs were returned, panics after a generous deadline
fn drain<T>(executor: &mut LocalJobExecutor<T>, n: usize) -> Vec<Job<T>> {
    let deadline = Instant::now() + Duration::from_secs(20);
    let mut collected = Vec::new();

    while collected.len() < n {
        assert!(Instant::now() < deadline, "jobs did not finish in time");
        collected.extend(executor.collect_finished().unwrap());
        thread::sleep(Duration::from_millis(10));
    }

    collected
}

fn args(args: &[&str]) -> Vec<String> {
    args.iter().map(|arg| arg.to_string()).collect()
}

#[test]
pub fn submit_blocks_at_capacity() {
    let dir = tempfile::tempdir().unwrap();
    let mut executor = executor(dir.path(), "sleep 0.3", 2);

    assert_eq!(executor.available_slots(), 2);

    let start = Instant::now();
    for index in 0..3 {
        executor.submit(&[], index).unwrap();
        assert!(executor.n_running() <= executor.n_max_jobs());
    }

    // the third submission had to wait for one of the first two
    assert!(start.elapsed() >= Duration::from_millis(250));

    let collected = drain(&mut executor, 3);
    assert_eq!(collected.len(), 3);
    assert_eq!(executor.available_slots(), 2);
}

#[test]
pub fn single_slot_drain_returns_each_job_once() {
    let dir = tempfile::tempdir().unwrap();
    let mut executor = executor(dir.path(), "sleep 0.2", 1);

    executor.submit(&[], "first").unwrap();
    assert!(executor.collect_finished().unwrap().is_empty());

    executor.submit(&[], "second").unwrap();

    let mut tags = Vec::new();
    for _ in 0..2 {
        let jobs = drain(&mut executor, 1);
        tags.extend(jobs.into_iter().map(Job::into_tag));
    }

    assert_eq!(tags, vec!["first", "second"]);
    assert!(executor.collect_finished().unwrap().is_empty());
    assert_eq!(executor.n_running(), 0);
}

#[test]
pub fn tag_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let mut executor = executor(dir.path(), "exit 0", 2);

    let tag = (7_usize, BTreeMap::from([("lr".to_owned(), 0.01)]));
    executor.submit(&[], tag.clone()).unwrap();

    let jobs = drain(&mut executor, 1);
    assert_eq!(jobs[0].tag(), &tag);
}

#[test]
pub fn failing_job_is_collected_as_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut executor = executor(
        dir.path(),
        r#"echo "fail=$1"; echo oops >&2; exit "$1""#,
        2,
    );

    executor.submit(&args(&["3"]), "bad").unwrap();
    executor.submit(&args(&["0"]), "good").unwrap();

    let jobs = drain(&mut executor, 2);
    let bad = jobs.iter().find(|job| *job.tag() == "bad").unwrap();
    let good = jobs.iter().find(|job| *job.tag() == "good").unwrap();

    assert_eq!(bad.status(), Status::Error);
    match bad.result() {
        Err(JobError::Failed {
            exit_code, output, ..
        }) => {
            assert_eq!(exit_code, Some(3));
            assert!(output.contains("fail=3"));
            assert!(output.contains("oops"));
        }
        other => panic!("expected failure, got {other:?}"),
    }

    assert_eq!(good.status(), Status::Finished);
    let outcome = good.result().unwrap();
    assert_eq!(outcome.exit_code, Some(0));
    assert_eq!(outcome.output, "fail=0\noops\n");
}

#[test]
pub fn arguments_are_bound_to_the_job() {
    let dir = tempfile::tempdir().unwrap();
    let mut executor = executor(dir.path(), r#"echo "$@""#, 1).with_name_prefix("trial");

    let job = executor
        .submit(&args(&["{job.name}", "--out={job.work_dir}/{job.name}.json"]), ())
        .unwrap();
    assert_eq!(job.name(), "trial-00001");
    assert_eq!(job.status(), Status::Waiting);
    let work_dir = job.work_dir().to_path_buf();

    let jobs = drain(&mut executor, 1);
    assert_eq!(
        jobs[0].result().unwrap().output,
        format!("trial-00001 --out={}/trial-00001.json\n", work_dir.display())
    );
    assert_eq!(jobs[0].log_path(), work_dir.join("trial-00001.log"));
}

#[test]
pub fn unknown_argument_placeholder_fails_submission() {
    let dir = tempfile::tempdir().unwrap();
    let mut executor = executor::<()>(dir.path(), "exit 0", 1);

    assert!(matches!(
        executor.submit(&args(&["{job.cwd}"]), ()),
        Err(ExecutorError::Template(_))
    ));
    assert_eq!(executor.n_running(), 0);
}

#[test]
pub fn environment_is_passed_on() {
    let dir = tempfile::tempdir().unwrap();
    let mut executor = executor(dir.path(), r#"echo "$TRIAL_SEED""#, 1)
        .with_env(BTreeMap::from([("TRIAL_SEED".to_owned(), "42".to_owned())]));

    executor.submit(&[], ()).unwrap();

    assert_eq!(drain(&mut executor, 1)[0].result().unwrap().output, "42\n");
}

#[test]
pub fn timeout_terminates_the_job() {
    let dir = tempfile::tempdir().unwrap();
    let mut executor =
        executor(dir.path(), "exec sleep 10", 1).with_timeout(Some(Duration::from_millis(100)));

    executor.submit(&[], ()).unwrap();

    let jobs = drain(&mut executor, 1);
    assert_eq!(jobs[0].status(), Status::Error);
    assert_eq!(jobs[0].outcome().unwrap().exit_code, None);
}

#[test]
pub fn spawn_failure_is_reported_on_submit() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "exit 0");
    fs::set_permissions(&script, fs::Permissions::from_mode(0o644)).unwrap();

    let mut executor = LocalJobExecutor::new(&script, 1, dir.path()).unwrap();

    assert!(matches!(
        executor.submit(&[], ()),
        Err(ExecutorError::Spawn(..))
    ));
    assert_eq!(executor.n_running(), 0);
}

#[test]
pub fn unfinished_job_has_no_result() {
    let dir = tempfile::tempdir().unwrap();
    let mut executor = executor(dir.path(), "sleep 1", 1);

    let job = executor.submit(&[], ()).unwrap();

    assert!(matches!(job.result(), Err(JobError::NotFinished(_))));
}
