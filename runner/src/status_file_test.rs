use crate::{
    job::JobError,
    status_file::{exit_code_result, StatusFile, StatusFileError},
};
use std::{fs, path::Path, thread, time::Duration};

#[test]
pub fn paths_follow_the_log() {
    assert_eq!(
        StatusFile::for_log(Path::new("/tmp/run/trial.log")).path(),
        Path::new("/tmp/run/trial.status")
    );
    assert_eq!(
        StatusFile::for_slot(Path::new("/tmp/run/trial.log"), 5).path(),
        Path::new("/tmp/run/trial.5.status")
    );
}

#[test]
pub fn absent_file_is_not_complete() {
    let dir = tempfile::tempdir().unwrap();
    let status = StatusFile::for_log(&dir.path().join("job.log"));

    assert_eq!(status.poll().unwrap(), None);
}

#[test]
pub fn poll_consumes_the_file() {
    let dir = tempfile::tempdir().unwrap();
    let status = StatusFile::for_log(&dir.path().join("job.log"));
    fs::write(status.path(), "3\n").unwrap();

    assert_eq!(status.peek().unwrap(), Some(3));
    assert_eq!(status.poll().unwrap(), Some(3));
    assert!(!status.exists());
    assert_eq!(status.poll().unwrap(), None);
}

#[test]
pub fn malformed_content_fails() {
    let dir = tempfile::tempdir().unwrap();
    let status = StatusFile::for_log(&dir.path().join("job.log"));
    fs::write(status.path(), "done").unwrap();

    assert!(matches!(
        status.poll(),
        Err(StatusFileError::Malformed { content, .. }) if content == "done"
    ));
}

#[test]
pub fn wait_returns_once_written() {
    let dir = tempfile::tempdir().unwrap();
    let status = StatusFile::for_log(&dir.path().join("job.log"));
    let path = status.path().to_path_buf();

    let writer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        fs::write(path, "0").unwrap();
    });

    assert_eq!(status.wait(Duration::from_millis(10)).unwrap(), 0);
    writer.join().unwrap();
}

#[test]
pub fn non_zero_code_is_a_job_failure() {
    assert_eq!(exit_code_result("job", 0, String::new()), Ok(()));
    assert_eq!(
        exit_code_result("job", 2, "boom".to_owned()),
        Err(JobError::Failed {
            name: "job".to_owned(),
            exit_code: Some(2),
            output: "boom".to_owned()
        })
    );
}
