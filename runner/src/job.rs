use crate::{
    executors::{batch::BatchHandle, local::LocalHandle},
    status::Status,
    template::{Placeholder, Values},
};
use std::{
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    #[error("Job {0} has not finished yet")]
    NotFinished(String),
    #[error("Job {name} failed with exit code {exit_code:?}")]
    Failed {
        name: String,
        exit_code: Option<i32>,
        output: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// what is known about a job once it left the backend
pub struct JobOutcome {
    /// `None` if the process was killed by a signal or the exit code was never recorded
    pub exit_code: Option<i32>,
    /// combined stdout/stderr as far as it was captured
    pub output: String,
    pub elapsed: Duration,
}

#[derive(Debug)]
pub enum JobHandle {
    Local(LocalHandle),
    Batch(BatchHandle),
}

/// A single submitted unit of work.
///
/// Jobs are owned by the executor that submitted them until they are handed out by
/// `collect_finished`, the tag is never looked at by the executor.
#[derive(Debug)]
pub struct Job<T> {
    pub(crate) handle: JobHandle,
    pub(crate) seq: u64,
    pub(crate) name: String,
    pub(crate) script: PathBuf,
    pub(crate) work_dir: PathBuf,
    pub(crate) log_path: PathBuf,
    pub(crate) tag: T,
    pub(crate) status: Status,
    pub(crate) outcome: Option<JobOutcome>,
}

impl<T> Job<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// submission sequence number within the owning executor
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn script(&self) -> &Path {
        &self.script
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn handle(&self) -> &JobHandle {
        &self.handle
    }

    /// scheduler job id for batch jobs
    pub fn job_id(&self) -> Option<&str> {
        match &self.handle {
            JobHandle::Batch(handle) => Some(handle.job_id.as_str()),
            JobHandle::Local(_) => None,
        }
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn tag(&self) -> &T {
        &self.tag
    }

    pub fn into_tag(self) -> T {
        self.tag
    }

    pub fn outcome(&self) -> Option<&JobOutcome> {
        self.outcome.as_ref()
    }

    /// outcome of a successful job, a failed job re-raises its failure including the output
    pub fn result(&self) -> Result<&JobOutcome, JobError> {
        match (self.status, self.outcome.as_ref()) {
            (Status::Finished, Some(outcome)) => Ok(outcome),
            (Status::Error, outcome) => Err(JobError::Failed {
                name: self.name.clone(),
                exit_code: outcome.and_then(|outcome| outcome.exit_code),
                output: outcome
                    .map(|outcome| outcome.output.clone())
                    .unwrap_or_default(),
            }),
            _ => Err(JobError::NotFinished(self.name.clone())),
        }
    }

    /// values for the late bound `{job.*}` placeholders of job arguments
    pub(crate) fn template_values(&self) -> Values {
        job_values(&self.name, &self.work_dir, &self.log_path, self.seq)
    }

    pub(crate) fn finish(&mut self, status: Status, outcome: JobOutcome) {
        self.status.advance(status);
        self.outcome = Some(outcome);
    }
}

pub(crate) fn job_values(name: &str, work_dir: &Path, log: &Path, seq: u64) -> Values {
    Values::from([
        (Placeholder::JobName, name.to_owned()),
        (
            Placeholder::JobWorkDir,
            work_dir.to_string_lossy().into_owned(),
        ),
        (Placeholder::JobLog, log.to_string_lossy().into_owned()),
        (Placeholder::JobSeq, seq.to_string()),
    ])
}
