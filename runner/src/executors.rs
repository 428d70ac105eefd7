pub mod batch;
pub mod local;
pub mod qstat;

#[cfg(test)]
mod local_test;
#[cfg(test)]
mod qstat_test;

use crate::{
    config::{Config, ConfigErrors},
    job::Job,
    script::ScriptError,
    status::StatusError,
    status_file::StatusFileError,
    template::TemplateError,
};
use std::{collections::VecDeque, io, path::Path, thread, time::Duration};
use thiserror::Error;
use tracing::trace;

/// Infrastructure failures, a job exiting non-zero is never reported through this type
#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Failed to spawn {0}: {1}")]
    Spawn(String, #[source] io::Error),
    #[error("Submission failed: {0}")]
    Submission(String),
    #[error("Status query failed: {0}")]
    StatusQuery(String),
    #[error("Failed to parse status listing: {0}")]
    StatusListing(#[from] qstat::QstatError),
    #[error(transparent)]
    Status(#[from] StatusError),
    #[error(transparent)]
    StatusFile(#[from] StatusFileError),
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error(transparent)]
    Script(#[from] ScriptError),
    #[error("Failed to build worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
    #[error("No job script configured")]
    MissingJobScript,
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Submission and collection of jobs against one backend.
///
/// An executor is driven from a single thread. `submit` may sleep until a slot frees up,
/// `refresh` and `collect_finished` only take a snapshot of the backend.
pub trait JobExecutor<T> {
    /// submit `job_script args...`, arguments may reference the job itself (`{job.name}`, ...)
    fn submit(&mut self, args: &[String], tag: T) -> Result<&Job<T>, ExecutorError>;

    /// advance the status of every running job
    fn refresh(&mut self) -> Result<(), ExecutorError>;

    /// hand out every job that reached a terminal status, including failed ones
    fn collect_finished(&mut self) -> Result<Vec<Job<T>>, ExecutorError>;

    fn n_max_jobs(&self) -> usize;

    fn n_running(&self) -> usize;

    fn poll_interval(&self) -> Duration;

    /// directory logs, scripts and status files are written to
    fn work_dir(&self) -> &Path;

    fn available_slots(&self) -> usize {
        self.n_max_jobs().saturating_sub(self.n_running())
    }

    /// sleep until at least one slot is available
    fn wait_for_slot(&mut self) -> Result<(), ExecutorError> {
        while self.available_slots() == 0 {
            self.refresh()?;

            if self.available_slots() > 0 {
                break;
            }

            trace!(running = self.n_running(), "Waiting for a free slot");
            thread::sleep(self.poll_interval());
        }

        Ok(())
    }

    /// block until every submitted job has been collected
    fn wait_all(&mut self) -> Result<Vec<Job<T>>, ExecutorError> {
        let mut jobs = Vec::new();

        loop {
            jobs.extend(self.collect_finished()?);

            if self.n_running() == 0 {
                return Ok(jobs);
            }

            thread::sleep(self.poll_interval());
        }
    }
}

/// Jobs owned by an executor.
/// `running` keeps submission order, `finished` keeps the order completion was observed in.
#[derive(Debug)]
pub(crate) struct JobList<T> {
    running: Vec<Job<T>>,
    finished: VecDeque<Job<T>>,
}

impl<T> JobList<T> {
    pub fn new() -> Self {
        Self {
            running: Vec::new(),
            finished: VecDeque::new(),
        }
    }

    pub fn push(&mut self, job: Job<T>) -> &Job<T> {
        self.running.push(job);
        // just pushed
        &self.running[self.running.len() - 1]
    }

    pub fn n_running(&self) -> usize {
        self.running.len()
    }

    pub fn running(&self) -> impl Iterator<Item = &Job<T>> {
        self.running.iter()
    }

    pub fn running_mut(&mut self) -> impl Iterator<Item = &mut Job<T>> {
        self.running.iter_mut()
    }

    /// move terminal jobs over to the finished queue
    pub fn settle(&mut self) {
        let (finished, running): (Vec<_>, Vec<_>) = std::mem::take(&mut self.running)
            .into_iter()
            .partition(|job| job.status.is_terminal());

        self.running = running;
        self.finished.extend(finished);
    }

    pub fn drain_finished(&mut self) -> Vec<Job<T>> {
        self.finished.drain(..).collect()
    }
}

#[derive(Debug)]
pub enum Executors<T> {
    Local(local::LocalJobExecutor<T>),
    Batch(batch::BatchJobExecutor<T>),
}

impl<T> Executors<T> {
    pub fn load(config: &Config) -> Result<Self, ConfigErrors> {
        let job_script = config
            .executor
            .job_script
            .clone()
            .ok_or(ConfigErrors::MissingJobScript)?;

        match config.executor.name.as_str() {
            "local" => Ok(Self::Local(
                local::LocalJobExecutor::load(&config.executor, job_script)?,
            )),
            "batch" => Ok(Self::Batch(
                batch::BatchJobExecutor::load(config)?.with_job_script(job_script),
            )),
            _ => Err(ConfigErrors::UnsupportedExecutor(
                config.executor.name.clone(),
            )),
        }
    }
}

impl<T> JobExecutor<T> for Executors<T> {
    fn submit(&mut self, args: &[String], tag: T) -> Result<&Job<T>, ExecutorError> {
        match self {
            Self::Local(executor) => executor.submit(args, tag),
            Self::Batch(executor) => executor.submit(args, tag),
        }
    }

    fn refresh(&mut self) -> Result<(), ExecutorError> {
        match self {
            Self::Local(executor) => executor.refresh(),
            Self::Batch(executor) => executor.refresh(),
        }
    }

    fn collect_finished(&mut self) -> Result<Vec<Job<T>>, ExecutorError> {
        match self {
            Self::Local(executor) => executor.collect_finished(),
            Self::Batch(executor) => executor.collect_finished(),
        }
    }

    fn n_max_jobs(&self) -> usize {
        match self {
            Self::Local(executor) => executor.n_max_jobs(),
            Self::Batch(executor) => executor.n_max_jobs(),
        }
    }

    fn n_running(&self) -> usize {
        match self {
            Self::Local(executor) => executor.n_running(),
            Self::Batch(executor) => executor.n_running(),
        }
    }

    fn poll_interval(&self) -> Duration {
        match self {
            Self::Local(executor) => executor.poll_interval(),
            Self::Batch(executor) => executor.poll_interval(),
        }
    }

    fn work_dir(&self) -> &Path {
        match self {
            Self::Local(executor) => executor.work_dir(),
            Self::Batch(executor) => executor.work_dir(),
        }
    }
}
