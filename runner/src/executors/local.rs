use super::{ExecutorError, JobExecutor, JobList};
use crate::{
    config::ExecutorConfig,
    job::{Job, JobHandle, JobOutcome},
    status::Status,
    template,
};
use nix::{
    sys::signal::{kill, Signal},
    unistd::Pid,
};
use parking_lot::FairMutex;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::{
    collections::BTreeMap,
    fs::{self, File},
    io,
    os::unix::process::ExitStatusExt,
    path::{Path, PathBuf},
    process::{Child, Command, ExitStatus, Stdio},
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::{debug, error, info, instrument, warn};
use wait_timeout::ChildExt;

/// time a timed out job gets between SIGTERM and SIGKILL
const KILL_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug)]
struct LocalState {
    status: Status,
    outcome: Option<JobOutcome>,
}

/// Shared view on a job waited upon by a pool thread
#[derive(Debug, Clone)]
pub struct LocalHandle {
    state: Arc<FairMutex<LocalState>>,
}

impl LocalHandle {
    fn new() -> Self {
        Self {
            state: Arc::new(FairMutex::new(LocalState {
                status: Status::Waiting,
                outcome: None,
            })),
        }
    }

    pub fn status(&self) -> Status {
        self.state.lock().status
    }

    /// status and, once terminal, the outcome, the outcome is only handed out once
    fn snapshot(&self) -> (Status, Option<JobOutcome>) {
        let mut state = self.state.lock();

        if state.status.is_terminal() {
            (state.status, state.outcome.take())
        } else {
            (state.status, None)
        }
    }
}

/// Executor that runs every job as a child process, waited upon by a fixed size thread pool
#[derive(Debug)]
pub struct LocalJobExecutor<T> {
    pool: ThreadPool,
    n_max_jobs: usize,
    job_script: PathBuf,
    work_dir: PathBuf,
    name_prefix: String,
    poll_interval: Duration,
    timeout: Option<Duration>,
    env: BTreeMap<String, String>,
    seq: u64,
    jobs: JobList<T>,
}

impl<T> LocalJobExecutor<T> {
    /// create a new executor, `work_dir` is created if it does not exist
    pub fn new(job_script: &Path, n_max_jobs: usize, work_dir: &Path) -> Result<Self, ExecutorError> {
        let n_max_jobs = n_max_jobs.max(1);

        fs::create_dir_all(work_dir)?;

        // children run inside work_dir, relative paths have to be resolved beforehand
        let job_script = fs::canonicalize(job_script)
            .map_err(|error| ExecutorError::Spawn(job_script.to_string_lossy().into_owned(), error))?;
        let work_dir = fs::canonicalize(work_dir)?;

        debug!("Starting local pool with {n_max_jobs} threads");

        let pool = ThreadPoolBuilder::new()
            .num_threads(n_max_jobs)
            .thread_name(|index| format!("local-job-{index}"))
            .build()?;

        Ok(Self {
            pool,
            n_max_jobs,
            job_script,
            work_dir,
            name_prefix: "job".to_owned(),
            poll_interval: Duration::from_secs(1),
            timeout: None,
            env: BTreeMap::new(),
            seq: 0,
            jobs: JobList::new(),
        })
    }

    pub fn load(config: &ExecutorConfig, job_script: PathBuf) -> Result<Self, ExecutorError> {
        Ok(Self::new(&job_script, config.n_max_jobs(), &config.work_dir)?
            .with_name_prefix(&config.name_prefix)
            .with_poll_interval(config.poll_interval())
            .with_timeout(config.timeout())
            .with_env(config.env.clone()))
    }

    pub fn with_name_prefix(mut self, prefix: &str) -> Self {
        self.name_prefix = prefix.to_owned();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn job_script(&self) -> &Path {
        &self.job_script
    }

    /// spawn the job's process and hand it over to the pool
    fn spawn(&self, job: &Job<T>, args: &[String], handle: LocalHandle) -> Result<(), ExecutorError> {
        let log = File::create(&job.log_path)?;

        let child = Command::new(&self.job_script)
            .args(args)
            .current_dir(&self.work_dir)
            .envs(self.env.iter())
            .stdin(Stdio::null())
            .stdout(log.try_clone()?)
            .stderr(log)
            .spawn()
            .map_err(|error| ExecutorError::Spawn(job.name.clone(), error))?;

        let name = job.name.clone();
        let log_path = job.log_path.clone();
        let timeout = self.timeout;

        self.pool
            .spawn(move || wait_for_child(name, child, handle, log_path, timeout));

        Ok(())
    }
}

impl<T> JobExecutor<T> for LocalJobExecutor<T> {
    #[instrument(skip(self, args, tag), level = "debug")]
    fn submit(&mut self, args: &[String], tag: T) -> Result<&Job<T>, ExecutorError> {
        self.wait_for_slot()?;

        self.seq += 1;
        let name = format!("{}-{:05}", self.name_prefix, self.seq);
        let handle = LocalHandle::new();

        let mut job = Job {
            handle: JobHandle::Local(handle.clone()),
            seq: self.seq,
            log_path: self.work_dir.join(format!("{name}.log")),
            name,
            script: self.job_script.clone(),
            work_dir: self.work_dir.clone(),
            tag,
            status: Status::Unsubmitted,
            outcome: None,
        };

        let args = template::render_all(args, &job.template_values())?;
        self.spawn(&job, &args, handle)?;
        job.status.advance(Status::Waiting);

        info!(job = %job.name, args = ?args, "Submitted local job");

        Ok(self.jobs.push(job))
    }

    fn refresh(&mut self) -> Result<(), ExecutorError> {
        for job in self.jobs.running_mut() {
            let (status, outcome) = match &job.handle {
                JobHandle::Local(handle) => handle.snapshot(),
                JobHandle::Batch(_) => continue,
            };

            match outcome {
                Some(outcome) => job.finish(status, outcome),
                None => {
                    job.status.advance(status);
                }
            }
        }

        self.jobs.settle();

        Ok(())
    }

    fn collect_finished(&mut self) -> Result<Vec<Job<T>>, ExecutorError> {
        self.refresh()?;

        Ok(self.jobs.drain_finished())
    }

    fn n_max_jobs(&self) -> usize {
        self.n_max_jobs
    }

    fn n_running(&self) -> usize {
        self.jobs.n_running()
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    fn work_dir(&self) -> &Path {
        &self.work_dir
    }
}

/// ask the child to stop, kill it if it does not within `KILL_GRACE`
fn terminate(child: &mut Child) -> io::Result<ExitStatus> {
    match i32::try_from(child.id()) {
        Ok(pid) => {
            if let Err(errno) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
                warn!(pid = pid, errno = ?errno, "Failed to send SIGTERM");
            }
        }
        Err(_) => warn!("Child pid does not fit a pid_t, skipping SIGTERM"),
    }

    match child.wait_timeout(KILL_GRACE)? {
        Some(status) => Ok(status),
        None => {
            child.kill()?;
            child.wait()
        }
    }
}

fn wait_for_child(
    name: String,
    mut child: Child,
    handle: LocalHandle,
    log_path: PathBuf,
    timeout: Option<Duration>,
) {
    let start = Instant::now();
    handle.state.lock().status.advance(Status::Running);

    let exit = match timeout {
        Some(timeout) => match child.wait_timeout(timeout) {
            Ok(Some(status)) => Ok(status),
            Ok(None) => {
                warn!(job = %name, timeout = ?timeout, "Job ran into timeout, terminating");
                terminate(&mut child)
            }
            Err(error) => Err(error),
        },
        None => child.wait(),
    };

    let output = match fs::read(&log_path) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(error) => {
            warn!(job = %name, error = ?error, "Failed to read job output");
            String::new()
        }
    };

    let (status, exit_code) = match exit {
        Ok(exit) => {
            debug!(
                job = %name,
                elapsed = ?start.elapsed(),
                code = ?exit.code(),
                signal = ?exit.signal(),
                "Job exited"
            );

            let status = if exit.success() {
                Status::Finished
            } else {
                Status::Error
            };

            (status, exit.code())
        }
        Err(error) => {
            error!(job = %name, error = ?error, "Failed to wait for job");

            (Status::Error, None)
        }
    };

    let mut state = handle.state.lock();
    state.outcome = Some(JobOutcome {
        exit_code,
        output,
        elapsed: start.elapsed(),
    });
    state.status.advance(status);
}
