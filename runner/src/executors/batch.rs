use super::{qstat, ExecutorError, JobExecutor, JobList};
use crate::{
    config::{BatchConfig, Config},
    job::{self, Job, JobHandle, JobOutcome},
    script::{JobScript, Mode, ResourceOptions, ScriptError, ScriptSpec},
    status::Status,
    status_file::StatusFile,
    tasks::ArrayLayout,
    template::{self, shell_quote},
};
use itertools::Itertools;
use std::{
    collections::{BTreeMap, HashMap},
    env,
    ffi::OsString,
    fs,
    path::{Path, PathBuf},
    process::Command,
    time::{Duration, Instant},
};
use tracing::{debug, info, instrument, warn};

/// Scheduler side state of a batch job
#[derive(Debug, Clone)]
pub struct BatchHandle {
    pub job_id: String,
    pub(crate) layout: Option<ArrayLayout>,
    /// one per array slot, a single one otherwise
    pub(crate) status_files: Vec<StatusFile>,
    /// codes of the status files consumed so far
    pub(crate) exit_codes: Vec<Option<i32>>,
    /// consecutive polls the job was absent from the listing without all status files
    pub(crate) missing_polls: u32,
    pub(crate) submitted_at: Instant,
}

/// What a single listing says about a job
enum Observation {
    Pending(Status),
    Done(Status, Option<i32>),
}

/// Executor submitting every job as a runner script to a grid-engine like scheduler
#[derive(Debug)]
pub struct BatchJobExecutor<T> {
    n_max_jobs: usize,
    job_script: Option<PathBuf>,
    work_dir: PathBuf,
    name_prefix: String,
    poll_interval: Duration,
    config: BatchConfig,
    prologue: String,
    resources: ResourceOptions,
    seq: u64,
    jobs: JobList<T>,
}

impl<T> BatchJobExecutor<T> {
    /// create a new executor, `work_dir` is created if it does not exist
    pub fn new(work_dir: &Path, n_max_jobs: usize, config: BatchConfig) -> Result<Self, ExecutorError> {
        fs::create_dir_all(work_dir)?;

        // the scheduler does not run scripts from our cwd
        let work_dir = fs::canonicalize(work_dir)?;

        let resources = ResourceOptions {
            walltime: config.walltime.clone(),
            ..Default::default()
        };

        Ok(Self {
            n_max_jobs: n_max_jobs.max(1),
            job_script: None,
            work_dir,
            name_prefix: "job".to_owned(),
            poll_interval: Duration::from_secs(1),
            config,
            prologue: String::new(),
            resources,
            seq: 0,
            jobs: JobList::new(),
        })
    }

    pub fn load(config: &Config) -> Result<Self, ExecutorError> {
        let executor = &config.executor;

        Ok(Self::new(
            &executor.work_dir,
            executor.n_max_jobs(),
            config.batch.clone(),
        )?
        .with_name_prefix(&executor.name_prefix)
        .with_poll_interval(executor.poll_interval())
        .with_prologue(&executor.prologue, &executor.env))
    }

    pub fn with_job_script(mut self, job_script: PathBuf) -> Self {
        self.job_script = Some(job_script);
        self
    }

    pub fn with_name_prefix(mut self, prefix: &str) -> Self {
        self.name_prefix = prefix.to_owned();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// shell snippet run by every script, `env` is exported ahead of it
    pub fn with_prologue(mut self, prologue: &str, env: &BTreeMap<String, String>) -> Self {
        self.prologue = env
            .iter()
            .map(|(key, value)| format!("export {key}={}", shell_quote(value)))
            .chain((!prologue.is_empty()).then(|| prologue.to_owned()))
            .join("\n");
        self
    }

    /// resources every job submitted through `submit` requests
    pub fn with_resources(mut self, resources: ResourceOptions) -> Self {
        self.resources = resources;
        self
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// jobs that have not reached a terminal status yet, in submission order
    pub fn running_jobs(&self) -> impl Iterator<Item = &Job<T>> {
        self.jobs.running()
    }

    /// submit `command` as its own script in `mode`, logging to `log`
    #[instrument(skip(self, command, options, tag), level = "debug")]
    pub fn submit_command(
        &mut self,
        mode: Mode,
        command: Vec<String>,
        log: &Path,
        options: ResourceOptions,
        tag: T,
    ) -> Result<&Job<T>, ExecutorError> {
        self.wait_for_slot()?;

        let log = if log.is_absolute() {
            log.to_path_buf()
        } else {
            env::current_dir()?.join(log)
        };
        let script = log.with_extension("sh");
        let (seq, name) = self.next_name();

        self.launch(seq, name, mode, command, log, script.clone(), script, options, tag)
    }

    /// submit `command` as an array job, every slot runs `layout.workers_per_job` workers
    pub fn submit_array(
        &mut self,
        mode: Mode,
        command: Vec<String>,
        log: &Path,
        layout: ArrayLayout,
        mut options: ResourceOptions,
        tag: T,
    ) -> Result<&Job<T>, ExecutorError> {
        if !mode.is_array() {
            return Err(ScriptError::MissingLayout(mode).into());
        }

        options.layout = Some(layout);
        self.submit_command(mode, command, log, options, tag)
    }

    fn next_name(&mut self) -> (u64, String) {
        self.seq += 1;

        (self.seq, format!("{}-{:05}", self.name_prefix, self.seq))
    }

    #[allow(clippy::too_many_arguments)]
    fn launch(
        &mut self,
        seq: u64,
        name: String,
        mode: Mode,
        command: Vec<String>,
        log: PathBuf,
        script: PathBuf,
        script_path: PathBuf,
        options: ResourceOptions,
        tag: T,
    ) -> Result<&Job<T>, ExecutorError> {
        let spec = ScriptSpec::build(
            mode,
            command,
            &log,
            &name,
            &options,
            &self.config,
            self.prologue.clone(),
        )?;

        let status_files = match spec.layout {
            Some(layout) => layout
                .slot_starts()
                .map(|slot| StatusFile::for_slot(&log, slot))
                .collect(),
            None => vec![StatusFile::for_log(&log)],
        };
        for status_file in &status_files {
            status_file.clear()?;
        }

        JobScript::write(&spec, &script_path)?;

        let flags = template::render_all(
            &self.config.resources_for(mode),
            &options.values(&name, &log),
        )?;
        let job_id = self.run_submit(&flags, &script_path)?;

        let mut job = Job {
            handle: JobHandle::Batch(BatchHandle {
                job_id,
                layout: spec.layout,
                exit_codes: vec![None; status_files.len()],
                status_files,
                missing_polls: 0,
                submitted_at: Instant::now(),
            }),
            seq,
            name,
            script,
            work_dir: self.work_dir.clone(),
            log_path: log,
            tag,
            status: Status::Unsubmitted,
            outcome: None,
        };
        job.status.advance(Status::Waiting);

        info!(
            job = %job.name,
            job_id = ?job.job_id(),
            mode = %mode,
            "Submitted batch job"
        );

        Ok(self.jobs.push(job))
    }

    fn run_submit(&self, flags: &[String], script: &Path) -> Result<String, ExecutorError> {
        let (program, prefix) = self
            .config
            .submit_command
            .split_first()
            .ok_or_else(|| ExecutorError::Submission("submit command is empty".to_owned()))?;

        debug!(program = %program, flags = ?flags, script = ?script, "Running submit command");

        let output = Command::new(program)
            .args(prefix)
            .args(flags)
            .arg(script)
            .current_dir(&self.work_dir)
            .output()
            .map_err(|error| ExecutorError::Spawn(program.clone(), error))?;

        let stdout = String::from_utf8_lossy(&output.stdout);

        if !output.status.success() {
            return Err(ExecutorError::Submission(format!(
                "{program} exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        parse_job_id(&stdout).ok_or_else(|| {
            ExecutorError::Submission(format!(
                "no job id in output of {program}: {:?}",
                stdout.trim()
            ))
        })
    }

    fn query(&self) -> Result<String, ExecutorError> {
        let (program, args) = self
            .config
            .status_command
            .split_first()
            .ok_or_else(|| ExecutorError::StatusQuery("status command is empty".to_owned()))?;

        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|error| ExecutorError::Spawn(program.clone(), error))?;

        if !output.status.success() {
            return Err(ExecutorError::StatusQuery(format!(
                "{program} exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl<T> JobExecutor<T> for BatchJobExecutor<T> {
    #[instrument(skip(self, args, tag), level = "debug")]
    fn submit(&mut self, args: &[String], tag: T) -> Result<&Job<T>, ExecutorError> {
        let job_script = self
            .job_script
            .clone()
            .ok_or(ExecutorError::MissingJobScript)?;

        self.wait_for_slot()?;

        let (seq, name) = self.next_name();
        let log = self.work_dir.join(format!("{name}.log"));
        let script_path = self.work_dir.join(format!("{name}.sh"));

        let mut command = vec![job_script.to_string_lossy().into_owned()];
        command.extend(template::render_all(
            args,
            &job::job_values(&name, &self.work_dir, &log, seq),
        )?);

        self.launch(
            seq,
            name,
            self.config.mode,
            command,
            log,
            job_script,
            script_path,
            self.resources.clone(),
            tag,
        )
    }

    #[instrument(skip(self), level = "debug")]
    fn refresh(&mut self) -> Result<(), ExecutorError> {
        if self.jobs.n_running() == 0 {
            return Ok(());
        }

        let listing = self.query()?;

        // array jobs list one entry per task range, all under the same id
        let listed: HashMap<String, Vec<Status>> = qstat::parse_job_states(&listing)?
            .into_iter()
            .map(|entry| Status::from_backend_status(&entry.state).map(|status| (entry.job_id, status)))
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .into_group_map();

        let grace = self.config.missing_grace;

        for job in self.jobs.running_mut() {
            let observation = match &mut job.handle {
                JobHandle::Batch(handle) => {
                    let statuses = listed.get(&handle.job_id);
                    observe(&job.name, handle, statuses, grace)?
                }
                JobHandle::Local(_) => continue,
            };

            match observation {
                Observation::Pending(status) => {
                    job.status.advance(status);
                }
                Observation::Done(status, exit_code) => {
                    let outcome = match &job.handle {
                        JobHandle::Batch(handle) => JobOutcome {
                            exit_code,
                            output: read_output(&job.log_path, handle.layout),
                            elapsed: handle.submitted_at.elapsed(),
                        },
                        JobHandle::Local(_) => continue,
                    };

                    debug!(job = %job.name, status = %status, exit_code = ?exit_code, "Batch job done");
                    job.finish(status, outcome);
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

/// combined status of all listing entries of one job id
fn combine(statuses: &[Status]) -> Status {
    if statuses.contains(&Status::Error) {
        Status::Error
    } else if statuses.contains(&Status::Running) {
        Status::Running
    } else {
        Status::Waiting
    }
}

fn observe(
    name: &str,
    handle: &mut BatchHandle,
    listed: Option<&Vec<Status>>,
    grace: u32,
) -> Result<Observation, ExecutorError> {
    if let Some(statuses) = listed {
        handle.missing_polls = 0;

        return Ok(match combine(statuses) {
            Status::Error => {
                warn!(job = %name, job_id = %handle.job_id, "Scheduler reports the job in error state");
                Observation::Done(Status::Error, None)
            }
            status => Observation::Pending(status),
        });
    }

    // gone from the scheduler, the status files tell how it went
    for (status_file, code) in handle.status_files.iter().zip(handle.exit_codes.iter_mut()) {
        if code.is_none() {
            *code = status_file.poll()?;
        }
    }

    let failure = handle
        .exit_codes
        .iter()
        .flatten()
        .copied()
        .find(|code| *code != 0);

    if let Some(code) = failure {
        return Ok(Observation::Done(Status::Error, Some(code)));
    }

    if handle.exit_codes.iter().all(Option::is_some) {
        return Ok(Observation::Done(Status::Finished, Some(0)));
    }

    handle.missing_polls += 1;

    if handle.missing_polls > grace {
        warn!(
            job = %name,
            job_id = %handle.job_id,
            polls = handle.missing_polls,
            "Job left the scheduler without writing its status file"
        );

        Ok(Observation::Done(Status::Error, None))
    } else {
        Ok(Observation::Pending(Status::Running))
    }
}

/// the job's log, followed by the per task logs of array workers
fn read_output(log: &Path, layout: Option<ArrayLayout>) -> String {
    let task_logs = layout
        .into_iter()
        .flat_map(|layout| 1..=layout.n_tasks.get())
        .map(|task| {
            let mut path = OsString::from(log);
            path.push(format!(".{task}"));
            PathBuf::from(path)
        });

    std::iter::once(log.to_path_buf())
        .chain(task_logs)
        .filter(|path| path.is_file())
        .filter_map(|path| match fs::read(&path) {
            Ok(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
            Err(error) => {
                warn!(path = ?path, error = ?error, "Failed to read job output");
                None
            }
        })
        .collect()
}

/// job id from `Your job 123 ("name") has been submitted`, `Your job-array 123.1-10:2 ...`
/// or terse `123`
pub fn parse_job_id(output: &str) -> Option<String> {
    output
        .split_whitespace()
        .find(|word| word.starts_with(|c: char| c.is_ascii_digit()))
        .map(|word| word.chars().take_while(char::is_ascii_digit).collect())
}
