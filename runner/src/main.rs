use clap::{Args, Parser, Subcommand};
use hpo_runner::{
    config::{Config, ConfigErrors},
    executors::{batch::BatchJobExecutor, local::LocalJobExecutor, ExecutorError, JobExecutor},
    job::Job,
    script::{JobScript, Mode, ResourceOptions, ScriptError, ScriptSpec},
    status::Status,
    status_file::{StatusFile, StatusFileError},
    tasks::{ArrayLayout, LayoutError},
};
use std::{
    env, io,
    path::{Path, PathBuf},
    process::ExitCode,
};
use thiserror::Error;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

/// exit code for failures before or around the job, never produced by the job itself
const INFRASTRUCTURE_FAILURE: u8 = 125;

#[derive(Error, Debug)]
enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigErrors),
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    #[error(transparent)]
    Script(#[from] ScriptError),
    #[error(transparent)]
    StatusFile(#[from] StatusFileError),
    #[error("Invalid array layout: {0}")]
    Layout(#[from] LayoutError),
    #[error("{0} mode requires --n-tasks")]
    MissingTasks(Mode),
    #[error("Failed to resolve path: {0}")]
    Io(#[from] io::Error),
}

#[derive(Parser, Debug)]
#[command(name = "hpo-runner", version, about = "Run a command as a local or batch job")]
struct Cli {
    /// Runner config (yaml), built-in defaults are used without one
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Increase log verbosity, RUST_LOG takes precedence
    #[arg(long, short, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    mode: ModeCommand,
}

#[derive(Subcommand, Debug)]
enum ModeCommand {
    /// Single process job
    Cpu(JobArgs),
    /// Single process job with one GPU
    Gpu(JobArgs),
    /// Array job over --n-tasks tasks
    CpuArray(JobArgs),
    /// Array job with one GPU per worker
    GpuArray(JobArgs),
    /// MPI job, launched through the mpi launcher
    Mpi(JobArgs),
    /// Distributed training job, launched through the train launcher
    Train(JobArgs),
}

impl ModeCommand {
    fn split(self) -> (Mode, JobArgs) {
        match self {
            Self::Cpu(args) => (Mode::Cpu, args),
            Self::Gpu(args) => (Mode::Gpu, args),
            Self::CpuArray(args) => (Mode::CpuArray, args),
            Self::GpuArray(args) => (Mode::GpuArray, args),
            Self::Mpi(args) => (Mode::Mpi, args),
            Self::Train(args) => (Mode::Train, args),
        }
    }
}

#[derive(Args, Debug)]
struct JobArgs {
    /// Walltime requested from the scheduler, e.g. 12:00:00
    #[arg(long)]
    walltime: Option<String>,

    #[arg(long, default_value_t = 1)]
    n_procs: usize,

    #[arg(long, default_value_t = 1)]
    n_nodes: usize,

    /// Number of array tasks, required for array modes
    #[arg(long)]
    n_tasks: Option<usize>,

    /// Consecutive tasks handled by one worker
    #[arg(long, default_value_t = 1)]
    n_tasks_per_proc: usize,

    /// Workers started by one scheduler slot
    #[arg(long, default_value_t = 1)]
    n_procs_per_job: usize,

    /// Directory for scripts and logs, overrides executor.work_dir
    #[arg(long)]
    work_dir: Option<PathBuf>,

    /// Log file of the job, array workers log to LOG.<task>
    log: PathBuf,

    /// Command to run
    #[arg(last = true, required = true)]
    command: Vec<String>,
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_writer(io::stderr)
        .init();
}

fn load_config(path: Option<&Path>) -> Result<Config, ConfigErrors> {
    let mut config = match path {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    if config.preflight_checks() {
        return Err(ConfigErrors::PreflightFailed);
    }

    Ok(config)
}

/// exit code the runner reports for a collected job
fn job_exit_code<T>(job: &Job<T>) -> u8 {
    match (job.status(), job.outcome().and_then(|outcome| outcome.exit_code)) {
        (Status::Finished, _) => 0,
        (_, Some(code)) => u8::try_from(code).ok().filter(|code| *code != 0).unwrap_or(1),
        (_, None) => 1,
    }
}

fn run(cli: Cli) -> Result<u8, RunError> {
    let mut config = load_config(cli.config.as_deref())?;
    let (mode, args) = cli.mode.split();

    if let Some(work_dir) = args.work_dir {
        config.executor.work_dir = work_dir;
    }

    let layout = match (mode.is_array(), args.n_tasks) {
        (true, Some(n_tasks)) => Some(ArrayLayout::new(
            n_tasks,
            args.n_tasks_per_proc,
            args.n_procs_per_job,
        )?),
        (true, None) => return Err(RunError::MissingTasks(mode)),
        (false, _) => None,
    };

    let options = ResourceOptions {
        walltime: args
            .walltime
            .unwrap_or_else(|| config.batch.walltime.clone()),
        n_procs: args.n_procs,
        n_nodes: args.n_nodes,
        layout,
    };

    let log = if args.log.is_absolute() {
        args.log
    } else {
        env::current_dir()?.join(args.log)
    };

    info!(mode = %mode, executor = %config.executor.name, log = ?log, "Running job");

    match config.executor.name.as_str() {
        "batch" => run_batch(&config, mode, args.command, &log, options),
        _ => run_local(&config, mode, args.command, &log, options),
    }
}

fn run_batch(
    config: &Config,
    mode: Mode,
    command: Vec<String>,
    log: &Path,
    options: ResourceOptions,
) -> Result<u8, RunError> {
    let mut executor = BatchJobExecutor::load(config)?;

    let job = match options.layout {
        Some(layout) => executor.submit_array(mode, command, log, layout, options, ())?,
        None => executor.submit_command(mode, command, log, options, ())?,
    };
    info!(job_id = ?job.job_id(), "Waiting for batch job");

    let jobs = executor.wait_all()?;

    Ok(jobs.iter().map(job_exit_code).find(|code| *code != 0).unwrap_or(0))
}

/// run the generated script on this machine, one local job per array slot
fn run_local(
    config: &Config,
    mode: Mode,
    command: Vec<String>,
    log: &Path,
    options: ResourceOptions,
) -> Result<u8, RunError> {
    let name = log
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| config.executor.name_prefix.clone());

    let spec = ScriptSpec::build(
        mode,
        command,
        log,
        &name,
        &options,
        &config.batch,
        config.executor.prologue.clone(),
    )?;
    let script = log.with_extension("sh");
    JobScript::write(&spec, &script)?;

    let slots: Vec<Option<usize>> = match spec.layout {
        Some(layout) => layout.slot_starts().map(Some).collect(),
        None => vec![None],
    };

    let mut executor = LocalJobExecutor::new(
        &script,
        config.executor.n_max_jobs.unwrap_or(slots.len()),
        &config.executor.work_dir,
    )?
    .with_name_prefix(&name)
    .with_poll_interval(config.executor.poll_interval())
    .with_timeout(config.executor.timeout())
    .with_env(config.executor.env.clone());

    for slot in slots {
        let status_file = match slot {
            Some(slot) => StatusFile::for_slot(log, slot),
            None => StatusFile::for_log(log),
        };
        status_file.clear()?;

        let args: Vec<String> = slot.iter().map(usize::to_string).collect();
        executor.submit(&args, status_file)?;
    }

    let mut exit_code = 0;

    for job in executor.wait_all()? {
        // the script's own record wins, it survives a killed wrapper shell
        let code = match job.tag().poll()? {
            Some(code) => u8::try_from(code).unwrap_or(1),
            None => job_exit_code(&job),
        };
        debug!(job = %job.name(), code = code, "Local job done");

        if exit_code == 0 {
            exit_code = code;
        }
    }

    Ok(exit_code)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli) {
        Ok(code) => ExitCode::from(code),
        Err(error) => {
            error!(error = ?error, "Runner failed");
            eprintln!("hpo-runner: {error}");
            ExitCode::from(INFRASTRUCTURE_FAILURE)
        }
    }
}
