use crate::{
    executors::ExecutorError,
    script::{Mode, DEFAULT_INDEX_VAR},
};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::Error,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tracing::{error, warn};

// check if a file is executable
pub fn check_executable(path: &Path) -> Result<bool, ConfigErrors> {
    if !path.is_file() {
        Err(ConfigErrors::FileNotFound(path.to_path_buf()))
    } else {
        match File::open(path).map(|file| file.metadata()) {
            Ok(Ok(metadata)) => Ok((metadata.mode() & 0o111) != 0),
            Ok(Err(e)) | Err(e) => Err(ConfigErrors::MetadataNotFound(e)),
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Executor not supported: {0}")]
    UnsupportedExecutor(String),
    #[error("Executor failed to load: {0}")]
    FailedLoadExecutor(#[from] ExecutorError),
    #[error("File not found: {0:?}")]
    FileNotFound(PathBuf),
    #[error("Metadata not found")]
    MetadataNotFound(#[from] Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Config contains errors, see the log for details")]
    PreflightFailed,
    #[error("No job script configured for the executor")]
    MissingJobScript,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub batch: BatchConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ExecutorConfig {
    // Name of the selected executor, see Executors::load for the selection proccess
    #[serde(default = "default_executor_name")]
    pub name: String,
    // falls back to the number of cpus for the local executor
    pub n_max_jobs: Option<usize>,
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    // script every trial is run with, required for submitting trials
    pub job_script: Option<PathBuf>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    // local only, jobs are terminated after this many seconds
    pub timeout_secs: Option<u64>,
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,
    // shell snippet run before the command in every generated script
    #[serde(default)]
    pub prologue: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct BatchConfig {
    #[serde(default = "default_submit_command")]
    pub submit_command: Vec<String>,
    #[serde(default = "default_status_command")]
    pub status_command: Vec<String>,
    // environment variable the scheduler uses for the array index
    #[serde(default = "default_index_var")]
    pub index_var: String,
    // polls a job may be absent from the listing without a status file before it counts as failed
    #[serde(default = "default_missing_grace")]
    pub missing_grace: u32,
    // mode trials are submitted with
    #[serde(default = "default_mode")]
    pub mode: Mode,
    #[serde(default = "default_walltime")]
    pub walltime: String,
    #[serde(default)]
    pub resources: BTreeMap<Mode, Vec<String>>,
    #[serde(default)]
    pub directives: BTreeMap<Mode, Vec<String>>,
    #[serde(default)]
    pub launchers: BTreeMap<Mode, Vec<String>>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            name: default_executor_name(),
            n_max_jobs: None,
            work_dir: default_work_dir(),
            job_script: None,
            poll_interval_ms: default_poll_interval_ms(),
            timeout_secs: None,
            name_prefix: default_name_prefix(),
            prologue: String::new(),
            env: BTreeMap::new(),
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            submit_command: default_submit_command(),
            status_command: default_status_command(),
            index_var: default_index_var(),
            missing_grace: default_missing_grace(),
            mode: default_mode(),
            walltime: default_walltime(),
            resources: BTreeMap::new(),
            directives: BTreeMap::new(),
            launchers: BTreeMap::new(),
        }
    }
}

impl ExecutorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    pub fn n_max_jobs(&self) -> usize {
        self.n_max_jobs.unwrap_or_else(num_cpus::get)
    }
}

impl BatchConfig {
    /// resource flag templates for `mode`, the grid-engine defaults unless configured
    pub fn resources_for(&self, mode: Mode) -> Vec<String> {
        self.resources
            .get(&mode)
            .cloned()
            .unwrap_or_else(|| default_resources(mode))
    }

    pub fn directives_for(&self, mode: Mode) -> &[String] {
        self.directives
            .get(&mode)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn launcher_for(&self, mode: Mode) -> Option<&[String]> {
        self.launchers.get(&mode).map(Vec::as_slice)
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        let content = fs::read_to_string(path).map_err(|error| {
            if error.kind() == std::io::ErrorKind::NotFound {
                ConfigErrors::FileNotFound(path.to_path_buf())
            } else {
                ConfigErrors::MetadataNotFound(error)
            }
        })?;

        Ok(serde_yaml::from_str(&content)?)
    }

    /// check the config for errors, returns true if any were found
    pub fn preflight_checks(&mut self) -> bool {
        // attempt to catch all errors instead of piece-by-piece to make debugging easier for users
        let mut contains_error = false;

        self.executor.name = self.executor.name.to_lowercase();

        match self.executor.name.as_str() {
            "local" | "batch" => {}
            name => {
                error!("executor.name ({name}) is not supported, please use `local` or `batch`");
                contains_error = true;
            }
        }

        if self.executor.n_max_jobs == Some(0) {
            error!("executor.n_max_jobs must be at least 1");
            contains_error = true;
        }

        if self.executor.poll_interval_ms == 0 {
            error!("executor.poll_interval_ms cannot be 0, this would busy-loop while waiting for jobs");
            contains_error = true;
        }

        if self.executor.timeout_secs.is_some() && self.executor.name == "batch" {
            warn!("executor.timeout_secs is ignored by the batch executor, use the walltime instead");
        }

        if let Some(ref job_script) = self.executor.job_script {
            match check_executable(job_script) {
                Ok(true) => {}
                Ok(false) => {
                    error!(
                        "executor.job_script {} is not executable",
                        job_script.to_string_lossy()
                    );
                    contains_error = true;
                }
                Err(e) => {
                    error!(
                        "Failed to determine if executor.job_script ({}) is an executable: {e}",
                        job_script.to_string_lossy()
                    );
                    contains_error = true;
                }
            }
        }

        if self.batch.submit_command.is_empty() {
            error!("batch.submit_command cannot be empty");
            contains_error = true;
        }

        if self.batch.status_command.is_empty() {
            error!("batch.status_command cannot be empty");
            contains_error = true;
        }

        if self.batch.mode.is_array() {
            error!(
                "batch.mode ({}) cannot be an array mode, trials are submitted one job at a time",
                self.batch.mode
            );
            contains_error = true;
        }

        if self.batch.index_var.is_empty() {
            error!("batch.index_var cannot be empty");
            contains_error = true;
        }

        contains_error
    }
}

/// grid-engine flags used for a mode when `batch.resources` does not configure it.
/// The script writes the log itself, the scheduler's own output goes next to it.
pub fn default_resources(mode: Mode) -> Vec<String> {
    let mut flags = vec!["-N", "{job_name}", "-j", "y", "-l", "h_rt={walltime}"];

    match mode {
        Mode::Cpu => flags.extend(["-o", "{log}.out"]),
        Mode::Gpu => flags.extend(["-o", "{log}.out", "-l", "gpu=1"]),
        // $TASK_ID is expanded by the scheduler itself
        Mode::CpuArray => flags.extend(["-o", "{log}.$TASK_ID.out", "-t", "{array_range}"]),
        Mode::GpuArray => flags.extend([
            "-o",
            "{log}.$TASK_ID.out",
            "-t",
            "{array_range}",
            "-l",
            "gpu={n_procs}",
        ]),
        Mode::Mpi => flags.extend(["-o", "{log}.out", "-pe", "mpi", "{n_procs}"]),
        Mode::Train => flags.extend(["-o", "{log}.out", "-pe", "smp", "{n_procs}", "-l", "gpu={n_procs}"]),
    }

    flags.into_iter().map(str::to_owned).collect()
}

fn default_executor_name() -> String {
    "local".to_owned()
}

fn default_work_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_name_prefix() -> String {
    "job".to_owned()
}

fn default_submit_command() -> Vec<String> {
    vec!["qsub".to_owned()]
}

fn default_status_command() -> Vec<String> {
    vec!["qstat".to_owned(), "-xml".to_owned()]
}

fn default_index_var() -> String {
    DEFAULT_INDEX_VAR.to_owned()
}

fn default_missing_grace() -> u32 {
    3
}

fn default_mode() -> Mode {
    Mode::Cpu
}

fn default_walltime() -> String {
    crate::script::DEFAULT_WALLTIME.to_owned()
}
