//! Generation of the bash scripts wrapping user commands.
//!
//! Every script records its exit status in a [`StatusFile`](crate::status_file::StatusFile)
//! from an exit trap, so the submitting side can tell success from failure without asking the
//! scheduler. Array scripts fan out into `workers_per_job` background workers per slot.

use crate::{
    config::BatchConfig,
    status_file::StatusFile,
    tasks::{ArrayLayout, TASK_INDEX_VAR, TASK_STEPSIZE_VAR},
    template::{self, shell_quote, Placeholder, Template, TemplateError, Values},
};
use itertools::Itertools;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::{
    fmt, fs, io,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_WALLTIME: &str = "1:00:00";
pub const DEFAULT_INDEX_VAR: &str = "SGE_TASK_ID";

#[derive(Error, Debug)]
pub enum ScriptError {
    #[error("Failed to render job script: {0}")]
    Template(#[from] TemplateError),
    #[error("{0} mode requires an array layout")]
    MissingLayout(Mode),
    #[error("Failed to write job script {0:?}: {1}")]
    Write(PathBuf, #[source] io::Error),
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    Cpu,
    Gpu,
    CpuArray,
    GpuArray,
    Mpi,
    Train,
}

impl Mode {
    pub fn is_array(&self) -> bool {
        matches!(self, Self::CpuArray | Self::GpuArray)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Gpu => "gpu",
            Self::CpuArray => "cpu-array",
            Self::GpuArray => "gpu-array",
            Self::Mpi => "mpi",
            Self::Train => "train",
        }
    }

    /// command prefix used when no launcher is configured for the mode
    pub fn default_launcher(&self) -> &'static [&'static str] {
        match self {
            Self::Mpi => &["mpirun", "-np", "{n_procs}"],
            Self::Train => &["torchrun", "--nnodes={n_nodes}", "--nproc_per_node={n_procs}"],
            _ => &[],
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resource request of a single submission, the values behind the scheduler flag templates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceOptions {
    pub walltime: String,
    pub n_procs: usize,
    pub n_nodes: usize,
    pub layout: Option<ArrayLayout>,
}

impl Default for ResourceOptions {
    fn default() -> Self {
        Self {
            walltime: DEFAULT_WALLTIME.to_owned(),
            n_procs: 1,
            n_nodes: 1,
            layout: None,
        }
    }
}

impl ResourceOptions {
    pub fn values(&self, job_name: &str, log: &Path) -> Values {
        let mut values = Values::from([
            (Placeholder::Walltime, self.walltime.clone()),
            (Placeholder::NProcs, self.n_procs.to_string()),
            (Placeholder::NNodes, self.n_nodes.to_string()),
            (Placeholder::Name, job_name.to_owned()),
            (Placeholder::Log, log.to_string_lossy().into_owned()),
        ]);

        if let Some(layout) = self.layout {
            values.insert(Placeholder::ArrayRange, layout.array_range());
        }

        values
    }
}

/// Everything needed to render one runner script
#[derive(Debug, Clone)]
pub struct ScriptSpec {
    pub mode: Mode,
    /// user command as argv, every word is quoted on rendering
    pub command: Vec<String>,
    /// rendered launcher prefix (e.g. `mpirun -np 4`)
    pub launcher: Vec<String>,
    pub log: PathBuf,
    pub status_file: PathBuf,
    pub prologue: String,
    /// extra header lines such as `#$ -l h_rt=1:00:00`
    pub directives: Vec<String>,
    pub layout: Option<ArrayLayout>,
    pub index_var: String,
}

impl ScriptSpec {
    /// script for `mode` with launcher and directives rendered from the batch config
    pub fn build(
        mode: Mode,
        command: Vec<String>,
        log: &Path,
        job_name: &str,
        options: &ResourceOptions,
        config: &BatchConfig,
        prologue: String,
    ) -> Result<Self, ScriptError> {
        let layout = match (mode.is_array(), options.layout) {
            (true, None) => return Err(ScriptError::MissingLayout(mode)),
            (true, layout) => layout,
            (false, _) => None,
        };

        let values = options.values(job_name, log);

        Ok(Self {
            mode,
            command,
            launcher: render_launcher(mode, config.launcher_for(mode), &values)?,
            log: log.to_path_buf(),
            status_file: StatusFile::for_log(log).path().to_path_buf(),
            prologue,
            directives: template::render_all(config.directives_for(mode), &values)?,
            layout,
            index_var: config.index_var.clone(),
        })
    }
}

const TRAP_SECTION: &str = r#"on_exit() {{
    code=$?
    printf '%d\n' "$code" > "$status_file.tmp" && mv -f "$status_file.tmp" "$status_file"
}}
trap on_exit EXIT
trap 'exit 129' HUP
trap 'exit 130' INT
trap 'exit 143' TERM
"#;

static SINGLE_TEMPLATE: Lazy<String> = Lazy::new(|| {
    format!(
        r#"#!/bin/bash
{{directives}}
set -eu -o pipefail

status_file={{status_file}}
{TRAP_SECTION}
{{prologue}}

{{command}} 2>&1 | tee -a {{log}}
"#
    )
});

static ARRAY_TEMPLATE: Lazy<String> = Lazy::new(|| {
    format!(
        r#"#!/bin/bash
{{directives}}
set -eu -o pipefail

slot_start=${{{{1:-${{{{{{index_var}}:-1}}}}}}}}
status_file={{status_file}}
{TRAP_SECTION}
{{prologue}}

n_tasks={{n_tasks}}
tasks_per_worker={{tasks_per_worker}}
workers_per_job={{workers_per_job}}

pids=()
for ((worker = 0; worker < workers_per_job; worker++)); do
    task_index=$((slot_start + worker * tasks_per_worker))
    if ((task_index > n_tasks)); then
        break
    fi
    (
        export {TASK_INDEX_VAR}=$task_index
        export {TASK_STEPSIZE_VAR}=$tasks_per_worker
{{gpu_export}}
        {{command}} > {{log}}.$task_index 2>&1
    ) &
    pids+=($!)
done

rc=0
for pid in "${{{{pids[@]}}}}"; do
    code=0
    wait "$pid" || code=$?
    if ((rc == 0 && code != 0)); then
        rc=$code
    fi
done
exit "$rc"
"#
    )
});

pub struct JobScript;

impl JobScript {
    pub fn render(spec: &ScriptSpec) -> Result<String, ScriptError> {
        let command = spec
            .launcher
            .iter()
            .chain(spec.command.iter())
            .map(|word| shell_quote(word))
            .join(" ");

        let mut values = Values::from([
            (Placeholder::Directives, spec.directives.join("\n")),
            (Placeholder::Prologue, spec.prologue.clone()),
            (Placeholder::Command, command),
            (
                Placeholder::Log,
                shell_quote(&spec.log.to_string_lossy()),
            ),
        ]);

        let source = if spec.mode.is_array() {
            let layout = spec.layout.ok_or(ScriptError::MissingLayout(spec.mode))?;
            // one status file per slot, keyed by the slot's first task
            let stem = spec.status_file.with_extension("");

            values.insert(
                Placeholder::StatusFile,
                format!("{}.${{slot_start}}.status", shell_quote(&stem.to_string_lossy())),
            );
            values.insert(Placeholder::IndexVar, spec.index_var.clone());
            values.insert(Placeholder::NTasks, layout.n_tasks.to_string());
            values.insert(
                Placeholder::TasksPerWorker,
                layout.tasks_per_worker.to_string(),
            );
            values.insert(
                Placeholder::WorkersPerJob,
                layout.workers_per_job.to_string(),
            );
            values.insert(
                Placeholder::GpuExport,
                if spec.mode == Mode::GpuArray {
                    "        export CUDA_VISIBLE_DEVICES=$worker".to_owned()
                } else {
                    String::new()
                },
            );

            ARRAY_TEMPLATE.as_str()
        } else {
            values.insert(
                Placeholder::StatusFile,
                shell_quote(&spec.status_file.to_string_lossy()),
            );

            SINGLE_TEMPLATE.as_str()
        };

        Ok(Template::parse(source)?.render(&values)?)
    }

    /// render the script and write it as an executable file
    pub fn write(spec: &ScriptSpec, path: &Path) -> Result<(), ScriptError> {
        let script = Self::render(spec)?;

        fs::write(path, script)
            .and_then(|_| fs::set_permissions(path, fs::Permissions::from_mode(0o755)))
            .map_err(|error| ScriptError::Write(path.to_path_buf(), error))?;

        debug!(path = ?path, mode = %spec.mode, "Wrote job script");

        Ok(())
    }
}

/// render a launcher prefix, falling back to the default of the mode
pub fn render_launcher(
    mode: Mode,
    configured: Option<&[String]>,
    values: &Values,
) -> Result<Vec<String>, TemplateError> {
    match configured {
        Some(launcher) => template::render_all(launcher, values),
        None => template::render_all(mode.default_launcher(), values),
    }
}
