//! Rendering of `{name}` style templates over a fixed set of substitution points.
//!
//! Job arguments, scheduler resource flags and the runner scripts are all rendered through
//! here, so every value that ends up in a command line or script goes through one of the
//! [`Placeholder`]s below. `{{` and `}}` produce literal braces.

use std::{collections::BTreeMap, fmt, str::FromStr};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("Unknown placeholder {{{0}}} in {1:?}")]
    UnknownPlaceholder(String, String),
    #[error("Unterminated placeholder in {0:?}")]
    Unterminated(String),
    #[error("Unmatched '}}' in {0:?}")]
    UnmatchedBrace(String),
    #[error("No value was provided for {{{0}}}")]
    MissingValue(Placeholder),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Placeholder {
    // late bound job attributes, usable in job arguments
    JobName,
    JobWorkDir,
    JobLog,
    JobSeq,
    // scheduler resource requests
    Walltime,
    NProcs,
    NNodes,
    ArrayRange,
    Name,
    Log,
    // runner script
    Directives,
    Prologue,
    StatusFile,
    Command,
    IndexVar,
    NTasks,
    TasksPerWorker,
    WorkersPerJob,
    GpuExport,
}

impl Placeholder {
    pub const ALL: [Placeholder; 19] = [
        Self::JobName,
        Self::JobWorkDir,
        Self::JobLog,
        Self::JobSeq,
        Self::Walltime,
        Self::NProcs,
        Self::NNodes,
        Self::ArrayRange,
        Self::Name,
        Self::Log,
        Self::Directives,
        Self::Prologue,
        Self::StatusFile,
        Self::Command,
        Self::IndexVar,
        Self::NTasks,
        Self::TasksPerWorker,
        Self::WorkersPerJob,
        Self::GpuExport,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::JobName => "job.name",
            Self::JobWorkDir => "job.work_dir",
            Self::JobLog => "job.log",
            Self::JobSeq => "job.seq",
            Self::Walltime => "walltime",
            Self::NProcs => "n_procs",
            Self::NNodes => "n_nodes",
            Self::ArrayRange => "array_range",
            Self::Name => "job_name",
            Self::Log => "log",
            Self::Directives => "directives",
            Self::Prologue => "prologue",
            Self::StatusFile => "status_file",
            Self::Command => "command",
            Self::IndexVar => "index_var",
            Self::NTasks => "n_tasks",
            Self::TasksPerWorker => "tasks_per_worker",
            Self::WorkersPerJob => "workers_per_job",
            Self::GpuExport => "gpu_export",
        }
    }
}

impl FromStr for Placeholder {
    type Err = ();

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|placeholder| placeholder.as_str() == name)
            .copied()
            .ok_or(())
    }
}

impl fmt::Display for Placeholder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// values for a single rendering pass
pub type Values = BTreeMap<Placeholder, String>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Slot(Placeholder),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(source: &str) -> Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = source.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    literal.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    literal.push('}');
                }
                '}' => return Err(TemplateError::UnmatchedBrace(source.to_owned())),
                '{' => {
                    let mut name = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some(c) => name.push(c),
                            None => return Err(TemplateError::Unterminated(source.to_owned())),
                        }
                    }

                    let placeholder = name.trim().parse::<Placeholder>().map_err(|_| {
                        TemplateError::UnknownPlaceholder(name.clone(), source.to_owned())
                    })?;

                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Slot(placeholder));
                }
                c => literal.push(c),
            }
        }

        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self { segments })
    }

    /// placeholders referenced by this template, in order of appearance
    pub fn placeholders(&self) -> impl Iterator<Item = Placeholder> + '_ {
        self.segments.iter().filter_map(|segment| match segment {
            Segment::Slot(placeholder) => Some(*placeholder),
            Segment::Literal(_) => None,
        })
    }

    pub fn render(&self, values: &Values) -> Result<String, TemplateError> {
        let mut output = String::new();

        for segment in self.segments.iter() {
            match segment {
                Segment::Literal(literal) => output.push_str(literal),
                Segment::Slot(placeholder) => output.push_str(
                    values
                        .get(placeholder)
                        .ok_or(TemplateError::MissingValue(*placeholder))?,
                ),
            }
        }

        Ok(output)
    }
}

/// parse and render in one go
pub fn render(source: &str, values: &Values) -> Result<String, TemplateError> {
    Template::parse(source)?.render(values)
}

/// render every entry of a list of templates
pub fn render_all<S: AsRef<str>>(
    sources: &[S],
    values: &Values,
) -> Result<Vec<String>, TemplateError> {
    sources
        .iter()
        .map(|source| render(source.as_ref(), values))
        .collect()
}

/// quote a word for POSIX shells, words made only of safe characters are left alone
pub fn shell_quote(word: &str) -> String {
    let is_safe = |c: char| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c);

    if !word.is_empty() && word.chars().all(is_safe) {
        word.to_owned()
    } else {
        format!("'{}'", word.replace('\'', r#"'"'"'"#))
    }
}
