//! Driving an optimizer with an executor.
//!
//! The search algorithms themselves live outside of this crate, they are only seen through
//! [`Optimizer`]. Every trial becomes one job, tagged with the [`Trial`] it evaluates.

use crate::{
    executors::{ExecutorError, JobExecutor},
    job::{Job, JobError},
};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, thread};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum SearchError {
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    #[error(transparent)]
    Job(#[from] JobError),
    #[error("Failed to read objective: {0}")]
    Objective(String),
}

/// A concrete parameter value handed out by an optimizer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(value) => write!(f, "{value}"),
            Self::Float(value) => write!(f, "{value}"),
            Self::Text(value) => f.write_str(value),
        }
    }
}

pub type Params = BTreeMap<String, ParamValue>;

#[derive(Debug, Clone, PartialEq)]
pub struct Trial {
    /// 0-based, in the order the optimizer was asked
    pub number: usize,
    pub params: Params,
}

impl Trial {
    /// `--name=value` for every parameter
    pub fn args(&self) -> Vec<String> {
        self.params
            .iter()
            .map(|(name, value)| format!("--{name}={value}"))
            .collect()
    }
}

pub trait Optimizer {
    /// next parameters to evaluate, `None` once the optimizer has nothing left to try
    fn ask(&mut self) -> Option<Params>;

    /// report the objective of a trial, `None` if the trial failed
    fn tell(&mut self, params: &Params, value: Option<f64>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Minimize,
    Maximize,
}

impl Direction {
    pub fn is_better(&self, candidate: f64, current: f64) -> bool {
        match self {
            Self::Minimize => candidate < current,
            Self::Maximize => candidate > current,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchSummary {
    pub n_completed: usize,
    pub n_failed: usize,
    pub best: Option<(Trial, f64)>,
}

impl SearchSummary {
    fn record(&mut self, trial: Trial, value: Option<f64>, direction: Direction) {
        let Some(value) = value else {
            self.n_failed += 1;
            return;
        };

        self.n_completed += 1;

        let improves = match &self.best {
            Some((_, best)) => direction.is_better(value, *best),
            None => !value.is_nan(),
        };

        if improves {
            info!(trial = trial.number, value = value, "New best trial");
            self.best = Some((trial, value));
        }
    }
}

/// objective printed as the last non-empty line of the job's output
pub fn last_value(output: &str) -> Result<f64, SearchError> {
    let line = output
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .ok_or_else(|| SearchError::Objective("output is empty".to_owned()))?;

    line.parse()
        .map_err(|_| SearchError::Objective(format!("{line:?} is not a number")))
}

/// default objective reader, the job has to succeed and print its value last
pub fn read_last_value(job: &Job<Trial>) -> Result<f64, SearchError> {
    last_value(&job.result()?.output)
}

/// Run up to `n_trials` trials, keeping the executor's slots filled.
///
/// Returns once every submitted trial was told to the optimizer, either because `n_trials`
/// were run or because the optimizer ran out of parameters.
pub fn run_search<E, O, A, R>(
    executor: &mut E,
    optimizer: &mut O,
    n_trials: usize,
    direction: Direction,
    mut args_for: A,
    mut read_result: R,
) -> Result<SearchSummary, SearchError>
where
    E: JobExecutor<Trial>,
    O: Optimizer,
    A: FnMut(&Trial) -> Vec<String>,
    R: FnMut(&Job<Trial>) -> Result<f64, SearchError>,
{
    let mut summary = SearchSummary::default();
    let mut n_submitted = 0;
    let mut n_told = 0;
    let mut exhausted = false;

    while n_told < n_submitted || (!exhausted && n_submitted < n_trials) {
        while !exhausted && n_submitted < n_trials && executor.available_slots() > 0 {
            match optimizer.ask() {
                Some(params) => {
                    let trial = Trial {
                        number: n_submitted,
                        params,
                    };
                    let args = args_for(&trial);

                    executor.submit(&args, trial)?;
                    n_submitted += 1;
                }
                None => {
                    info!(n_submitted = n_submitted, "Optimizer has no more trials");
                    exhausted = true;
                }
            }
        }

        let finished = executor.collect_finished()?;

        if finished.is_empty() {
            thread::sleep(executor.poll_interval());
            continue;
        }

        for job in finished {
            let value = match read_result(&job) {
                Ok(value) => Some(value),
                Err(error) => {
                    warn!(job = %job.name(), error = %error, "Trial failed");
                    None
                }
            };

            let trial = job.into_tag();
            debug!(trial = trial.number, value = ?value, "Telling optimizer");

            optimizer.tell(&trial.params, value);
            n_told += 1;
            summary.record(trial, value, direction);
        }
    }

    info!(
        n_completed = summary.n_completed,
        n_failed = summary.n_failed,
        "Search done"
    );

    Ok(summary)
}
