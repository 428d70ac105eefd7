//! Sharding of a task collection across array workers.
//!
//! An array job runs `workers_per_job` workers per scheduler slot, each owning
//! `tasks_per_worker` consecutive tasks. Workers learn their share from the `TASK_INDEX`
//! (1-based) and `TASK_STEPSIZE` environment variables.

use std::{env, num::NonZeroUsize};
use thiserror::Error;

pub const TASK_INDEX_VAR: &str = "TASK_INDEX";
pub const TASK_STEPSIZE_VAR: &str = "TASK_STEPSIZE";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SliceError {
    #[error("{present} is set but {missing} is not")]
    Incomplete {
        present: &'static str,
        missing: &'static str,
    },
    #[error("{name} must be an integer, got {value:?}")]
    NotAnInteger { name: &'static str, value: String },
    #[error("{name} must be positive, got {value}")]
    NonPositive { name: &'static str, value: i64 },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LayoutError {
    #[error("{0} must be at least 1")]
    Zero(&'static str),
}

fn parse_positive(name: &'static str, value: &str) -> Result<usize, SliceError> {
    let parsed = value
        .trim()
        .parse::<i64>()
        .map_err(|_| SliceError::NotAnInteger {
            name,
            value: value.to_owned(),
        })?;

    if parsed <= 0 {
        return Err(SliceError::NonPositive {
            name,
            value: parsed,
        });
    }

    usize::try_from(parsed).map_err(|_| SliceError::NotAnInteger {
        name,
        value: value.to_owned(),
    })
}

/// select the share of `items` owned by the worker described by `task_index`/`task_stepsize`
///
/// Without any metadata the whole collection is returned. The range is clipped to the
/// collection, the last worker of an array may own fewer tasks than the stride.
pub fn slice_tasks<'a, T>(
    items: &'a [T],
    task_index: Option<&str>,
    task_stepsize: Option<&str>,
) -> Result<&'a [T], SliceError> {
    let (index, stepsize) = match (task_index, task_stepsize) {
        (None, None) => return Ok(items),
        (Some(_), None) => {
            return Err(SliceError::Incomplete {
                present: TASK_INDEX_VAR,
                missing: TASK_STEPSIZE_VAR,
            })
        }
        (None, Some(_)) => {
            return Err(SliceError::Incomplete {
                present: TASK_STEPSIZE_VAR,
                missing: TASK_INDEX_VAR,
            })
        }
        (Some(index), Some(stepsize)) => (
            parse_positive(TASK_INDEX_VAR, index)?,
            parse_positive(TASK_STEPSIZE_VAR, stepsize)?,
        ),
    };

    let start = (index - 1).min(items.len());
    let end = start.saturating_add(stepsize).min(items.len());

    Ok(&items[start..end])
}

/// `slice_tasks` with the metadata taken from the process environment
pub fn slice_tasks_from_env<T>(items: &[T]) -> Result<&[T], SliceError> {
    let index = env::var(TASK_INDEX_VAR).ok();
    let stepsize = env::var(TASK_STEPSIZE_VAR).ok();

    slice_tasks(items, index.as_deref(), stepsize.as_deref())
}

/// Geometry of an array submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArrayLayout {
    pub n_tasks: NonZeroUsize,
    pub tasks_per_worker: NonZeroUsize,
    pub workers_per_job: NonZeroUsize,
}

impl ArrayLayout {
    pub fn new(
        n_tasks: usize,
        tasks_per_worker: usize,
        workers_per_job: usize,
    ) -> Result<Self, LayoutError> {
        Ok(Self {
            n_tasks: NonZeroUsize::new(n_tasks).ok_or(LayoutError::Zero("n_tasks"))?,
            tasks_per_worker: NonZeroUsize::new(tasks_per_worker)
                .ok_or(LayoutError::Zero("tasks_per_worker"))?,
            workers_per_job: NonZeroUsize::new(workers_per_job)
                .ok_or(LayoutError::Zero("workers_per_job"))?,
        })
    }

    /// tasks covered by a single scheduler slot
    pub fn stride(&self) -> usize {
        self.tasks_per_worker.get() * self.workers_per_job.get()
    }

    pub fn n_slots(&self) -> usize {
        (self.n_tasks.get() + self.stride() - 1) / self.stride()
    }

    /// 1-based first task of every slot, i.e. the values the scheduler assigns to its index var
    pub fn slot_starts(&self) -> impl Iterator<Item = usize> {
        (1..=self.n_tasks.get()).step_by(self.stride())
    }

    /// `start-end:step` range for the scheduler's array directive
    pub fn array_range(&self) -> String {
        format!("1-{}:{}", self.n_tasks, self.stride())
    }

    /// `TASK_INDEX` of every worker launched by the slot starting at `slot_start`
    pub fn worker_indices(&self, slot_start: usize) -> impl Iterator<Item = usize> {
        let n_tasks = self.n_tasks.get();
        let tasks_per_worker = self.tasks_per_worker.get();

        (0..self.workers_per_job.get())
            .map(move |worker| slot_start + worker * tasks_per_worker)
            .take_while(move |index| *index <= n_tasks)
    }
}
