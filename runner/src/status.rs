use serde_repr::{Deserialize_repr, Serialize_repr};
use std::fmt;
use thiserror::Error;
use tracing::trace;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StatusError {
    #[error("Unknown scheduler state code {0:?}")]
    UnknownCode(String),
}

/// Lifecycle of a single job.
/// The discriminants encode the progression, `Finished` and `Error` share the terminal rank.
#[derive(Serialize_repr, Deserialize_repr, PartialEq, Eq, Debug, Clone, Copy, Hash)]
#[repr(u8)]
pub enum Status {
    Unsubmitted = 0,
    Waiting = 1,
    Running = 2,
    Finished = 3,
    Error = 4,
}

impl Status {
    /// translate a grid-engine state code (as listed by `qstat`) into a status
    pub fn from_backend_status(code: &str) -> Result<Self, StatusError> {
        match code {
            "r" | "d" | "Rr" | "dr" | "dt" => Ok(Self::Running),
            "qw" | "hqw" | "hRwq" | "h" | "t" | "s" | "S" | "T" | "Rq" => Ok(Self::Waiting),
            "E" | "Eqw" => Ok(Self::Error),
            unknown => Err(StatusError::UnknownCode(unknown.to_owned())),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Error)
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Unsubmitted => 0,
            Self::Waiting => 1,
            Self::Running => 2,
            Self::Finished | Self::Error => 3,
        }
    }

    /// move forward to `next`, regressions and terminal-to-terminal moves are ignored
    /// returns true if the status changed
    pub fn advance(&mut self, next: Status) -> bool {
        if self.is_terminal() || next.rank() <= self.rank() {
            if next != *self {
                trace!(current = ?self, ignored = ?next, "Ignored backward status transition");
            }

            return false;
        }

        *self = next;

        true
    }
}

impl Default for Status {
    fn default() -> Self {
        Self::Unsubmitted
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unsubmitted => write!(f, "unsubmitted"),
            Self::Waiting => write!(f, "waiting"),
            Self::Running => write!(f, "running"),
            Self::Finished => write!(f, "finished"),
            Self::Error => write!(f, "error"),
        }
    }
}
