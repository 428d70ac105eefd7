//! Exit code hand-over between a runner script and the submitting process.
//!
//! The script's exit trap writes the numeric exit status into a file next to the log once the
//! job is done. The file is written through a temporary name and renamed, readers either see
//! nothing or the full code.

use crate::job::JobError;
use std::{
    fs, io,
    path::{Path, PathBuf},
    thread,
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Error, Debug)]
pub enum StatusFileError {
    #[error("Failed to access status file {0:?}: {1}")]
    Io(PathBuf, #[source] io::Error),
    #[error("Status file {path:?} does not contain an exit code: {content:?}")]
    Malformed { path: PathBuf, content: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusFile {
    path: PathBuf,
}

/// `dir/name.log` -> `dir/name`
fn stem(log: &Path) -> PathBuf {
    log.with_extension("")
}

impl StatusFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// status file of a single job logging to `log`
    pub fn for_log(log: &Path) -> Self {
        let mut path = stem(log).into_os_string();
        path.push(".status");

        Self::new(PathBuf::from(path))
    }

    /// status file of the array slot starting at task `slot`
    pub fn for_slot(log: &Path, slot: usize) -> Self {
        let mut path = stem(log).into_os_string();
        path.push(format!(".{slot}.status"));

        Self::new(PathBuf::from(path))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// read the exit code without consuming the file
    pub fn peek(&self) -> Result<Option<i32>, StatusFileError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(StatusFileError::Io(self.path.clone(), error)),
        };

        content
            .trim()
            .parse::<i32>()
            .map(Some)
            .map_err(|_| StatusFileError::Malformed {
                path: self.path.clone(),
                content,
            })
    }

    /// read and delete the status file, `None` means the job has not completed yet
    pub fn poll(&self) -> Result<Option<i32>, StatusFileError> {
        let code = self.peek()?;

        if code.is_some() {
            fs::remove_file(&self.path)
                .map_err(|error| StatusFileError::Io(self.path.clone(), error))?;
            debug!(path = ?self.path, code = ?code, "Consumed status file");
        }

        Ok(code)
    }

    /// block until the status file shows up
    pub fn wait(&self, interval: Duration) -> Result<i32, StatusFileError> {
        loop {
            if let Some(code) = self.poll()? {
                return Ok(code);
            }

            trace!(path = ?self.path, "Waiting for status file");
            thread::sleep(interval);
        }
    }

    /// remove a stale file from an earlier run
    pub fn clear(&self) -> Result<(), StatusFileError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(StatusFileError::Io(self.path.clone(), error)),
        }
    }
}

/// interpret an exit code read from a status file
pub fn exit_code_result(name: &str, code: i32, output: String) -> Result<(), JobError> {
    if code == 0 {
        Ok(())
    } else {
        Err(JobError::Failed {
            name: name.to_owned(),
            exit_code: Some(code),
            output,
        })
    }
}
