use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::apply::FailureRecord;
use crate::format::FormatError;

/// Crate-level error.  Module errors ([`FormatError`],
/// [`WorkerError`](crate::apply::WorkerError)) are wrapped here once they
/// leave the module that detected them.
#[derive(Error, Debug)]
pub enum Error {
    #[error("{path}: {source}")]
    Io {
        path:   PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{file}: {source}")]
    Format {
        file:   String,
        #[source]
        source: FormatError,
    },
    /// The writer was handed a layout it could not have produced itself.
    #[error("Inconsistent archive layout: {0}")]
    Consistency(String),
    #[error(
        "Aborted after record {} ({}) failed: {}; {completed} completed, {failed} failed, {discarded} discarded",
        first.position, first.name, first.message
    )]
    Aborted {
        first:     Box<FailureRecord>,
        completed: usize,
        failed:    usize,
        discarded: usize,
    },
    #[error("Cancelled: {completed} record(s) completed, {discarded} discarded; nothing written")]
    Cancelled { completed: usize, discarded: usize },
    #[error("Entry not found: {0}")]
    NotFound(String),
    #[error("Invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn io<P: AsRef<Path>>(path: P, source: io::Error) -> Self {
        Error::Io { path: path.as_ref().to_owned(), source }
    }

    pub fn format<P: AsRef<Path>>(file: P, source: FormatError) -> Self {
        Error::Format { file: file.as_ref().display().to_string(), source }
    }
}

/// Attach a path to a bare `io::Result`.
pub(crate) trait IoContext<T> {
    fn at<P: AsRef<Path>>(self, path: P) -> Result<T>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn at<P: AsRef<Path>>(self, path: P) -> Result<T> {
        self.map_err(|e| Error::io(path, e))
    }
}
