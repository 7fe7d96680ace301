pub mod error;
pub mod format;
pub mod source;
pub mod apply;
pub mod writer;
pub mod signal;
pub mod tools;
pub mod logging;

pub use error::{Error, Result};
pub use format::{Entry, Index, FormatError, parse_index_line, format_index_line, RECORD_DELIMITER};
pub use source::{DataFile, Record, RecordSource};
pub use apply::{apply, apply_to_archive, ApplyOptions, ApplyOutput, CommandTransform, FailurePolicy,
                FailureReport, Framing, Transform, WorkerError};
pub use writer::ArchiveWriter;
pub use signal::CancelToken;
