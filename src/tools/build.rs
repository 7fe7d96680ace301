//! Build an archive from a multi-record text stream.
//!
//! A record starts at every line whose first byte is the marker (`>` for
//! FASTA) and runs until the next marker line.  The record is stored as its
//! header line, its body lines verbatim, and a terminating
//! [`RECORD_DELIMITER`].  Its name is the first whitespace-delimited token
//! after the marker; names have no length limit.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

use tracing::{debug, info};

use crate::error::{Error, IoContext, Result};
use crate::format::{FormatError, Index, RECORD_DELIMITER};
use crate::writer::ArchiveWriter;

pub const DEFAULT_MARKER: u8 = b'>';

#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// First byte of a record's header line.
    pub marker: u8,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self { marker: DEFAULT_MARKER }
    }
}

/// Append every record of `input` to `writer`.  Returns the record count.
///
/// `origin` names the input in error messages.  Blank lines before the
/// first header are skipped; any other content there is an error.
pub fn build<R: BufRead>(
    mut input: R,
    origin:    &Path,
    writer:    &mut ArchiveWriter,
    opts:      &BuildOptions,
) -> Result<usize> {
    let mut line = Vec::new();
    let mut record = Vec::new();
    let mut name: Option<String> = None;
    let mut line_no = 0usize;
    let mut count = 0usize;

    loop {
        line.clear();
        if input.read_until(b'\n', &mut line).at(origin)? == 0 {
            break;
        }
        line_no += 1;

        if line.first() == Some(&opts.marker) {
            if let Some(done) = name.take() {
                emit(writer, &done, &mut record)?;
                count += 1;
            }
            let header = trim_end(&line[1..]);
            let end = header.iter().position(|&b| b < 33).unwrap_or(header.len());
            if end == 0 {
                return Err(Error::format(origin, FormatError::EmptyRecordName { position: count }));
            }
            record.push(opts.marker);
            record.extend_from_slice(header);
            record.push(b'\n');
            name = Some(String::from_utf8_lossy(&header[..end]).into_owned());
        } else if name.is_some() {
            record.extend_from_slice(&line);
        } else if !line.iter().all(u8::is_ascii_whitespace) {
            return Err(Error::format(origin, FormatError::OrphanContent { line: line_no }));
        }
    }
    if let Some(done) = name.take() {
        emit(writer, &done, &mut record)?;
        count += 1;
    }
    Ok(count)
}

fn emit(writer: &mut ArchiveWriter, name: &str, record: &mut Vec<u8>) -> Result<()> {
    record.push(RECORD_DELIMITER);
    let entry = writer.append(name, &record[..])?;
    debug!(name, offset = entry.offset, length = entry.length, "record stored");
    record.clear();
    Ok(())
}

fn trim_end(bytes: &[u8]) -> &[u8] {
    let end = bytes.iter().rposition(|b| !b.is_ascii_whitespace()).map_or(0, |i| i + 1);
    &bytes[..end]
}

/// Build `data_out` + `index_out` from `input` (stdin when `None`).
pub fn build_archive(
    input:     Option<&Path>,
    data_out:  &Path,
    index_out: &Path,
    opts:      &BuildOptions,
) -> Result<Index> {
    let protected: Vec<&Path> = input.into_iter().collect();
    let mut writer = ArchiveWriter::create_protected(data_out, index_out, &protected)?;
    let count = match input {
        Some(path) => {
            let file = File::open(path).at(path)?;
            build(BufReader::new(file), path, &mut writer, opts)?
        }
        None => build(io::stdin().lock(), Path::new("<stdin>"), &mut writer, opts)?,
    };
    let index = writer.finish()?;
    info!(records = count, data = %data_out.display(), "archive built");
    Ok(index)
}
