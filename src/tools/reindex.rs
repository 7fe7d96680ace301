//! Rebuild an index by scanning a data file for record delimiters.

use std::collections::HashSet;
use std::path::Path;

use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::format::{leading_token, Entry, FormatError, Index, RECORD_DELIMITER};
use crate::source::DataFile;
use crate::writer::write_index_atomic;

#[derive(Debug, Clone, Default)]
pub struct ReindexOptions {
    /// Name records by their leading token instead of their ordinal.
    pub parse_names:       bool,
    /// Make repeated parsed names unique by appending `^` instead of failing.
    pub rename_duplicates: bool,
}

/// Derive an index from `data`.  Each record runs through its terminating
/// delimiter, which counts towards its length.  Bytes after the last
/// delimiter do not form a record.
pub fn reindex(data: &[u8], opts: &ReindexOptions) -> std::result::Result<Index, FormatError> {
    let mut entries = Vec::new();
    let mut names = HashSet::new();
    let mut start = 0usize;

    for (position, rel) in data.split_inclusive(|&b| b == RECORD_DELIMITER).enumerate() {
        if rel.last() != Some(&RECORD_DELIMITER) {
            warn!(offset = start, bytes = rel.len(), "ignoring unterminated bytes at end of data");
            break;
        }
        let name = if opts.parse_names {
            let mut name = leading_token(rel);
            if name.is_empty() {
                return Err(FormatError::EmptyRecordName { position });
            }
            while names.contains(&name) {
                if !opts.rename_duplicates {
                    return Err(FormatError::DuplicateName { position, name });
                }
                name.push('^');
            }
            names.insert(name.clone());
            name
        } else {
            position.to_string()
        };
        entries.push(Entry::new(name, start as u64, rel.len() as u64));
        start += rel.len();
    }
    Ok(Index::new(entries))
}

/// Reindex the data file at `data_path` into `index_out`.
pub fn reindex_file(data_path: &Path, index_out: &Path, opts: &ReindexOptions) -> Result<Index> {
    let data = DataFile::open(data_path)?;
    let index = reindex(&data, opts).map_err(|e| Error::format(data_path, e))?;
    write_index_atomic(index_out, &index, &[data_path])?;
    info!(records = index.len(), index = %index_out.display(), "reindexed");
    Ok(index)
}
