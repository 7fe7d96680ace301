//! Index-file codec and record-boundary conventions.
//!
//! # Index file
//! Plain text, one entry per line:
//!
//! ```text
//! <name>\t<offset>\t<length>\n
//! ```
//!
//! `offset` and `length` are decimal byte counts into the paired data file.
//! Names are opaque and unbounded in length but may not contain a tab or a
//! newline.  Entry order is significant: it is the order records were
//! created in, and every tool preserves it.
//!
//! # Data file
//! Raw bytes.  Record `i` occupies `[offset_i, offset_i + length_i)`.  Tools
//! that write records in the classic layout terminate each one with
//! [`RECORD_DELIMITER`] and count it in `length`; only reindexing relies on
//! that terminator to find boundaries.

use std::fs;
use std::io::{self, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{Error, IoContext, Result};

/// Byte that terminates a record in the data file.
pub const RECORD_DELIMITER: u8 = 0;

/// Field separator inside an index line.
pub const FIELD_SEPARATOR: char = '\t';

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    #[error("line {line}: expected 3 tab-separated fields, found {found}")]
    FieldCount { line: usize, found: usize },
    #[error("line {line}: empty entry name")]
    EmptyName { line: usize },
    #[error("line {line}: {field} is not a non-negative integer: '{value}'")]
    BadNumber { line: usize, field: &'static str, value: String },
    #[error("line {line}: entry '{name}' spans {offset}+{length} but the data file holds {data_len} bytes")]
    OutOfBounds { line: usize, name: String, offset: u64, length: u64, data_len: u64 },
    #[error("record {position}: no name could be read from the record content")]
    EmptyRecordName { position: usize },
    #[error("record {position}: duplicate name '{name}'")]
    DuplicateName { position: usize, name: String },
    #[error("line {line}: content before the first record marker")]
    OrphanContent { line: usize },
    #[error("entry name '{0}' contains a tab or newline")]
    UnencodableName(String),
}

impl FormatError {
    /// Rewrite the line number of a line-scoped error.
    pub fn with_line(self, n: usize) -> Self {
        match self {
            FormatError::FieldCount { found, .. }  => FormatError::FieldCount { line: n, found },
            FormatError::EmptyName { .. }          => FormatError::EmptyName { line: n },
            FormatError::BadNumber { field, value, .. } =>
                FormatError::BadNumber { line: n, field, value },
            other => other,
        }
    }
}

// ── Entry ────────────────────────────────────────────────────────────────────

/// Location of one record in the data file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Entry {
    pub name:   String,
    pub offset: u64,
    pub length: u64,
}

impl Entry {
    pub fn new(name: impl Into<String>, offset: u64, length: u64) -> Self {
        Self { name: name.into(), offset, length }
    }

    /// One past the last byte of the record.  `None` on overflow.
    pub fn end(&self) -> Option<u64> {
        self.offset.checked_add(self.length)
    }
}

/// Parse one index line.  A trailing `\n` or `\r\n` is ignored.
///
/// Errors report line 1; [`Index::parse`] rewrites the number to the real
/// line.
pub fn parse_index_line(line: &str) -> std::result::Result<Entry, FormatError> {
    let line = line.strip_suffix('\n').unwrap_or(line);
    let line = line.strip_suffix('\r').unwrap_or(line);

    let fields: Vec<&str> = line.split(FIELD_SEPARATOR).collect();
    if fields.len() != 3 {
        return Err(FormatError::FieldCount { line: 1, found: fields.len() });
    }
    if fields[0].is_empty() {
        return Err(FormatError::EmptyName { line: 1 });
    }
    Ok(Entry {
        name:   fields[0].to_owned(),
        offset: parse_u64(fields[1], "offset")?,
        length: parse_u64(fields[2], "length")?,
    })
}

fn parse_u64(s: &str, field: &'static str) -> std::result::Result<u64, FormatError> {
    let bad = || FormatError::BadNumber { line: 1, field, value: s.to_owned() };
    // `str::parse` tolerates a leading '+'; the format does not.
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(bad());
    }
    s.parse().map_err(|_| bad())
}

/// Encode one entry, newline included.  Inverse of [`parse_index_line`].
pub fn format_index_line(entry: &Entry) -> String {
    format!("{}\t{}\t{}\n", entry.name, entry.offset, entry.length)
}

/// True when `name` can be written to an index line and read back unchanged.
pub fn is_encodable_name(name: &str) -> bool {
    !name.is_empty() && !name.contains(['\t', '\n', '\r'])
}

/// The first whitespace-delimited token of a record: bytes up to the first
/// byte below `!` (space, control characters, the delimiter), with leading
/// `#` and `>` markers removed.
pub fn leading_token(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b < 33).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end])
        .trim_start_matches(['#', '>'])
        .to_owned()
}

// ── Index ────────────────────────────────────────────────────────────────────

/// Ordered sequence of entries, as stored in an index file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Index {
    pub entries: Vec<Entry>,
}

impl Index {
    pub fn new(entries: Vec<Entry>) -> Self {
        Self { entries }
    }

    pub fn parse(text: &str) -> std::result::Result<Self, FormatError> {
        let entries = text
            .lines()
            .enumerate()
            .map(|(i, line)| parse_index_line(line).map_err(|e| e.with_line(i + 1)))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Self { entries })
    }

    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).at(path)?;
        Self::parse(&text).map_err(|e| Error::format(path, e))
    }

    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        for entry in &self.entries {
            writer.write_all(format_index_line(entry).as_bytes())?;
        }
        Ok(())
    }

    pub fn to_text(&self) -> String {
        self.entries.iter().map(format_index_line).collect()
    }

    pub fn len(&self) -> usize { self.entries.len() }

    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    pub fn iter(&self) -> std::slice::Iter<'_, Entry> { self.entries.iter() }

    pub fn get(&self, position: usize) -> Option<&Entry> { self.entries.get(position) }

    /// First entry named `name`.
    pub fn find(&self, name: &str) -> Option<(usize, &Entry)> {
        self.entries.iter().enumerate().find(|(_, e)| e.name == name)
    }

    /// Stable sort by name.
    pub fn sort_by_name(&mut self) {
        self.entries.sort_by(|a, b| a.name.cmp(&b.name));
    }

    /// Check every entry against the size of its data file.
    pub fn validate(&self, data_len: u64) -> std::result::Result<(), FormatError> {
        for (i, e) in self.entries.iter().enumerate() {
            match e.end() {
                Some(end) if end <= data_len => {}
                _ => return Err(FormatError::OutOfBounds {
                    line:   i + 1,
                    name:   e.name.clone(),
                    offset: e.offset,
                    length: e.length,
                    data_len,
                }),
            }
        }
        Ok(())
    }

    /// Check that entries in index order never overlap and that every name
    /// survives an index-file round trip.
    pub fn check_layout(&self) -> Result<()> {
        let mut cursor = 0u64;
        for (i, e) in self.entries.iter().enumerate() {
            if !is_encodable_name(&e.name) {
                return Err(Error::Consistency(format!(
                    "entry {i} has unencodable name {:?}", e.name)));
            }
            let end = e.end().ok_or_else(|| Error::Consistency(format!(
                "entry {i} ('{}') overflows: {}+{}", e.name, e.offset, e.length)))?;
            if e.offset < cursor {
                return Err(Error::Consistency(format!(
                    "entry {i} ('{}') at offset {} overlaps the previous entry ending at {cursor}",
                    e.name, e.offset)));
            }
            cursor = end;
        }
        Ok(())
    }
}

impl<'a> IntoIterator for &'a Index {
    type Item = &'a Entry;
    type IntoIter = std::slice::Iter<'a, Entry>;
    fn into_iter(self) -> Self::IntoIter { self.entries.iter() }
}

impl FromIterator<Entry> for Index {
    fn from_iter<I: IntoIterator<Item = Entry>>(iter: I) -> Self {
        Self { entries: iter.into_iter().collect() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parses_plain_line() {
        let e = parse_index_line("seq1\t10\t25\n").unwrap();
        assert_eq!(e, Entry::new("seq1", 10, 25));
    }

    #[test]
    fn tolerates_crlf() {
        let e = parse_index_line("a\t0\t1\r\n").unwrap();
        assert_eq!(e, Entry::new("a", 0, 1));
    }

    #[test]
    fn rejects_wrong_field_count() {
        assert_eq!(
            parse_index_line("a\t0"),
            Err(FormatError::FieldCount { line: 1, found: 2 })
        );
        assert!(matches!(
            parse_index_line("a\t0\t1\textra"),
            Err(FormatError::FieldCount { found: 4, .. })
        ));
    }

    #[test]
    fn rejects_signed_and_garbage_numbers() {
        for bad in ["a\t-1\t5", "a\t+1\t5", "a\t1\tx", "a\t\t5", "a\t1 \t5"] {
            assert!(matches!(parse_index_line(bad), Err(FormatError::BadNumber { .. })), "{bad}");
        }
    }

    #[test]
    fn index_parse_reports_line_number() {
        let err = Index::parse("a\t0\t1\nb\t1\n").unwrap_err();
        assert_eq!(err, FormatError::FieldCount { line: 2, found: 2 });
    }

    #[test]
    fn find_returns_first_match() {
        let idx = Index::new(vec![
            Entry::new("x", 0, 1),
            Entry::new("dup", 1, 2),
            Entry::new("dup", 3, 4),
        ]);
        let (pos, e) = idx.find("dup").unwrap();
        assert_eq!(pos, 1);
        assert_eq!(e.offset, 1);
        assert!(idx.find("missing").is_none());
    }

    #[test]
    fn validate_catches_overrun() {
        let idx = Index::new(vec![Entry::new("a", 0, 5), Entry::new("b", 5, 6)]);
        assert!(idx.validate(11).is_ok());
        match idx.validate(10) {
            Err(FormatError::OutOfBounds { line, name, .. }) => {
                assert_eq!(line, 2);
                assert_eq!(name, "b");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn check_layout_rejects_overlap() {
        let ok = Index::new(vec![Entry::new("a", 0, 5), Entry::new("b", 7, 0)]);
        assert!(ok.check_layout().is_ok());
        let bad = Index::new(vec![Entry::new("a", 0, 5), Entry::new("b", 4, 1)]);
        assert!(matches!(bad.check_layout(), Err(Error::Consistency(_))));
    }

    #[test]
    fn leading_token_strips_markers() {
        assert_eq!(leading_token(b">seq_1 some description\nACGT\0"), "seq_1");
        assert_eq!(leading_token(b"#>name\n"), "name");
        assert_eq!(leading_token(b"\nbody"), "");
        assert_eq!(leading_token(b"whole"), "whole");
    }

    #[test]
    fn sort_by_name_is_stable() {
        let mut idx = Index::new(vec![
            Entry::new("b", 0, 1),
            Entry::new("a", 1, 1),
            Entry::new("b", 2, 1),
        ]);
        idx.sort_by_name();
        let offsets: Vec<u64> = idx.iter().map(|e| e.offset).collect();
        assert_eq!(offsets, vec![1, 0, 2]);
    }

    proptest! {
        #[test]
        fn index_line_round_trip(
            name in "[^\t\n\r]{1,64}",
            offset in any::<u64>(),
            length in any::<u64>(),
        ) {
            let entry = Entry::new(name, offset, length);
            prop_assert_eq!(parse_index_line(&format_index_line(&entry)).unwrap(), entry);
        }
    }
}
