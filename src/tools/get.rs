//! Look up records by name or by position.

use std::collections::HashSet;
use std::io::Write;

use crate::error::{Error, Result};
use crate::format::{Index, RECORD_DELIMITER};
use crate::source::{Record, RecordSource};
use crate::writer::ArchiveWriter;

/// One requested entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Selector {
    /// First entry with this name.
    Name(String),
    /// 0-based position in the index.
    Position(usize),
}

impl std::fmt::Display for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Selector::Name(n)     => write!(f, "{n}"),
            Selector::Position(p) => write!(f, "#{p}"),
        }
    }
}

/// Turn raw requests into selectors.  Duplicate requests are rejected.
pub fn parse_selectors<I, S>(raw: I, by_position: bool) -> Result<Vec<Selector>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for item in raw {
        let item = item.as_ref().trim_end();
        let sel = if by_position {
            let pos = item.parse::<usize>().map_err(|_| {
                Error::Config(format!("integer expected for entry position, got '{item}'"))
            })?;
            Selector::Position(pos)
        } else {
            Selector::Name(item.to_owned())
        };
        if !seen.insert(sel.clone()) {
            return Err(Error::Config(format!("entry '{sel}' requested more than once")));
        }
        out.push(sel);
    }
    if out.is_empty() {
        return Err(Error::Config("no entries requested".into()));
    }
    Ok(out)
}

/// Resolve one selector against `source`.
pub fn lookup<'a>(source: &RecordSource<'a>, selector: &Selector) -> Result<Record<'a>> {
    let position = match selector {
        Selector::Name(name) => source.index().find(name).map(|(p, _)| p),
        Selector::Position(p) => Some(*p).filter(|&p| p < source.len()),
    };
    position
        .and_then(|p| source.get(p))
        .ok_or_else(|| Error::NotFound(selector.to_string()))
}

fn resolve_all<'a>(source: &RecordSource<'a>, selectors: &[Selector]) -> Result<Vec<Record<'a>>> {
    selectors.iter().map(|s| lookup(source, s)).collect()
}

/// Write the requested records to `out`, one after another, without their
/// trailing delimiter.  Nothing is written unless every entry resolves.
pub fn extract_to<W: Write>(source: &RecordSource<'_>, selectors: &[Selector], mut out: W) -> Result<()> {
    for record in resolve_all(source, selectors)? {
        let bytes = record.bytes.strip_suffix(&[RECORD_DELIMITER]).unwrap_or(record.bytes);
        out.write_all(bytes).map_err(|e| Error::io("<output>", e))?;
    }
    out.flush().map_err(|e| Error::io("<output>", e))
}

/// Copy the requested records, verbatim and in request order, into a new
/// archive.
pub fn extract_archive(
    source:    &RecordSource<'_>,
    selectors: &[Selector],
    mut writer: ArchiveWriter,
) -> Result<Index> {
    for record in resolve_all(source, selectors)? {
        writer.append(record.name, record.bytes)?;
    }
    writer.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::Entry;
    use crate::source::DataFile;
    use tempfile::tempdir;

    fn sample() -> (DataFile, Index) {
        (
            DataFile::from_bytes(b"one\0two\0three\0".to_vec()),
            Index::new(vec![
                Entry::new("a", 0, 4),
                Entry::new("b", 4, 4),
                Entry::new("a", 8, 6),
            ]),
        )
    }

    #[test]
    fn name_lookup_returns_first_match() {
        let (data, index) = sample();
        let src = RecordSource::new(&data, &index).unwrap();
        let rec = lookup(&src, &Selector::Name("a".into())).unwrap();
        assert_eq!(rec.position, 0);
        assert_eq!(rec.bytes, b"one\0");
    }

    #[test]
    fn missing_entries_are_not_found() {
        let (data, index) = sample();
        let src = RecordSource::new(&data, &index).unwrap();
        assert!(matches!(lookup(&src, &Selector::Name("zz".into())), Err(Error::NotFound(_))));
        assert!(matches!(lookup(&src, &Selector::Position(3)), Err(Error::NotFound(_))));
    }

    #[test]
    fn stdout_extraction_strips_delimiters() {
        let (data, index) = sample();
        let src = RecordSource::new(&data, &index).unwrap();
        let sels = parse_selectors(["2", "1"], true).unwrap();
        let mut out = Vec::new();
        extract_to(&src, &sels, &mut out).unwrap();
        assert_eq!(out, b"threetwo");
    }

    #[test]
    fn archive_extraction_keeps_request_order() {
        let (data, index) = sample();
        let src = RecordSource::new(&data, &index).unwrap();
        let dir = tempdir().unwrap();
        let w = ArchiveWriter::create(dir.path().join("d"), dir.path().join("i")).unwrap();
        let sels = parse_selectors(["b", "a"], false).unwrap();
        let out = extract_archive(&src, &sels, w).unwrap();
        assert_eq!(out.entries, vec![Entry::new("b", 0, 4), Entry::new("a", 4, 4)]);
        assert_eq!(std::fs::read(dir.path().join("d")).unwrap(), b"two\0one\0");
    }

    #[test]
    fn selector_parsing_rejects_duplicates_and_garbage() {
        assert!(matches!(parse_selectors(["x", "x"], false), Err(Error::Config(_))));
        assert!(matches!(parse_selectors(["1", "one"], true), Err(Error::Config(_))));
        assert!(matches!(parse_selectors(Vec::<String>::new(), false), Err(Error::Config(_))));
    }
}
