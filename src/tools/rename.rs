//! Rename entries after the leading token of their record.

use std::collections::HashSet;

use crate::format::{leading_token, Entry, FormatError, Index};
use crate::source::RecordSource;

/// A copy of the source index where every entry is named by the first
/// whitespace-delimited token of its record (leading `#`/`>` removed).
/// Offsets and lengths are unchanged.  Empty or repeated names are errors.
pub fn rename_from_content(source: &RecordSource<'_>) -> Result<Index, FormatError> {
    let mut seen = HashSet::with_capacity(source.len());
    source
        .records()
        .zip(source.index().iter())
        .map(|(record, entry)| {
            let name = leading_token(record.bytes);
            if name.is_empty() {
                return Err(FormatError::EmptyRecordName { position: record.position });
            }
            if !seen.insert(name.clone()) {
                return Err(FormatError::DuplicateName { position: record.position, name });
            }
            Ok(Entry::new(name, entry.offset, entry.length))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::DataFile;

    #[test]
    fn renames_from_first_token() {
        let data = DataFile::from_bytes(b">alpha desc\nAC\0>beta\nG\0".to_vec());
        let index = Index::new(vec![Entry::new("0", 0, 15), Entry::new("1", 15, 8)]);
        let src = RecordSource::new(&data, &index).unwrap();
        let renamed = rename_from_content(&src).unwrap();
        assert_eq!(renamed.entries, vec![Entry::new("alpha", 0, 15), Entry::new("beta", 15, 8)]);
    }

    #[test]
    fn duplicate_tokens_are_rejected() {
        let data = DataFile::from_bytes(b">x\0>x\0".to_vec());
        let index = Index::new(vec![Entry::new("0", 0, 3), Entry::new("1", 3, 3)]);
        let src = RecordSource::new(&data, &index).unwrap();
        assert_eq!(
            rename_from_content(&src),
            Err(FormatError::DuplicateName { position: 1, name: "x".into() })
        );
    }

    #[test]
    fn empty_token_is_rejected() {
        let data = DataFile::from_bytes(b" x\0".to_vec());
        let index = Index::new(vec![Entry::new("0", 0, 3)]);
        let src = RecordSource::new(&data, &index).unwrap();
        assert_eq!(rename_from_content(&src), Err(FormatError::EmptyRecordName { position: 0 }));
    }
}
