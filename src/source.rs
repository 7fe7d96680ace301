//! Read-only access to a data file through its index.
//!
//! [`RecordSource`] pairs a [`DataFile`] with an [`Index`] and hands out
//! borrowed [`Record`]s in index order.  Because both inputs are immutable
//! the sequence can be walked any number of times, and the same source can
//! be shared by every worker thread without locking.

use std::fs::File;
use std::ops::Deref;
use std::path::Path;

use memmap2::Mmap;

use crate::error::{IoContext, Result};
use crate::format::{Entry, FormatError, Index};

// ── DataFile ─────────────────────────────────────────────────────────────────

/// Immutable bytes of a data file.
pub struct DataFile {
    bytes: DataBytes,
}

enum DataBytes {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

impl DataFile {
    /// Map `path` read-only.  Empty files are not mapped.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).at(path)?;
        let len = file.metadata().at(path)?.len();
        if len == 0 {
            return Ok(Self::from_bytes(Vec::new()));
        }
        // SAFETY: the map is read-only and archives are never modified in
        // place; a concurrent external truncation is outside our contract.
        let map = unsafe { Mmap::map(&file) }.at(path)?;
        Ok(Self { bytes: DataBytes::Mapped(map) })
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes: DataBytes::Owned(bytes) }
    }

    pub fn len(&self) -> u64 { self.as_slice().len() as u64 }

    pub fn is_empty(&self) -> bool { self.as_slice().is_empty() }

    pub fn as_slice(&self) -> &[u8] {
        match &self.bytes {
            DataBytes::Mapped(m) => &m[..],
            DataBytes::Owned(v)  => v.as_slice(),
        }
    }
}

impl Deref for DataFile {
    type Target = [u8];
    fn deref(&self) -> &[u8] { self.as_slice() }
}

// ── Record ───────────────────────────────────────────────────────────────────

/// One record viewed through its entry.
#[derive(Debug, Clone, Copy)]
pub struct Record<'a> {
    /// 0-based position of the entry in the index.
    pub position: usize,
    pub name:     &'a str,
    pub bytes:    &'a [u8],
}

// ── RecordSource ─────────────────────────────────────────────────────────────

#[derive(Clone, Copy)]
pub struct RecordSource<'a> {
    data:  &'a [u8],
    index: &'a Index,
}

impl<'a> RecordSource<'a> {
    /// Pair `data` with `index`, checking every entry range up front so
    /// iteration itself cannot fail.
    ///
    /// The error names the offending index line; callers know which file
    /// it came from and wrap it with [`Error::format`](crate::Error::format).
    pub fn new(data: &'a DataFile, index: &'a Index) -> std::result::Result<Self, FormatError> {
        Self::from_slice(data.as_slice(), index)
    }

    pub fn from_slice(data: &'a [u8], index: &'a Index) -> std::result::Result<Self, FormatError> {
        index.validate(data.len() as u64)?;
        Ok(Self { data, index })
    }

    pub fn len(&self) -> usize { self.index.len() }

    pub fn is_empty(&self) -> bool { self.index.is_empty() }

    pub fn index(&self) -> &'a Index { self.index }

    pub fn get(&self, position: usize) -> Option<Record<'a>> {
        self.index.get(position).map(|e| self.view(position, e))
    }

    /// A fresh pass over every record in index order.
    pub fn records(&self) -> Records<'a> {
        Records { source: *self, next: 0 }
    }

    fn view(&self, position: usize, entry: &'a Entry) -> Record<'a> {
        // Ranges were validated in `from_slice`.
        let start = entry.offset as usize;
        let end = start + entry.length as usize;
        Record { position, name: &entry.name, bytes: &self.data[start..end] }
    }
}

/// Iterator returned by [`RecordSource::records`].
pub struct Records<'a> {
    source: RecordSource<'a>,
    next:   usize,
}

impl<'a> Iterator for Records<'a> {
    type Item = Record<'a>;

    fn next(&mut self) -> Option<Record<'a>> {
        let rec = self.source.get(self.next)?;
        self.next += 1;
        Some(rec)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.source.len().saturating_sub(self.next);
        (left, Some(left))
    }
}

impl ExactSizeIterator for Records<'_> {}
