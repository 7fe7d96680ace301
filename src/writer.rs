//! Staged writing of a data + index pair.
//!
//! Both files are written under hidden staging names next to their targets
//! (`.<file>.<uuid>.tmp`).  [`ArchiveWriter::finish`] flushes and syncs both,
//! then renames the data file and the index file into place.  Until then the
//! target names are untouched, and a writer dropped before `finish` (error,
//! panic, cancellation) removes its staging files.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, IoContext, Result};
use crate::format::{is_encodable_name, Entry, FormatError, Index};

/// A target path and the hidden file it is staged in.
struct Staged {
    target: PathBuf,
    tmp:    PathBuf,
}

impl Staged {
    fn new(target: &Path) -> Result<Self> {
        let file_name = target.file_name().ok_or_else(|| {
            Error::Config(format!("output path {} does not name a file", target.display()))
        })?;
        let tmp = target.with_file_name(format!(
            ".{}.{}.tmp",
            file_name.to_string_lossy(),
            Uuid::new_v4().simple()
        ));
        Ok(Self { target: target.to_owned(), tmp })
    }

    fn commit(&self) -> Result<()> {
        fs::rename(&self.tmp, &self.target).at(&self.target)
    }

    fn discard(&self) {
        let _ = fs::remove_file(&self.tmp);
    }

    /// Move an existing target out of the way so a failed commit further
    /// down can put it back.
    fn set_aside(&self) -> Result<Option<PathBuf>> {
        if fs::symlink_metadata(&self.target).is_err() {
            return Ok(None);
        }
        let backup = self.tmp.with_extension("bak");
        fs::rename(&self.target, &backup).at(&self.target)?;
        Ok(Some(backup))
    }

    /// Undo [`commit`](Self::commit): restore the set-aside target, or
    /// remove the new one when there was nothing before.
    fn roll_back(&self, backup: Option<&Path>) {
        let _ = match backup {
            Some(b) => fs::rename(b, &self.target),
            None    => fs::remove_file(&self.target),
        };
    }
}

/// Refuse to stage over any of `protected`.
fn guard_target(target: &Path, protected: &[&Path]) -> Result<()> {
    // A target that does not exist yet cannot be one of the inputs.
    let Ok(resolved) = fs::canonicalize(target) else { return Ok(()) };
    for input in protected {
        if fs::canonicalize(input).ok().as_deref() == Some(resolved.as_path()) {
            return Err(Error::Config(format!(
                "output {} would overwrite input {}",
                target.display(),
                input.display()
            )));
        }
    }
    Ok(())
}

// ── ArchiveWriter ────────────────────────────────────────────────────────────

pub struct ArchiveWriter {
    data:     Staged,
    index:    Staged,
    data_out: BufWriter<File>,
    entries:  Vec<Entry>,
    offset:   u64,
    finished: bool,
}

impl ArchiveWriter {
    pub fn create<P: AsRef<Path>, Q: AsRef<Path>>(data_path: P, index_path: Q) -> Result<Self> {
        Self::create_protected(data_path, index_path, &[])
    }

    /// Like [`create`](Self::create), but fail if either target resolves to
    /// one of `protected` (the inputs of the run).
    pub fn create_protected<P: AsRef<Path>, Q: AsRef<Path>>(
        data_path:  P,
        index_path: Q,
        protected:  &[&Path],
    ) -> Result<Self> {
        let (data_path, index_path) = (data_path.as_ref(), index_path.as_ref());
        if data_path == index_path {
            return Err(Error::Config(format!(
                "data and index outputs are the same path: {}", data_path.display())));
        }
        guard_target(data_path, protected)?;
        guard_target(index_path, protected)?;

        let data = Staged::new(data_path)?;
        let index = Staged::new(index_path)?;
        let file = File::create(&data.tmp).at(&data.tmp)?;
        debug!(staging = %data.tmp.display(), "archive writer opened");
        Ok(Self {
            data,
            index,
            data_out: BufWriter::new(file),
            entries:  Vec::new(),
            offset:   0,
            finished: false,
        })
    }

    /// Append one record; its entry starts at the running byte count.
    pub fn append(&mut self, name: &str, bytes: &[u8]) -> Result<&Entry> {
        if !is_encodable_name(name) {
            return Err(Error::format(&self.index.target, FormatError::UnencodableName(name.to_owned())));
        }
        self.data_out.write_all(bytes).at(&self.data.tmp)?;
        let entry = Entry::new(name, self.offset, bytes.len() as u64);
        self.offset += entry.length;
        self.entries.push(entry);
        Ok(&self.entries[self.entries.len() - 1])
    }

    pub fn len(&self) -> usize { self.entries.len() }

    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    /// Bytes appended so far.
    pub fn bytes_written(&self) -> u64 { self.offset }

    /// Write the index, sync both files and move them into place.
    pub fn finish(mut self) -> Result<Index> {
        let index = Index::new(std::mem::take(&mut self.entries));
        index.check_layout()?;
        let end = index.entries.last().and_then(Entry::end).unwrap_or(0);
        if end != self.offset {
            return Err(Error::Consistency(format!(
                "index ends at byte {end} but {} bytes were written", self.offset)));
        }

        self.data_out.flush().at(&self.data.tmp)?;
        self.data_out.get_ref().sync_all().at(&self.data.tmp)?;
        write_synced(&self.index.tmp, &index)?;

        // The data file goes first; if the index cannot follow, the old
        // data file (or its absence) is restored.
        let backup = self.data.set_aside()?;
        if let Err(e) = self.data.commit() {
            self.data.roll_back(backup.as_deref());
            return Err(e);
        }
        if let Err(e) = self.index.commit() {
            warn!(data = %self.data.target.display(), error = %e, "index rename failed; restoring data file");
            self.data.roll_back(backup.as_deref());
            return Err(e);
        }
        if let Some(b) = backup {
            let _ = fs::remove_file(b);
        }
        self.finished = true;
        debug!(
            data = %self.data.target.display(),
            index = %self.index.target.display(),
            records = index.len(),
            bytes = self.offset,
            "archive written"
        );
        Ok(index)
    }
}

impl Drop for ArchiveWriter {
    fn drop(&mut self) {
        if !self.finished {
            self.data.discard();
            self.index.discard();
        }
    }
}

fn write_synced(path: &Path, index: &Index) -> Result<()> {
    let file = File::create(path).at(path)?;
    let mut out = BufWriter::new(file);
    index.write(&mut out).at(path)?;
    out.flush().at(path)?;
    out.get_ref().sync_all().at(path)
}

/// Write `index` alone to `path` through a staging file, refusing to
/// replace any of `protected`.
pub fn write_index_atomic<P: AsRef<Path>>(path: P, index: &Index, protected: &[&Path]) -> Result<()> {
    let path = path.as_ref();
    guard_target(path, protected)?;
    for (i, e) in index.iter().enumerate() {
        if !is_encodable_name(&e.name) {
            return Err(Error::Consistency(format!("entry {i} has unencodable name {:?}", e.name)));
        }
    }
    let staged = Staged::new(path)?;
    if let Err(e) = write_synced(&staged.tmp, index).and_then(|()| staged.commit()) {
        staged.discard();
        return Err(e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn offsets_are_running_byte_counts() {
        let dir = tempdir().unwrap();
        let (d, i) = (dir.path().join("out.ffdata"), dir.path().join("out.ffindex"));
        let mut w = ArchiveWriter::create(&d, &i).unwrap();
        w.append("a", b"HELLO").unwrap();
        w.append("empty", b"").unwrap();
        w.append("b", b"ABCD").unwrap();
        let index = w.finish().unwrap();

        assert_eq!(index.entries, vec![
            Entry::new("a", 0, 5),
            Entry::new("empty", 5, 0),
            Entry::new("b", 5, 4),
        ]);
        assert_eq!(fs::read(&d).unwrap(), b"HELLOABCD");
        assert_eq!(fs::read_to_string(&i).unwrap(), "a\t0\t5\nempty\t5\t0\nb\t5\t4\n");
    }

    #[test]
    fn nothing_visible_until_finish() {
        let dir = tempdir().unwrap();
        let (d, i) = (dir.path().join("x.ffdata"), dir.path().join("x.ffindex"));
        {
            let mut w = ArchiveWriter::create(&d, &i).unwrap();
            w.append("a", b"data").unwrap();
            assert!(!d.exists());
            assert!(!i.exists());
        }
        // Dropped without finish: no targets and no staging leftovers.
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn empty_archive_writes_empty_files() {
        let dir = tempdir().unwrap();
        let (d, i) = (dir.path().join("e.ffdata"), dir.path().join("e.ffindex"));
        let index = ArchiveWriter::create(&d, &i).unwrap().finish().unwrap();
        assert!(index.is_empty());
        assert_eq!(fs::metadata(&d).unwrap().len(), 0);
        assert_eq!(fs::metadata(&i).unwrap().len(), 0);
    }

    #[test]
    fn refuses_to_overwrite_inputs() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("in.ffdata");
        fs::write(&input, b"x").unwrap();
        let res = ArchiveWriter::create_protected(&input, dir.path().join("o.ffindex"), &[input.as_path()]);
        assert!(matches!(res, Err(Error::Config(_))));
        assert_eq!(fs::read(&input).unwrap(), b"x");
    }

    #[test]
    fn rejects_names_that_break_the_index() {
        let dir = tempdir().unwrap();
        let mut w = ArchiveWriter::create(dir.path().join("d"), dir.path().join("i")).unwrap();
        assert!(matches!(w.append("bad\tname", b""), Err(Error::Format { .. })));
    }

    #[test]
    fn failed_index_rename_restores_previous_data() {
        let dir = tempdir().unwrap();
        let (d, i) = (dir.path().join("p.ffdata"), dir.path().join("p.ffindex"));
        fs::write(&d, b"old").unwrap();
        // A non-empty directory where the index should go cannot be renamed over.
        fs::create_dir(&i).unwrap();
        fs::write(i.join("keep"), b"").unwrap();

        let mut w = ArchiveWriter::create(&d, &i).unwrap();
        w.append("a", b"new data").unwrap();
        assert!(matches!(w.finish(), Err(Error::Io { .. })));

        assert_eq!(fs::read(&d).unwrap(), b"old");
        let mut left: Vec<String> = fs::read_dir(dir.path()).unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        left.sort();
        assert_eq!(left, vec!["p.ffdata", "p.ffindex"]);
    }

    #[test]
    fn failed_index_rename_removes_fresh_data() {
        let dir = tempdir().unwrap();
        let (d, i) = (dir.path().join("q.ffdata"), dir.path().join("q.ffindex"));
        fs::create_dir(&i).unwrap();
        fs::write(i.join("keep"), b"").unwrap();

        let mut w = ArchiveWriter::create(&d, &i).unwrap();
        w.append("a", b"x").unwrap();
        assert!(w.finish().is_err());
        assert!(!d.exists());
    }

    #[test]
    fn finish_replaces_existing_pair() {
        let dir = tempdir().unwrap();
        let (d, i) = (dir.path().join("r.ffdata"), dir.path().join("r.ffindex"));
        fs::write(&d, b"old").unwrap();
        fs::write(&i, "old\t0\t3\n").unwrap();
        let mut w = ArchiveWriter::create(&d, &i).unwrap();
        w.append("new", b"fresh").unwrap();
        w.finish().unwrap();
        assert_eq!(fs::read(&d).unwrap(), b"fresh");
        assert_eq!(fs::read_to_string(&i).unwrap(), "new\t0\t5\n");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 2);
    }

    #[test]
    fn index_only_write_replaces_atomically() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("renamed.ffindex");
        fs::write(&path, "old\t0\t1\n").unwrap();
        let index = Index::new(vec![Entry::new("new", 0, 1)]);
        write_index_atomic(&path, &index, &[]).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "new\t0\t1\n");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
