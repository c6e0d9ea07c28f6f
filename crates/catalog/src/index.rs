//! Per-run index logs.
//!
//! A run writes one line per action to `<archive_dir>/<run_name>.lst.part`
//! and only renames it to `<run_name>.lst` once the run has finished, so a
//! `.lst` file is always complete. Anything still ending in `.part` belongs to
//! a run that is in progress or crashed.

use crate::archive::{LOG_SUFFIX, PARTIAL_SUFFIX, scan_tree};
use crate::error::{ErrorKind, Result};
use crate::models::FileEntry;
use crate::stream::{BoxSyncWrite, StreamOpener};
use exn::{OptionExt, ResultExt};
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use stowage_config::{Config, Password};
use tracing::instrument;

/// An index log being written. Dropping it without calling
/// [`commit`](Self::commit) discards everything written so far.
pub struct IndexFile {
    run_name: String,
    archive_dir: String,
    path: PathBuf,
    partial: PathBuf,
    writer: Mutex<Option<BufWriter<BoxSyncWrite>>>,
}

impl IndexFile {
    pub fn create(run_name: &str, cfg: &Config, archive_dir: &str, opener: &dyn StreamOpener) -> Result<Self> {
        let dir = cfg.archive_root_path.join(archive_dir);
        std::fs::create_dir_all(&dir).or_raise(|| ErrorKind::Io)?;
        let path = dir.join(format!("{run_name}{LOG_SUFFIX}"));
        let mut partial = path.clone().into_os_string();
        partial.push(PARTIAL_SUFFIX);
        let partial = PathBuf::from(partial);
        let writer = opener.create(&partial, &cfg.password).or_raise(|| ErrorKind::Io)?;
        tracing::debug!(log = %partial.display(), "Opened index log");
        Ok(Self {
            run_name: run_name.to_string(),
            archive_dir: archive_dir.to_string(),
            path,
            partial,
            writer: Mutex::new(Some(BufWriter::new(writer))),
        })
    }

    pub fn run_name(&self) -> &str {
        &self.run_name
    }

    pub fn archive_dir(&self) -> &str {
        &self.archive_dir
    }

    /// Where the log ends up once committed.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one `checksum timestamp path` line. Safe to call from several
    /// threads; lines never interleave.
    pub fn add_entry(&self, checksum: &str, timestamp: f64, path: &str) -> Result<()> {
        self.add(&FileEntry::new(checksum, timestamp, path))
    }

    pub fn add(&self, entry: &FileEntry) -> Result<()> {
        if entry.path.contains('\n') {
            exn::bail!(ErrorKind::InvalidData("path contains a newline"));
        }
        if entry.checksum.contains(char::is_whitespace) {
            exn::bail!(ErrorKind::InvalidData("checksum contains whitespace"));
        }
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let writer = writer.as_mut().ok_or_raise(|| ErrorKind::InvalidData("index log is closed"))?;
        writeln!(writer, "{entry}").or_raise(|| ErrorKind::Io)
    }

    /// Flush the log, sync it to disk and move it into place. A log that is
    /// already committed under the same name is never replaced.
    ///
    /// On failure the partial file is removed and the run has to be treated
    /// as failed.
    #[instrument(skip(self), fields(log = %self.path.display()))]
    pub fn commit(mut self) -> Result<PathBuf> {
        let writer = self.writer.get_mut().unwrap_or_else(PoisonError::into_inner).take();
        let finished = match writer {
            Some(writer) => close(writer),
            None => Ok(()),
        }
        .and_then(|()| persist(&self.partial, &self.path));
        if let Err(err) = finished {
            discard(&self.partial);
            return Err(err).or_raise(|| ErrorKind::LogFinalization(self.path.clone()));
        }
        tracing::info!(run = %self.run_name, "Index log committed");
        Ok(self.path.clone())
    }
}

impl Drop for IndexFile {
    fn drop(&mut self) {
        let writer = self.writer.get_mut().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(writer) = writer {
            // Skip flushing what's buffered; the file is going away anyway.
            drop(writer.into_parts());
            tracing::warn!(log = %self.partial.display(), "Discarding unfinished index log");
            discard(&self.partial);
        }
    }
}

fn close(writer: BufWriter<BoxSyncWrite>) -> io::Result<()> {
    let mut inner = writer.into_inner().map_err(|e| e.into_error())?;
    inner.flush()
}

/// Rename `partial` to `path` once its contents are on disk, then sync the
/// directory so the rename survives a crash too.
fn persist(partial: &Path, path: &Path) -> io::Result<()> {
    File::open(partial)?.sync_all()?;
    if path.exists() {
        return Err(io::Error::new(io::ErrorKind::AlreadyExists, "index log already committed"));
    }
    std::fs::rename(partial, path)?;
    sync_dir(path)
}

#[cfg(unix)]
fn sync_dir(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(dir) => File::open(dir)?.sync_all(),
        None => Ok(()),
    }
}

#[cfg(not(unix))]
fn sync_dir(_path: &Path) -> io::Result<()> {
    Ok(())
}

fn discard(path: &Path) {
    if let Err(e) = std::fs::remove_file(path)
        && e.kind() != io::ErrorKind::NotFound
    {
        tracing::warn!(log = %path.display(), error = %e, "Could not remove partial index log");
    }
}

/// Read back every entry of a committed index log.
pub fn read_index_file(path: &Path, password: &Password, opener: &dyn StreamOpener) -> Result<Vec<FileEntry>> {
    let reader = BufReader::new(opener.open(path, password).or_raise(|| ErrorKind::Io)?);
    let mut entries = Vec::new();
    for line in reader.lines() {
        let line = line.or_raise(|| ErrorKind::Io)?;
        if line.is_empty() {
            continue;
        }
        entries.push(line.parse::<FileEntry>()?);
    }
    Ok(entries)
}

/// Delete index logs left behind by runs that never finished. Returns how
/// many were removed.
pub fn remove_partial_logs(archive_root: &Path) -> Result<usize> {
    let tree = scan_tree(archive_root)?;
    for partial in &tree.partial_logs {
        tracing::warn!(log = %partial.path.display(), run = %partial.run_name, "Removing partial index log");
        std::fs::remove_file(&partial.path).or_raise(|| ErrorKind::Io)?;
    }
    Ok(tree.partial_logs.len())
}
