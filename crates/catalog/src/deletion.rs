//! Deletion detection for one run.

use crate::db::Database;
use crate::error::Result;
use crate::index::IndexFile;
use crate::models::{FileEntry, unix_now};
use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

/// Starts out with every path the database believes exists; each path the
/// run comes across is crossed off. Whatever is left at the end is gone.
///
/// [`complete`](Self::complete) must only be called once every existing
/// source path has been passed to [`seen`](Self::seen), otherwise files that
/// still exist get marked as deleted.
pub struct DeletionTracker {
    db: Database,
    all_files: Mutex<HashSet<String>>,
}

impl DeletionTracker {
    pub async fn new(db: &Database) -> Result<Self> {
        let all_files = db.get_undeleted_files().await?;
        tracing::debug!(known = all_files.len(), "Tracking deletions");
        Ok(Self {
            db: db.clone(),
            all_files: Mutex::new(all_files),
        })
    }

    /// `path` exists. Clears any earlier deletion record for it.
    pub async fn seen(&self, path: &str) -> Result<()> {
        self.all_files.lock().unwrap_or_else(PoisonError::into_inner).remove(path);
        self.db.unmark_deleted(path).await
    }

    /// Paths not seen so far.
    pub fn remaining(&self) -> usize {
        self.all_files.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Write a deletion line for every path not seen and mark them all
    /// deleted. Returns how many there were.
    pub async fn complete(self, index: &IndexFile) -> Result<usize> {
        let now = unix_now();
        let all_files = self.all_files.into_inner().unwrap_or_else(PoisonError::into_inner);
        let mut gone: Vec<String> = all_files.into_iter().collect();
        gone.sort_unstable();
        for path in &gone {
            index.add(&FileEntry::deleted(path.as_str(), now))?;
        }
        self.db.mark_deleted(now, &gone).await?;
        tracing::info!(deleted = gone.len(), "Recorded deletions");
        Ok(gone.len())
    }
}
