//! Archive tree layout.
//!
//! Content lives in capacity-limited subdirectories of the archive root,
//! named by hierarchical ids such as `00` or `03/12`. Each content file is
//! named by its checksum (`.z` appended when compressed) and each run leaves
//! one `<run_name>.lst` index log in the subdirectory it was assigned.

mod allocator;

pub use allocator::{ArchiveDirsToUse, DirSequence, FILES_PER_DIR, ReturnableDir, dir_id};

use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use regex::Regex;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;
use walkdir::WalkDir;

pub const LOG_SUFFIX: &str = ".lst";
pub const PARTIAL_SUFFIX: &str = ".part";

static CONTENT_NAME: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^([0-9a-f]{64})(\.z)?$").unwrap());

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivedContent {
    pub checksum: String,
    pub archive_dir: String,
    pub is_compressed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivedLog {
    pub run_name: String,
    pub archive_dir: String,
    pub path: PathBuf,
}

/// Everything found under an archive root.
#[derive(Debug, Default)]
pub struct ArchiveTree {
    pub content: Vec<ArchivedContent>,
    pub logs: Vec<ArchivedLog>,
    /// Index logs left behind by runs that never finished.
    pub partial_logs: Vec<ArchivedLog>,
}

impl ArchiveTree {
    /// Slots taken per archive subdirectory: one per content file and one per
    /// index log, finished or not.
    pub fn usage(&self) -> HashMap<String, u32> {
        let mut usage = HashMap::new();
        let logs = self.logs.iter().chain(&self.partial_logs);
        let dirs = self.content.iter().map(|c| &c.archive_dir).chain(logs.map(|l| &l.archive_dir));
        for dir in dirs {
            *usage.entry(dir.clone()).or_default() += 1;
        }
        usage
    }
}

/// The archive subdirectory id of a directory relative to the archive root,
/// or `None` for the root itself.
fn relative_dir_id(relative: &Path) -> Option<String> {
    let parts = relative
        .components()
        .map(|c| match c {
            Component::Normal(part) => part.to_str(),
            _ => None,
        })
        .collect::<Option<Vec<_>>>()?;
    (!parts.is_empty()).then(|| parts.join("/"))
}

/// Walk the archive root and sort what's there into content and logs.
///
/// Files directly under the root (the database, run content lists) don't
/// belong to any subdirectory and are skipped, as is anything whose name
/// isn't valid UTF-8. A missing root is an empty archive.
pub fn scan_tree(root: &Path) -> Result<ArchiveTree> {
    let mut tree = ArchiveTree::default();
    if !root.exists() {
        return Ok(tree);
    }
    for entry in WalkDir::new(root).min_depth(2).sort_by_file_name() {
        let entry = entry.or_raise(|| ErrorKind::Io)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str() else {
            continue;
        };
        let Some(archive_dir) = entry
            .path()
            .parent()
            .and_then(|parent| parent.strip_prefix(root).ok())
            .and_then(relative_dir_id)
        else {
            continue;
        };
        if let Some(log_name) = name.strip_suffix(PARTIAL_SUFFIX) {
            tree.partial_logs.push(ArchivedLog {
                run_name: log_name.strip_suffix(LOG_SUFFIX).unwrap_or(log_name).to_string(),
                archive_dir,
                path: entry.path().to_path_buf(),
            });
        } else if let Some(run_name) = name.strip_suffix(LOG_SUFFIX) {
            tree.logs.push(ArchivedLog {
                run_name: run_name.to_string(),
                archive_dir,
                path: entry.path().to_path_buf(),
            });
        } else if let Some(captures) = CONTENT_NAME.captures(name) {
            tree.content.push(ArchivedContent {
                checksum: captures[1].to_string(),
                archive_dir,
                is_compressed: captures.get(2).is_some(),
            });
        }
    }
    tracing::debug!(
        root = %root.display(),
        content = tree.content.len(),
        logs = tree.logs.len(),
        partial = tree.partial_logs.len(),
        "Scanned archive tree"
    );
    Ok(tree)
}
