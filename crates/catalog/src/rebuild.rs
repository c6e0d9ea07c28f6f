//! Rebuilding the index database from the archive.
//!
//! The archive is the source of truth: committed index logs say which runs
//! happened and what each one recorded, and the content files say where each
//! checksum lives. Rebuilding brings the `run`, `content` and `location`
//! tables in line with that, touching only rows that differ, and recomputes
//! `deletion` from scratch.

use crate::archive::{ArchiveTree, scan_tree};
use crate::db::Database;
use crate::error::{ErrorKind, Result};
use crate::index::read_index_file;
use crate::stream::StreamOpener;
use exn::ResultExt;
use sqlx::SqliteConnection;
use std::collections::{BTreeMap, HashMap, HashSet};
use stowage_config::{Config, Password};
use tracing::instrument;

/// Rows changed by [`Database::rebuild`], over the `run`, `content` and
/// `location` tables.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RebuildCounts {
    pub updated: u64,
    pub inserted: u64,
    pub deleted: u64,
}

/// What the tables should contain according to the archive.
#[derive(Debug, Default)]
struct Expected {
    runs: BTreeMap<String, String>,
    content: BTreeMap<(String, String), (f64, String)>,
    locations: BTreeMap<String, (String, bool)>,
    deletions: BTreeMap<String, f64>,
}

impl Expected {
    fn from_archive(tree: &ArchiveTree, password: &Password, opener: &dyn StreamOpener) -> Result<Self> {
        let mut expected = Self::default();
        for item in &tree.content {
            expected
                .locations
                .insert(item.checksum.clone(), (item.archive_dir.clone(), item.is_compressed));
        }

        let mut logs: Vec<_> = tree.logs.iter().collect();
        logs.sort_by(|a, b| a.run_name.cmp(&b.run_name));
        // Older logs repeat every unchanged file; only a change makes a row.
        let mut latest: HashMap<String, (f64, String)> = HashMap::new();
        for log in logs {
            let entries = read_index_file(&log.path, password, opener)?;
            tracing::debug!(run = %log.run_name, entries = entries.len(), "Read index log");
            expected.runs.insert(log.run_name.clone(), log.archive_dir.clone());
            for entry in entries {
                if entry.is_deletion() {
                    expected.deletions.entry(entry.path).or_insert(entry.timestamp);
                    continue;
                }
                expected.deletions.remove(&entry.path);
                if entry.is_error() {
                    continue;
                }
                let state = (entry.timestamp, entry.checksum);
                if latest.get(&entry.path) == Some(&state) {
                    continue;
                }
                latest.insert(entry.path.clone(), state.clone());
                expected.content.insert((log.run_name.clone(), entry.path), state);
            }
        }
        Ok(expected)
    }
}

impl Database {
    /// Make the database agree with the archive under `cfg.archive_root_path`.
    ///
    /// File metadata is left alone; it describes source files, not the
    /// archive.
    #[instrument(skip_all, fields(archive_root = %cfg.archive_root_path.display()))]
    pub async fn rebuild(&self, cfg: &Config, opener: &dyn StreamOpener) -> Result<RebuildCounts> {
        let root = cfg.archive_root_path.clone();
        let tree = tokio::task::spawn_blocking(move || scan_tree(&root))
            .await
            .or_raise(|| ErrorKind::Io)??;
        let expected = Expected::from_archive(&tree, &cfg.password, opener)?;

        let mut counts = RebuildCounts::default();
        let mut tx = self.pool().begin().await?;
        sync_runs(&mut tx, &expected.runs, &mut counts).await?;
        sync_content(&mut tx, &expected.content, &mut counts).await?;
        sync_locations(&mut tx, &expected.locations, &mut counts).await?;
        replace_deletions(&mut tx, &expected.deletions).await?;
        tx.commit().await.or_raise(|| ErrorKind::Database)?;

        tracing::info!(
            updated = counts.updated,
            inserted = counts.inserted,
            deleted = counts.deleted,
            deletions = expected.deletions.len(),
            "Index database rebuilt"
        );
        Ok(counts)
    }
}

async fn sync_runs(
    conn: &mut SqliteConnection,
    expected: &BTreeMap<String, String>,
    counts: &mut RebuildCounts,
) -> Result<()> {
    let existing: Vec<(String, Option<String>)> = sqlx::query_as("SELECT run_name, archive_dir FROM run")
        .fetch_all(&mut *conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
    let mut present = HashSet::new();
    for (run_name, archive_dir) in existing {
        match expected.get(&run_name) {
            Some(dir) if archive_dir.as_ref() == Some(dir) => {},
            Some(dir) => {
                sqlx::query("UPDATE run SET archive_dir = ? WHERE run_name = ?")
                    .bind(dir.as_str())
                    .bind(run_name.as_str())
                    .execute(&mut *conn)
                    .await
                    .or_raise(|| ErrorKind::Database)?;
                counts.updated += 1;
            },
            None => {
                sqlx::query("DELETE FROM run WHERE run_name = ?")
                    .bind(run_name.as_str())
                    .execute(&mut *conn)
                    .await
                    .or_raise(|| ErrorKind::Database)?;
                counts.deleted += 1;
            },
        }
        present.insert(run_name);
    }
    for (run_name, dir) in expected.iter().filter(|(name, _)| !present.contains(*name)) {
        sqlx::query("INSERT INTO run (run_name, archive_dir) VALUES (?, ?)")
            .bind(run_name.as_str())
            .bind(dir.as_str())
            .execute(&mut *conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        counts.inserted += 1;
    }
    Ok(())
}

async fn sync_content(
    conn: &mut SqliteConnection,
    expected: &BTreeMap<(String, String), (f64, String)>,
    counts: &mut RebuildCounts,
) -> Result<()> {
    let existing: Vec<(i64, String, String, f64, String)> =
        sqlx::query_as("SELECT rowid, run_name, path, timestamp, checksum FROM content")
            .fetch_all(&mut *conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
    // A key matches at most one row; duplicates go.
    let mut matched = HashSet::new();
    for (rowid, run_name, path, timestamp, checksum) in existing {
        let key = (run_name, path);
        let wanted = expected.get(&key).filter(|_| !matched.contains(&key));
        match wanted {
            Some((want_ts, want_sum)) => {
                if (*want_ts, want_sum.as_str()) != (timestamp, checksum.as_str()) {
                    sqlx::query("UPDATE content SET timestamp = ?, checksum = ? WHERE rowid = ?")
                        .bind(*want_ts)
                        .bind(want_sum.as_str())
                        .bind(rowid)
                        .execute(&mut *conn)
                        .await
                        .or_raise(|| ErrorKind::Database)?;
                    counts.updated += 1;
                }
                matched.insert(key);
            },
            None => {
                sqlx::query("DELETE FROM content WHERE rowid = ?")
                    .bind(rowid)
                    .execute(&mut *conn)
                    .await
                    .or_raise(|| ErrorKind::Database)?;
                counts.deleted += 1;
            },
        }
    }
    for ((run_name, path), (timestamp, checksum)) in expected.iter().filter(|(key, _)| !matched.contains(*key)) {
        sqlx::query("INSERT INTO content (run_name, path, timestamp, checksum) VALUES (?, ?, ?, ?)")
            .bind(run_name.as_str())
            .bind(path.as_str())
            .bind(*timestamp)
            .bind(checksum.as_str())
            .execute(&mut *conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        counts.inserted += 1;
    }
    Ok(())
}

async fn sync_locations(
    conn: &mut SqliteConnection,
    expected: &BTreeMap<String, (String, bool)>,
    counts: &mut RebuildCounts,
) -> Result<()> {
    let existing: Vec<(String, Option<String>, bool)> =
        sqlx::query_as("SELECT checksum, archive_dir, is_compressed FROM location")
            .fetch_all(&mut *conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
    let mut present = HashSet::new();
    for (checksum, archive_dir, is_compressed) in existing {
        match expected.get(&checksum) {
            Some((dir, compressed)) if archive_dir.as_ref() == Some(dir) && is_compressed == *compressed => {},
            Some((dir, compressed)) => {
                sqlx::query("UPDATE location SET archive_dir = ?, is_compressed = ? WHERE checksum = ?")
                    .bind(dir.as_str())
                    .bind(*compressed)
                    .bind(checksum.as_str())
                    .execute(&mut *conn)
                    .await
                    .or_raise(|| ErrorKind::Database)?;
                counts.updated += 1;
            },
            None => {
                sqlx::query("DELETE FROM location WHERE checksum = ?")
                    .bind(checksum.as_str())
                    .execute(&mut *conn)
                    .await
                    .or_raise(|| ErrorKind::Database)?;
                counts.deleted += 1;
            },
        }
        present.insert(checksum);
    }
    for (checksum, (dir, compressed)) in expected.iter().filter(|(sum, _)| !present.contains(*sum)) {
        sqlx::query(include_str!("../queries/upsert_location.sql"))
            .bind(checksum.as_str())
            .bind(dir.as_str())
            .bind(*compressed)
            .execute(&mut *conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        counts.inserted += 1;
    }
    Ok(())
}

async fn replace_deletions(conn: &mut SqliteConnection, expected: &BTreeMap<String, f64>) -> Result<()> {
    sqlx::query("DELETE FROM deletion")
        .execute(&mut *conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
    for (path, timestamp) in expected {
        sqlx::query(include_str!("../queries/mark_deleted.sql"))
            .bind(path.as_str())
            .bind(*timestamp)
            .execute(&mut *conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
    }
    Ok(())
}
