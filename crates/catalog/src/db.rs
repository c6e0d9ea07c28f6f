//! The index database.
//!
//! One SQLite file holds every run, every file seen by a run, where each
//! checksum's content is archived and which source paths have been deleted.
//! Opening it brings the schema up to date before any query is served.

use crate::error::{ErrorKind, Result};
use crate::models::{FileEntry, FileStat, FileStatRow, Location, LocationRow};
use crate::pool::ConnectionPool;
use crate::schema::{Schema, SchemaManager, SchemaUpgrade};
use exn::ResultExt;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use stowage_config::Config;
use tracing::instrument;

const DEFAULT_POOL_SIZE: u32 = 4;

#[derive(Debug, Clone)]
pub struct OpenOptions {
    /// Pooled connections once the database is open.
    pub pool_size: u32,
    pub schema: Schema,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            schema: Schema::embedded(),
        }
    }
}

/// Handle to the index database. Cheap to clone; clones share one pool.
#[derive(Debug, Clone)]
pub struct Database {
    pool: Arc<ConnectionPool>,
    path: PathBuf,
    upgrade: Option<SchemaUpgrade>,
}

impl Database {
    /// Open the database at `path`, creating it if allowed, and upgrade its
    /// schema if it is behind.
    pub async fn open(path: impl AsRef<Path>, archive_root: impl AsRef<Path>, allow_create: bool) -> Result<Self> {
        Self::open_with(path, archive_root, allow_create, OpenOptions::default()).await
    }

    /// Open the configured database.
    pub async fn from_config(cfg: &Config, allow_create: bool) -> Result<Self> {
        let options = OpenOptions {
            pool_size: cfg.pool_size,
            ..OpenOptions::default()
        };
        Self::open_with(cfg.database_path(), &cfg.archive_root_path, allow_create, options).await
    }

    #[instrument(skip_all, fields(database = %path.as_ref().display()))]
    pub async fn open_with(
        path: impl AsRef<Path>,
        archive_root: impl AsRef<Path>,
        allow_create: bool,
        options: OpenOptions,
    ) -> Result<Self> {
        let path = path.as_ref();
        let exists = tokio::fs::try_exists(path).await.or_raise(|| ErrorKind::Io)?;
        if !exists && !allow_create {
            exn::bail!(ErrorKind::NotFound(path.to_path_buf()));
        }
        if options.pool_size == 0 {
            exn::bail!(ErrorKind::InvalidData("pool size"));
        }

        let connect = Self::base_options().filename(path).create_if_missing(allow_create);
        let pool = ConnectionPool::open(connect, options.pool_size).await?;
        let manager = SchemaManager {
            db_path: path,
            archive_root: archive_root.as_ref(),
            schema: &options.schema,
        };
        let upgrade = match manager.ensure(&pool).await {
            Ok(upgrade) => upgrade,
            Err(err) => {
                pool.close().await;
                return Err(err);
            },
        };
        tracing::debug!(created = !exists, "Database open");
        Ok(Self {
            pool: Arc::new(pool),
            path: path.to_path_buf(),
            upgrade,
        })
    }

    /// Connection options shared by every pooled connection.
    fn base_options() -> SqliteConnectOptions {
        SqliteConnectOptions::new()
            // A rollback journal keeps the whole database in one file, which
            // is what the upgrade backup copies and restores.
            .journal_mode(SqliteJournalMode::Delete)
            .foreign_keys(true)
            .synchronous(SqliteSynchronous::Normal)
            // Backup workers write concurrently; waiting out another
            // connection's write lock is expected.
            .busy_timeout(Duration::from_secs(30))
            .auto_vacuum(sqlx::sqlite::SqliteAutoVacuum::None)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// The schema change made while opening, if any.
    pub fn schema_upgrade(&self) -> Option<SchemaUpgrade> {
        self.upgrade
    }

    /// Wait for every connection to be returned, then close them all.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    // =========================================================================
    // Deletions
    // =========================================================================

    /// Every path the database believes still exists.
    pub async fn get_undeleted_files(&self) -> Result<HashSet<String>> {
        let mut conn = self.pool.acquire().await?;
        let paths: Vec<String> = sqlx::query_scalar(include_str!("../queries/get_undeleted_files.sql"))
            .fetch_all(&mut *conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(paths.into_iter().collect())
    }

    /// Forget that `path` was ever deleted; it exists again.
    pub async fn unmark_deleted(&self, path: &str) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("DELETE FROM deletion WHERE path = ?")
            .bind(path)
            .execute(&mut *conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    /// Record every path as deleted at `timestamp`, in one transaction. Paths
    /// already marked keep their original deletion time.
    pub async fn mark_deleted<I, S>(&self, timestamp: f64, paths: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let paths: Vec<S> = paths.into_iter().collect();
        let mut tx = self.pool.begin().await?;
        for path in &paths {
            sqlx::query(include_str!("../queries/mark_deleted.sql"))
                .bind(path.as_ref())
                .bind(timestamp)
                .execute(&mut *tx)
                .await
                .or_raise(|| ErrorKind::Database)?;
        }
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    // =========================================================================
    // Runs and content
    // =========================================================================

    /// Claim `run_name` for a new run. Returns `false`, changing nothing, when
    /// a run of that name already exists.
    pub async fn record_run(&self, run_name: &str, archive_dir: &str) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        let result = sqlx::query("INSERT OR IGNORE INTO run (run_name, archive_dir) VALUES (?, ?)")
            .bind(run_name)
            .bind(archive_dir)
            .execute(&mut *conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(result.rows_affected() == 1)
    }

    /// Drop a failed run and everything it recorded.
    pub async fn forget_run(&self, run_name: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM content WHERE run_name = ?")
            .bind(run_name)
            .execute(&mut *tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        sqlx::query("DELETE FROM run WHERE run_name = ?")
            .bind(run_name)
            .execute(&mut *tx)
            .await
            .or_raise(|| ErrorKind::Database)?;
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    pub async fn add_content(&self, run_name: &str, entry: &FileEntry) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("INSERT INTO content (run_name, path, timestamp, checksum) VALUES (?, ?, ?, ?)")
            .bind(run_name)
            .bind(entry.path.as_str())
            .bind(entry.timestamp)
            .bind(entry.checksum.as_str())
            .execute(&mut *conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    // =========================================================================
    // Locations
    // =========================================================================

    pub async fn add_location(&self, checksum: &str, archive_dir: &str, is_compressed: bool) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query(include_str!("../queries/upsert_location.sql"))
            .bind(checksum)
            .bind(archive_dir)
            .bind(is_compressed)
            .execute(&mut *conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    /// Where the content for `checksum` is archived, if it is.
    pub async fn get_location(&self, checksum: &str) -> Result<Option<Location>> {
        let mut conn = self.pool.acquire().await?;
        let row: Option<LocationRow> = sqlx::query_as(include_str!("../queries/get_location.sql"))
            .bind(checksum)
            .fetch_optional(&mut *conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(row.map(Location::from))
    }

    /// Number of archived checksums per archive subdirectory, suitable as
    /// initial usage for [`ArchiveDirsToUse`](crate::ArchiveDirsToUse).
    pub async fn archive_dir_usage(&self) -> Result<HashMap<String, u32>> {
        let mut conn = self.pool.acquire().await?;
        let rows: Vec<(String, i64)> = sqlx::query_as(include_str!("../queries/archive_dir_usage.sql"))
            .fetch_all(&mut *conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        rows.into_iter()
            .map(|(dir, used)| {
                u32::try_from(used)
                    .map(|used| (dir, used))
                    .or_raise(|| ErrorKind::InvalidData("usage count"))
            })
            .collect()
    }

    // =========================================================================
    // File metadata
    // =========================================================================

    pub async fn remember_file_metadata(&self, path: &str, stat: FileStat) -> Result<()> {
        let row = FileStatRow::from(stat);
        let mut conn = self.pool.acquire().await?;
        sqlx::query(include_str!("../queries/upsert_file_metadata.sql"))
            .bind(path)
            .bind(row.st_dev)
            .bind(row.st_ino)
            .bind(row.mtime)
            .bind(row.ctime)
            .execute(&mut *conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(())
    }

    /// Whether `path` still looks exactly like it did when last remembered.
    pub async fn is_file_unchanged(&self, path: &str, stat: FileStat) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        let row: Option<FileStatRow> = sqlx::query_as(include_str!("../queries/get_file_metadata.sql"))
            .bind(path)
            .fetch_optional(&mut *conn)
            .await
            .or_raise(|| ErrorKind::Database)?;
        Ok(row.map(FileStat::from) == Some(stat))
    }
}
