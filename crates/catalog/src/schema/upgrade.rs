//! Whole-file guarded schema upgrades.
//!
//! The pool is drained and the database file copied to `<path>.backup` before
//! the first script runs. If anything goes wrong the copy is moved back over
//! the live file, so a failed upgrade leaves the database byte for byte as it
//! was. The backup never outlives the upgrade.

use super::{ARCHIVE_COLUMNS_VERSION, Plan, Schema, SchemaVersion, backfill, inspect};
use crate::error::{ErrorKind, Result};
use crate::pool::ConnectionPool;
use exn::ResultExt;
use std::io;
use std::path::{Path, PathBuf};
use tracing::instrument;

/// What [`Database::open`](crate::Database::open) did to the schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchemaUpgrade {
    pub from: SchemaVersion,
    pub to: SchemaVersion,
    /// Scripts applied; creating a new database counts as one.
    pub steps: usize,
}

pub(crate) fn backup_path(db_path: &Path) -> PathBuf {
    sibling(db_path, ".backup")
}

fn sibling(db_path: &Path, suffix: &str) -> PathBuf {
    let mut path = db_path.as_os_str().to_owned();
    path.push(suffix);
    PathBuf::from(path)
}

pub(crate) struct SchemaManager<'a> {
    pub db_path: &'a Path,
    pub archive_root: &'a Path,
    pub schema: &'a Schema,
}

impl SchemaManager<'_> {
    /// Bring the database up to the packaged schema. Returns `None` when it
    /// already was.
    #[instrument(skip_all, fields(database = %self.db_path.display()))]
    pub async fn ensure(&self, pool: &ConnectionPool) -> Result<Option<SchemaUpgrade>> {
        let installed = {
            let mut conn = pool.acquire().await?;
            inspect(&mut conn).await?
        };
        let plan = self.schema.plan(installed)?;
        if plan == Plan::UpToDate {
            tracing::debug!(version = %installed, "Schema up to date");
            return Ok(None);
        }

        let prior = pool.resize(0).await?;
        let backup = backup_path(self.db_path);
        if let Err(err) = tokio::fs::copy(self.db_path, &backup).await {
            remove_if_exists(&backup).await;
            pool.resize(prior).await?;
            return Err(err).or_raise(|| ErrorKind::Io).or_raise(|| ErrorKind::SchemaUpgrade);
        }

        tracing::info!(from = %installed, to = %self.schema.version(), "Upgrading database schema");
        let outcome = self.apply(pool, installed, plan).await;
        // The upgrade connection has to be closed before the file is touched.
        let drained = pool.resize(0).await;
        match outcome.and_then(|report| drained.map(|_| report)) {
            Ok(report) => {
                conclude(pool, &backup, prior).await?;
                tracing::info!(from = %report.from, to = %report.to, steps = report.steps, "Schema upgraded");
                Ok(Some(report))
            },
            Err(err) => {
                self.restore(&backup).await;
                Err(err).or_raise(|| ErrorKind::SchemaUpgrade)
            },
        }
    }

    async fn apply(&self, pool: &ConnectionPool, installed: SchemaVersion, plan: Plan<'_>) -> Result<SchemaUpgrade> {
        pool.resize(1).await?;
        let mut conn = pool.acquire().await?;
        let steps = match plan {
            Plan::UpToDate => 0,
            Plan::Create(sql) => {
                sqlx::raw_sql(sql).execute(&mut *conn).await.or_raise(|| ErrorKind::Database)?;
                1
            },
            Plan::Upgrade(scripts) => {
                for &(target, sql) in &scripts {
                    tracing::info!(to = target, "Applying schema upgrade script");
                    sqlx::raw_sql(sql).execute(&mut *conn).await.or_raise(|| ErrorKind::Database)?;
                    if target == ARCHIVE_COLUMNS_VERSION {
                        backfill::archive_columns(&mut conn, self.archive_root).await?;
                    }
                }
                scripts.len()
            },
        };
        let reached = inspect(&mut conn).await?;
        if reached != self.schema.version() {
            exn::bail!(ErrorKind::InvalidData("schema version after upgrade"));
        }
        Ok(SchemaUpgrade {
            from: installed,
            to: reached,
            steps,
        })
    }

    /// Put the pre-upgrade file back. Only called with the pool drained.
    async fn restore(&self, backup: &Path) {
        match tokio::fs::rename(backup, self.db_path).await {
            Ok(()) => tracing::warn!(database = %self.db_path.display(), "Restored database after failed upgrade"),
            Err(e) => {
                tracing::error!(
                    backup = %backup.display(),
                    error = %e,
                    "Could not restore database after failed upgrade; the backup has been left in place"
                );
                return;
            },
        }
        for suffix in ["-journal", "-wal", "-shm"] {
            remove_if_exists(&sibling(self.db_path, suffix)).await;
        }
    }
}

/// Drop the backup of a successful upgrade and give the pool back its size.
/// A backup that won't go away is only worth a warning.
async fn conclude(pool: &ConnectionPool, backup: &Path, prior: u32) -> Result<()> {
    if let Err(e) = tokio::fs::remove_file(backup).await {
        tracing::warn!(backup = %backup.display(), error = %e, "Could not remove schema backup");
    }
    pool.resize(prior).await?;
    Ok(())
}

async fn remove_if_exists(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await
        && e.kind() != io::ErrorKind::NotFound
    {
        tracing::warn!(path = %path.display(), error = %e, "Could not remove file");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::tests::{checksum, touch};
    use crate::db::{Database, OpenOptions};
    use sqlx::Connection;
    use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};

    const LEGACY_RUN: &str = "2017_10_14_0920";

    /// The very first schema, from before databases carried a version.
    const LEGACY_SCHEMA: &str = r#"
        CREATE TABLE run (run_name TEXT PRIMARY KEY);
        CREATE TABLE content (
            run_name TEXT NOT NULL,
            path TEXT NOT NULL,
            timestamp REAL NOT NULL,
            checksum TEXT NOT NULL
        );
        CREATE TABLE location (checksum TEXT PRIMARY KEY);
    "#;

    async fn connect(path: &Path) -> SqliteConnection {
        let options = SqliteConnectOptions::new().filename(path).create_if_missing(true);
        SqliteConnection::connect_with(&options).await.unwrap()
    }

    async fn legacy_database(path: &Path, checksums: &[String]) {
        let mut conn = connect(path).await;
        sqlx::raw_sql(LEGACY_SCHEMA).execute(&mut conn).await.unwrap();
        sqlx::query("INSERT INTO run (run_name) VALUES (?)")
            .bind(LEGACY_RUN)
            .execute(&mut conn)
            .await
            .unwrap();
        for (i, sum) in checksums.iter().enumerate() {
            sqlx::query("INSERT INTO location (checksum) VALUES (?)")
                .bind(sum.as_str())
                .execute(&mut conn)
                .await
                .unwrap();
            sqlx::query("INSERT INTO content (run_name, path, timestamp, checksum) VALUES (?, ?, ?, ?)")
                .bind(LEGACY_RUN)
                .bind(format!("/home/user/file {i}"))
                .bind(1507934953.0)
                .bind(sum.as_str())
                .execute(&mut conn)
                .await
                .unwrap();
        }
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_legacy_database_is_upgraded_and_backfilled() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let db_path = root.join("index.sl3");
        touch(root, &format!("00/{}", checksum(1)));
        touch(root, &format!("00/{}.z", checksum(2)));
        touch(root, &format!("00/{LEGACY_RUN}.lst"));
        legacy_database(&db_path, &[checksum(1), checksum(2), checksum(3)]).await;

        let db = Database::open(&db_path, root, false).await.unwrap();
        assert_eq!(
            db.schema_upgrade(),
            Some(SchemaUpgrade {
                from: SchemaVersion::Unversioned1,
                to: SchemaVersion::Versioned(4),
                steps: 3,
            })
        );
        assert!(!backup_path(&db_path).exists());
        assert_eq!(db.pool().size().await, OpenOptions::default().pool_size);

        let plain = db.get_location(&checksum(1)).await.unwrap().unwrap();
        assert_eq!((plain.archive_dir.as_deref(), plain.is_compressed), (Some("00"), false));
        let compressed = db.get_location(&checksum(2)).await.unwrap().unwrap();
        assert_eq!((compressed.archive_dir.as_deref(), compressed.is_compressed), (Some("00"), true));
        let missing = db.get_location(&checksum(3)).await.unwrap().unwrap();
        assert_eq!(missing.archive_dir, None);

        let mut conn = db.pool().acquire().await.unwrap();
        let run_dir: Option<String> = sqlx::query_scalar("SELECT archive_dir FROM run WHERE run_name = ?")
            .bind(LEGACY_RUN)
            .fetch_one(&mut *conn)
            .await
            .unwrap();
        drop(conn);
        assert_eq!(run_dir.as_deref(), Some("00"));
        assert_eq!(db.get_undeleted_files().await.unwrap().len(), 3);
        db.close().await;

        let db = Database::open(&db_path, root, false).await.unwrap();
        assert_eq!(db.schema_upgrade(), None);
        db.close().await;
    }

    #[tokio::test]
    async fn test_failed_upgrade_restores_database() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("index.sl3");
        legacy_database(&db_path, &[checksum(1)]).await;
        let before = std::fs::read(&db_path).unwrap();

        // Step 2 succeeds, step 3 fails halfway through.
        let schema = Schema::embedded()
            .with_upgrade(3, "CREATE TABLE half_done (x INTEGER); INSERT INTO no_such_table VALUES (1);");
        let options = OpenOptions {
            schema,
            ..OpenOptions::default()
        };
        let err = Database::open_with(&db_path, dir.path(), false, options).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::SchemaUpgrade));

        assert_eq!(std::fs::read(&db_path).unwrap(), before);
        assert!(!backup_path(&db_path).exists());
        assert!(!sibling(&db_path, "-journal").exists());

        // Nothing was lost; the packaged scripts still work.
        let db = Database::open(&db_path, dir.path(), false).await.unwrap();
        assert_eq!(db.schema_upgrade().map(|u| u.steps), Some(3));
        db.close().await;
    }

    #[tokio::test]
    async fn test_stuck_backup_does_not_fail_the_upgrade() {
        let dir = tempfile::tempdir().unwrap();
        let options = SqliteConnectOptions::new().filename(dir.path().join("index.sl3")).create_if_missing(true);
        let pool = ConnectionPool::open(options, 0).await.unwrap();
        // A directory can't be removed with remove_file.
        let backup = dir.path().join("index.sl3.backup");
        std::fs::create_dir(&backup).unwrap();

        conclude(&pool, &backup, 3).await.unwrap();
        assert_eq!(pool.size().await, 3);
        pool.acquire().await.unwrap();
        pool.close().await;
    }

    #[tokio::test]
    async fn test_newer_database_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("index.sl3");
        Database::open(&db_path, dir.path(), true).await.unwrap().close().await;
        let mut conn = connect(&db_path).await;
        sqlx::query("UPDATE _database_version SET current_version = '9'")
            .execute(&mut conn)
            .await
            .unwrap();
        conn.close().await.unwrap();
        let before = std::fs::read(&db_path).unwrap();

        let err = Database::open(&db_path, dir.path(), false).await.unwrap_err();
        assert!(matches!(
            &*err,
            ErrorKind::SchemaTooNew {
                installed: 9,
                supported: 4
            }
        ));
        assert_eq!(std::fs::read(&db_path).unwrap(), before);
        assert!(!backup_path(&db_path).exists());
    }

    #[tokio::test]
    async fn test_upgraded_schema_matches_fresh_schema() {
        let dir = tempfile::tempdir().unwrap();
        let legacy_path = dir.path().join("legacy.sl3");
        legacy_database(&legacy_path, &[]).await;
        let upgraded = Database::open(&legacy_path, dir.path(), false).await.unwrap();
        let fresh = Database::open(dir.path().join("fresh.sl3"), dir.path(), true).await.unwrap();

        let columns = "SELECT m.name, p.name FROM sqlite_master m, pragma_table_info(m.name) p \
                       WHERE m.type = 'table' ORDER BY m.name, p.name";
        let mut a = upgraded.pool().acquire().await.unwrap();
        let mut b = fresh.pool().acquire().await.unwrap();
        let upgraded_columns: Vec<(String, String)> = sqlx::query_as(columns).fetch_all(&mut *a).await.unwrap();
        let fresh_columns: Vec<(String, String)> = sqlx::query_as(columns).fetch_all(&mut *b).await.unwrap();
        assert_eq!(upgraded_columns, fresh_columns);
        drop((a, b));
        upgraded.close().await;
        fresh.close().await;
    }
}
