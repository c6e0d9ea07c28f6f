//! One backup run, from archive slot to committed index log.

use crate::archive::{ArchiveDirsToUse, LOG_SUFFIX};
use crate::db::Database;
use crate::deletion::DeletionTracker;
use crate::error::{ErrorKind, Result};
use crate::index::IndexFile;
use crate::models::FileEntry;
use crate::stream::StreamOpener;
use exn::ResultExt;
use std::path::PathBuf;
use stowage_config::Config;
use time::OffsetDateTime;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;

const RUN_NAME_FORMAT: &[BorrowedFormatItem<'_>] = format_description!("[year]_[month]_[day]_[hour][minute]");
const MAX_NAME_ATTEMPTS: u32 = 100;

/// Ties the database, an archive slot, the run's index log and deletion
/// tracking together.
///
/// The backup logic that reads and stores source files lives elsewhere; it
/// reports each file through [`record`](Self::record),
/// [`record_unchanged`](Self::record_unchanged) or
/// [`record_error`](Self::record_error).
pub struct BackupRun {
    db: Database,
    run_name: String,
    started: OffsetDateTime,
    log: IndexFile,
    tracker: DeletionTracker,
}

impl BackupRun {
    pub async fn start(db: &Database, cfg: &Config, dirs: &ArchiveDirsToUse, opener: &dyn StreamOpener) -> Result<Self> {
        Self::start_at(db, cfg, dirs, opener, OffsetDateTime::now_utc()).await
    }

    /// Start a run named after `started`. A run that starts in the same
    /// minute as an existing one gets a numeric suffix (`_2`, `_3`, ...).
    pub async fn start_at(
        db: &Database,
        cfg: &Config,
        dirs: &ArchiveDirsToUse,
        opener: &dyn StreamOpener,
        started: OffsetDateTime,
    ) -> Result<Self> {
        let base_name = started.format(RUN_NAME_FORMAT).or_raise(|| ErrorKind::InvalidData("run name"))?;
        let tracker = DeletionTracker::new(db).await?;
        let slot = dirs.get_returnable();
        let run_name = claim_run_name(db, cfg, &base_name, &slot).await?;
        let log = match IndexFile::create(&run_name, cfg, &slot, opener) {
            Ok(log) => log,
            Err(err) => {
                if let Err(cleanup) = db.forget_run(&run_name).await {
                    tracing::warn!(run = %run_name, error = ?cleanup, "Could not forget failed run");
                }
                return Err(err);
            },
        };
        let archive_dir = slot.consume();
        tracing::info!(run = %run_name, archive_dir = %archive_dir, "Backup run started");
        Ok(Self {
            db: db.clone(),
            run_name,
            started,
            log,
            tracker,
        })
    }

    pub fn run_name(&self) -> &str {
        &self.run_name
    }

    pub fn started(&self) -> OffsetDateTime {
        self.started
    }

    pub fn archive_dir(&self) -> &str {
        self.log.archive_dir()
    }

    /// A source file was backed up.
    pub async fn record(&self, entry: &FileEntry) -> Result<()> {
        self.log.add(entry)?;
        self.db.add_content(&self.run_name, entry).await?;
        self.tracker.seen(&entry.path).await
    }

    /// A source file still exists and hasn't changed since it was last
    /// recorded. Nothing is written; it just isn't deleted.
    pub async fn record_unchanged(&self, path: &str) -> Result<()> {
        self.tracker.seen(path).await
    }

    /// A source file exists but could not be backed up.
    pub async fn record_error(&self, path: &str) -> Result<()> {
        self.log.add(&FileEntry::error(path))?;
        self.tracker.seen(path).await
    }

    /// Record deletions and commit the index log. If the log can't be
    /// committed, the run's rows are dropped again.
    pub async fn finish(self) -> Result<PathBuf> {
        self.conclude(true).await
    }

    /// Commit the index log and keep the run, but record no deletions. For
    /// runs that could not look at every source path: anything they missed
    /// would otherwise be marked deleted.
    pub async fn finish_without_deletions(self) -> Result<PathBuf> {
        self.conclude(false).await
    }

    async fn conclude(self, record_deletions: bool) -> Result<PathBuf> {
        let Self {
            db, run_name, log, tracker, ..
        } = self;
        let committed = if record_deletions {
            match tracker.complete(&log).await {
                Ok(_) => log.commit(),
                Err(err) => Err(err),
            }
        } else {
            tracing::warn!(run = %run_name, unseen = tracker.remaining(), "Not recording deletions");
            log.commit()
        };
        match committed {
            Ok(path) => {
                tracing::info!(run = %run_name, log = %path.display(), "Backup run finished");
                Ok(path)
            },
            Err(err) => {
                if let Err(cleanup) = db.forget_run(&run_name).await {
                    tracing::warn!(run = %run_name, error = ?cleanup, "Could not forget failed run");
                }
                Err(err)
            },
        }
    }

    /// Give up: the index log is discarded and the run forgotten.
    pub async fn abort(self) -> Result<()> {
        let Self { db, run_name, log, .. } = self;
        drop(log);
        tracing::warn!(run = %run_name, "Backup run aborted");
        db.forget_run(&run_name).await
    }
}

/// Claim the first free name of `base_name`, `base_name_2`, ... for a run
/// logging into `archive_dir`. A name is free when neither the database nor
/// the archive directory knows it.
async fn claim_run_name(db: &Database, cfg: &Config, base_name: &str, archive_dir: &str) -> Result<String> {
    let dir = cfg.archive_root_path.join(archive_dir);
    for attempt in 1..=MAX_NAME_ATTEMPTS {
        let name = match attempt {
            1 => base_name.to_string(),
            n => format!("{base_name}_{n}"),
        };
        if dir.join(format!("{name}{LOG_SUFFIX}")).exists() {
            continue;
        }
        if db.record_run(&name, archive_dir).await? {
            return Ok(name);
        }
    }
    exn::bail!(ErrorKind::InvalidData("no free run name"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::scan_tree;
    use crate::index::read_index_file;
    use crate::stream::PlainText;
    use std::collections::{HashMap, HashSet};
    use stowage_config::Password;
    use time::macros::datetime;

    async fn setup(dir: &tempfile::TempDir) -> (Database, Config) {
        let cfg = Config::new(dir.path(), Password::new("secret"));
        let db = Database::from_config(&cfg, true).await.unwrap();
        (db, cfg)
    }

    #[tokio::test]
    async fn test_full_run() {
        let dir = tempfile::tempdir().unwrap();
        let (db, cfg) = setup(&dir).await;
        for path in ["/a", "/b", "/c"] {
            db.add_content("2017_10_13_0800", &FileEntry::new("abc", 1.0, path)).await.unwrap();
        }
        let dirs = ArchiveDirsToUse::new(db.archive_dir_usage().await.unwrap());

        let run = BackupRun::start_at(&db, &cfg, &dirs, &PlainText, datetime!(2017-10-14 09:20 UTC)).await.unwrap();
        assert_eq!(run.run_name(), "2017_10_14_0920");
        assert_eq!(run.archive_dir(), "00");
        run.record(&FileEntry::new("abc", 1.0, "/a")).await.unwrap();
        run.record(&FileEntry::new("def", 2.0, "/b")).await.unwrap();
        run.record_error("/d").await.unwrap();
        let path = run.finish().await.unwrap();

        assert_eq!(path, dir.path().join("00/2017_10_14_0920.lst"));
        let entries = read_index_file(&path, &cfg.password, &PlainText).unwrap();
        let summary: Vec<(&str, &str)> = entries.iter().map(|e| (e.checksum.as_str(), e.path.as_str())).collect();
        assert_eq!(summary, vec![("abc", "/a"), ("def", "/b"), ("error", "/d"), ("deleted", "/c")]);
        assert_eq!(
            db.get_undeleted_files().await.unwrap(),
            HashSet::from(["/a".to_string(), "/b".to_string()])
        );
        db.close().await;
    }

    #[tokio::test]
    async fn test_aborted_run_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (db, cfg) = setup(&dir).await;
        let dirs = ArchiveDirsToUse::new([]);
        let run = BackupRun::start_at(&db, &cfg, &dirs, &PlainText, datetime!(2020-01-02 03:04 UTC)).await.unwrap();
        run.record(&FileEntry::new("abc", 1.0, "/a")).await.unwrap();
        run.abort().await.unwrap();

        assert!(!dir.path().join("00/2020_01_02_0304.lst").exists());
        assert!(!dir.path().join("00/2020_01_02_0304.lst.part").exists());
        assert!(db.get_undeleted_files().await.unwrap().is_empty());
        db.close().await;
    }

    #[tokio::test]
    async fn test_failed_start_returns_the_slot() {
        let dir = tempfile::tempdir().unwrap();
        let (db, cfg) = setup(&dir).await;
        let dirs = ArchiveDirsToUse::new([]);
        // A file where the archive subdirectory should go.
        std::fs::write(dir.path().join("00"), b"in the way").unwrap();
        let started = datetime!(2020-01-02 03:04 UTC);
        assert!(BackupRun::start_at(&db, &cfg, &dirs, &PlainText, started).await.is_err());
        assert_eq!(dirs.get(), "00");
        // The name claimed for the run was given up again.
        assert!(db.archive_dir_usage().await.unwrap().is_empty());
        db.close().await;
    }

    #[tokio::test]
    async fn test_runs_in_the_same_minute_keep_their_logs() {
        let dir = tempfile::tempdir().unwrap();
        let (db, cfg) = setup(&dir).await;
        let started = datetime!(2020-01-02 03:04 UTC);

        let dirs = ArchiveDirsToUse::new(db.archive_dir_usage().await.unwrap());
        let first = BackupRun::start_at(&db, &cfg, &dirs, &PlainText, started).await.unwrap();
        first.record(&FileEntry::new("aaa", 1.0, "/first")).await.unwrap();
        let first_log = first.finish().await.unwrap();

        let dirs = ArchiveDirsToUse::new(db.archive_dir_usage().await.unwrap());
        let second = BackupRun::start_at(&db, &cfg, &dirs, &PlainText, started).await.unwrap();
        assert_eq!(second.run_name(), "2020_01_02_0304_2");
        second.record(&FileEntry::new("bbb", 2.0, "/second")).await.unwrap();
        second.record(&FileEntry::new("aaa", 1.0, "/first")).await.unwrap();
        let second_log = second.finish().await.unwrap();

        assert_ne!(first_log, second_log);
        let first_entries = read_index_file(&first_log, &cfg.password, &PlainText).unwrap();
        assert_eq!(first_entries, vec![FileEntry::new("aaa", 1.0, "/first")]);
        let second_entries = read_index_file(&second_log, &cfg.password, &PlainText).unwrap();
        assert_eq!(second_entries.len(), 2);
        db.close().await;
    }

    #[tokio::test]
    async fn test_run_logs_count_towards_directory_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let (db, cfg) = setup(&dir).await;
        let dirs = ArchiveDirsToUse::new(db.archive_dir_usage().await.unwrap());
        let run = BackupRun::start_at(&db, &cfg, &dirs, &PlainText, datetime!(2020-01-02 03:04 UTC)).await.unwrap();
        assert_eq!(run.archive_dir(), "00");
        for i in 0..99u32 {
            let slot = dirs.get();
            assert_eq!(slot, "00");
            let checksum = format!("{i:064x}");
            std::fs::write(dir.path().join(&slot).join(&checksum), b"x").unwrap();
            db.add_location(&checksum, &slot, false).await.unwrap();
        }
        run.finish().await.unwrap();

        let from_db = db.archive_dir_usage().await.unwrap();
        assert_eq!(from_db, HashMap::from([("00".to_string(), 100)]));
        assert_eq!(scan_tree(dir.path()).unwrap().usage(), from_db);
        assert_eq!(ArchiveDirsToUse::new(from_db).get(), "01");
        db.close().await;
    }

    #[tokio::test]
    async fn test_finish_without_deletions() {
        let dir = tempfile::tempdir().unwrap();
        let (db, cfg) = setup(&dir).await;
        for path in ["/a", "/b"] {
            db.add_content("2017_10_13_0800", &FileEntry::new("abc", 1.0, path)).await.unwrap();
        }
        let dirs = ArchiveDirsToUse::new([]);
        let run = BackupRun::start_at(&db, &cfg, &dirs, &PlainText, datetime!(2017-10-14 09:20 UTC)).await.unwrap();
        run.record(&FileEntry::new("def", 2.0, "/a")).await.unwrap();
        run.record_error("/c").await.unwrap();
        let path = run.finish_without_deletions().await.unwrap();

        let entries = read_index_file(&path, &cfg.password, &PlainText).unwrap();
        assert!(entries.iter().all(|e| !e.is_deletion()));
        assert_eq!(entries.len(), 2);
        assert_eq!(
            db.get_undeleted_files().await.unwrap(),
            HashSet::from(["/a".to_string(), "/b".to_string()])
        );
        // The run itself is kept.
        assert_eq!(db.archive_dir_usage().await.unwrap(), HashMap::from([("00".to_string(), 1)]));
        db.close().await;
    }
}
