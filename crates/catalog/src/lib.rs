//! Backup catalog for stowage.
//!
//! Tracks, across repeated backup runs, which source files exist, where their
//! content is archived and which files have since been deleted.
//!
//! # Architecture
//! - [`Database`]: the SQLite index. Opening it upgrades the schema under a
//!   whole-file backup, so a failed upgrade leaves the file untouched.
//! - [`ArchiveDirsToUse`]: hands out archive subdirectories with spare
//!   capacity, filling existing ones first.
//! - [`IndexFile`]: the append-only log of one run, only visible under its
//!   final name once complete.
//! - [`DeletionTracker`]: works out which known files a run did not see.
//! - [`BackupRun`]: ties the above together for one run.
//! - [`Database::rebuild`]: recovers the database from the archive alone.

pub mod archive;
mod db;
mod deletion;
pub mod error;
pub mod index;
mod models;
mod pool;
mod rebuild;
mod run;
pub mod schema;
pub mod stream;

pub use crate::archive::{ArchiveDirsToUse, ReturnableDir};
pub use crate::db::{Database, OpenOptions};
pub use crate::deletion::DeletionTracker;
pub use crate::index::IndexFile;
pub use crate::models::{DELETED, ERROR, FileEntry, FileStat, Location, unix_now};
pub use crate::pool::ConnectionPool;
pub use crate::rebuild::RebuildCounts;
pub use crate::run::BackupRun;
pub use crate::schema::{Schema, SchemaUpgrade, SchemaVersion};
