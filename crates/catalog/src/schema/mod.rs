//! Schema versions and upgrade planning.
//!
//! A database either carries an explicit marker in `_database_version`, or it
//! predates versioning and is classified by which tables it has. The packaged
//! [`Schema`] knows the latest version, the full script used to create it, and
//! one upgrade script per intermediate version.

mod backfill;
mod upgrade;

pub use upgrade::SchemaUpgrade;
pub(crate) use upgrade::SchemaManager;

use crate::error::{ErrorKind, Result};
use exn::{OptionExt, ResultExt};
use regex::Regex;
use sqlx::SqliteConnection;
use std::borrow::Cow;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

/// Version whose upgrade introduced the archive columns that have to be
/// filled in from the archive tree.
pub(crate) const ARCHIVE_COLUMNS_VERSION: u32 = 3;
const VERSION_TABLE: &str = "_database_version";
const EMBEDDED_VERSION: u32 = 4;
const EMBEDDED_BASE: &str = include_str!("../../migrations/schema.sql");
const EMBEDDED_UPGRADES: [(u32, &str); 3] = [
    (2, include_str!("../../migrations/upgrade/0002.sql")),
    (3, include_str!("../../migrations/upgrade/0003.sql")),
    (4, include_str!("../../migrations/upgrade/0004.sql")),
];

static VERSION_COMMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^--\s*schema version (\d+)\s*$").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchemaVersion {
    /// Empty file; nothing has been created yet.
    Unversioned0,
    /// Legacy database with a `run` table and no version marker.
    Unversioned1,
    /// Legacy database with a `completed_run` table and no version marker.
    Unversioned2,
    Versioned(u32),
}

impl SchemaVersion {
    pub fn from_number(number: u32) -> Self {
        match number {
            0 => Self::Unversioned0,
            1 => Self::Unversioned1,
            2 => Self::Unversioned2,
            n => Self::Versioned(n),
        }
    }

    pub fn number(self) -> u32 {
        match self {
            Self::Unversioned0 => 0,
            Self::Unversioned1 => 1,
            Self::Unversioned2 => 2,
            Self::Versioned(n) => n,
        }
    }
}

impl Ord for SchemaVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.number().cmp(&other.number())
    }
}

impl PartialOrd for SchemaVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.number())
    }
}

/// Classify a database without a version marker from its table names.
pub fn classify_legacy<'a>(tables: impl IntoIterator<Item = &'a str>) -> SchemaVersion {
    let mut version = SchemaVersion::Unversioned0;
    for table in tables {
        match table {
            "completed_run" => return SchemaVersion::Unversioned2,
            "run" => version = SchemaVersion::Unversioned1,
            _ => {},
        }
    }
    version
}

/// Parse the marker stored in `_database_version`. Only the major part of a
/// dotted version counts.
fn parse_marker(marker: &str) -> Result<SchemaVersion> {
    let major = marker.trim().split('.').next().unwrap_or_default();
    let number = major.parse::<u32>().or_raise(|| ErrorKind::InvalidData("schema version marker"))?;
    Ok(SchemaVersion::from_number(number))
}

/// Determine the installed schema version. Read-only.
pub(crate) async fn inspect(conn: &mut SqliteConnection) -> Result<SchemaVersion> {
    let tables: Vec<String> = sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type = 'table'")
        .fetch_all(&mut *conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
    if !tables.iter().any(|t| t == VERSION_TABLE) {
        return Ok(classify_legacy(tables.iter().map(String::as_str)));
    }
    let marker: Option<String> = sqlx::query_scalar("SELECT current_version FROM _database_version")
        .fetch_optional(&mut *conn)
        .await
        .or_raise(|| ErrorKind::Database)?;
    parse_marker(&marker.ok_or_raise(|| ErrorKind::InvalidData("schema version marker"))?)
}

/// What has to happen to bring a database up to date.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Plan<'a> {
    UpToDate,
    /// Empty database; run the full schema script.
    Create(&'a str),
    /// Run each script in order; the number is the version it produces.
    Upgrade(Vec<(u32, &'a str)>),
}

/// The packaged schema: the latest full script plus the upgrade scripts
/// leading to it.
#[derive(Debug, Clone)]
pub struct Schema {
    version: u32,
    base: Cow<'static, str>,
    upgrades: BTreeMap<u32, Cow<'static, str>>,
}

impl Schema {
    /// The schema compiled into this crate.
    pub fn embedded() -> Self {
        Self {
            version: EMBEDDED_VERSION,
            base: Cow::Borrowed(EMBEDDED_BASE),
            upgrades: EMBEDDED_UPGRADES.iter().map(|&(v, sql)| (v, Cow::Borrowed(sql))).collect(),
        }
    }

    /// A schema from a full creation script, which must declare its version
    /// with a `-- schema version N` line.
    pub fn new(base: impl Into<Cow<'static, str>>) -> Result<Self> {
        let base = base.into();
        let version = VERSION_COMMENT
            .captures(&base)
            .and_then(|c| c[1].parse::<u32>().ok())
            .ok_or_raise(|| ErrorKind::InvalidData("schema version comment"))?;
        Ok(Self {
            version,
            base,
            upgrades: BTreeMap::new(),
        })
    }

    /// Add or replace the script that upgrades a database to `target`.
    pub fn with_upgrade(mut self, target: u32, sql: impl Into<Cow<'static, str>>) -> Self {
        self.upgrades.insert(target, sql.into());
        self
    }

    pub fn version(&self) -> SchemaVersion {
        SchemaVersion::from_number(self.version)
    }

    pub(crate) fn plan(&self, installed: SchemaVersion) -> Result<Plan<'_>> {
        let installed_number = installed.number();
        match installed_number.cmp(&self.version) {
            Ordering::Equal => return Ok(Plan::UpToDate),
            Ordering::Greater => exn::bail!(ErrorKind::SchemaTooNew {
                installed: installed_number,
                supported: self.version,
            }),
            Ordering::Less => {},
        }
        if installed == SchemaVersion::Unversioned0 {
            return Ok(Plan::Create(&self.base));
        }
        let steps = (installed_number + 1..=self.version)
            .map(|target| {
                self.upgrades
                    .get(&target)
                    .map(|sql| (target, sql.as_ref()))
                    .ok_or_raise(|| ErrorKind::MissingUpgrade(target))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Plan::Upgrade(steps))
    }
}

impl Default for Schema {
    fn default() -> Self {
        Self::embedded()
    }
}
