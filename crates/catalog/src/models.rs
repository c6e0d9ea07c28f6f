//! Catalog models.
//!
//! These types are shared between the index database and the per-run index
//! logs written into the archive.

use crate::error::{Error, ErrorKind};
use exn::OptionExt;
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;

/// Checksum sentinel for a file that disappeared since the previous run.
pub const DELETED: &str = "deleted";
/// Checksum sentinel for a file that was seen but could not be backed up.
pub const ERROR: &str = "error";

/// Current time as floating point seconds since the Unix epoch.
pub fn unix_now() -> f64 {
    OffsetDateTime::now_utc().unix_timestamp_nanos() as f64 / 1e9
}

/// One line of a run's index log.
///
/// Serialized as `checksum timestamp path`; the path is the remainder of the
/// line and may contain spaces. Immutable once written.
#[derive(Debug, Clone, PartialEq)]
pub struct FileEntry {
    pub checksum: String,
    /// Modification time of the source file (or the time of deletion).
    pub timestamp: f64,
    pub path: String,
}
impl FileEntry {
    pub fn new(checksum: impl Into<String>, timestamp: f64, path: impl Into<String>) -> Self {
        Self {
            checksum: checksum.into(),
            timestamp,
            path: path.into(),
        }
    }

    pub fn deleted(path: impl Into<String>, timestamp: f64) -> Self {
        Self::new(DELETED, timestamp, path)
    }

    pub fn error(path: impl Into<String>) -> Self {
        Self::new(ERROR, 0.0, path)
    }

    pub fn is_deletion(&self) -> bool {
        self.checksum == DELETED
    }

    pub fn is_error(&self) -> bool {
        self.checksum == ERROR
    }
}
impl fmt::Display for FileEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Debug formatting keeps the fractional part (`1290000000.0`), so
        // whatever reads the line back gets the exact same float.
        write!(f, "{} {:?} {}", self.checksum, self.timestamp, self.path)
    }
}
impl FromStr for FileEntry {
    type Err = Error;
    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut parts = line.splitn(3, ' ');
        let checksum = parts.next().filter(|c| !c.is_empty()).ok_or_raise(|| ErrorKind::InvalidData("checksum"))?;
        let timestamp = parts
            .next()
            .and_then(|t| t.parse::<f64>().ok())
            .ok_or_raise(|| ErrorKind::InvalidData("timestamp"))?;
        let path = parts.next().filter(|p| !p.is_empty()).ok_or_raise(|| ErrorKind::InvalidData("path"))?;
        Ok(Self::new(checksum, timestamp, path))
    }
}

/// Where the content for a checksum is archived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub checksum: String,
    /// `None` only for rows carried over from legacy databases whose content
    /// could not be found while upgrading.
    pub archive_dir: Option<String>,
    pub is_compressed: bool,
}

#[derive(sqlx::FromRow)]
pub(crate) struct LocationRow {
    checksum: String,
    archive_dir: Option<String>,
    is_compressed: bool,
}
impl From<LocationRow> for Location {
    fn from(row: LocationRow) -> Self {
        Self {
            checksum: row.checksum,
            archive_dir: row.archive_dir,
            is_compressed: row.is_compressed,
        }
    }
}

/// The parts of a source file's `stat` that decide whether it needs to be
/// read again.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FileStat {
    pub device: u64,
    pub inode: u64,
    pub mtime: f64,
    pub ctime: f64,
}

/// SQLite only has signed 64-bit integers; device and inode numbers are
/// stored bit-for-bit reinterpreted.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct FileStatRow {
    pub st_dev: i64,
    pub st_ino: i64,
    pub mtime: f64,
    pub ctime: f64,
}
impl From<FileStat> for FileStatRow {
    fn from(stat: FileStat) -> Self {
        Self {
            st_dev: stat.device.cast_signed(),
            st_ino: stat.inode.cast_signed(),
            mtime: stat.mtime,
            ctime: stat.ctime,
        }
    }
}
impl From<FileStatRow> for FileStat {
    fn from(row: FileStatRow) -> Self {
        Self {
            device: row.st_dev.cast_unsigned(),
            inode: row.st_ino.cast_unsigned(),
            mtime: row.mtime,
            ctime: row.ctime,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(
        "f8e920545e99cdc9bbc2650eb8282344e8971a7ff0c397c91355d0fcaf6c61fa 1507934953.0 /home/somepath",
        FileEntry::new("f8e920545e99cdc9bbc2650eb8282344e8971a7ff0c397c91355d0fcaf6c61fa", 1507934953.0, "/home/somepath")
    )]
    #[case(
        "32b772fb 1290000000.0 /home/sicko/real  sick.txt",
        FileEntry::new("32b772fb", 1290000000.0, "/home/sicko/real  sick.txt")
    )]
    #[case("error 0 /home/other.path", FileEntry::error("/home/other.path"))]
    #[case("deleted 1500000000.5 C:/tmp/file_a", FileEntry::deleted("C:/tmp/file_a", 1500000000.5))]
    fn test_parse_line(#[case] line: &str, #[case] expected: FileEntry) {
        assert_eq!(line.parse::<FileEntry>().unwrap(), expected);
    }

    #[rstest]
    #[case("")]
    #[case("abc")]
    #[case("abc notanumber /path")]
    #[case("abc 12.5")]
    #[case("abc 12.5 ")]
    fn test_parse_invalid_line(#[case] line: &str) {
        let err = line.parse::<FileEntry>().unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidData(_)));
    }

    #[test]
    fn test_display_keeps_float_precision() {
        let entry = FileEntry::new("bcf1a11", 1508532089.9937847, "path with spaces");
        assert_eq!(entry.to_string(), "bcf1a11 1508532089.9937847 path with spaces");
        assert_eq!(FileEntry::new("x", 1290000000.0, "p").to_string(), "x 1290000000.0 p");
        let parsed: FileEntry = entry.to_string().parse().unwrap();
        assert_eq!(parsed, entry);
    }

    #[rstest]
    #[case(0)]
    #[case(1 << 63)]
    #[case((1 << 63) + 5)]
    #[case(u64::MAX)]
    fn test_stat_row_keeps_every_bit(#[case] value: u64) {
        let stat = FileStat {
            device: value,
            inode: value,
            mtime: 1.5,
            ctime: 2.5,
        };
        assert_eq!(FileStat::from(FileStatRow::from(stat)), stat);
    }

    #[test]
    fn test_sentinels() {
        assert!(FileEntry::deleted("a", 1.0).is_deletion());
        assert!(FileEntry::error("a").is_error());
        assert!(!FileEntry::new("abc", 1.0, "a").is_deletion());
    }
}
