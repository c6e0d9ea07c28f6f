//! Catalog Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.

use derive_more::{Display, Error};
use std::path::PathBuf;

/// A catalog error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for catalog operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// The database file does not exist and creating it was not allowed.
    /// Nothing has been touched; fix the configuration.
    #[display("database not found: {}", _0.display())]
    NotFound(#[error(not(source))] PathBuf),
    #[display("database error")]
    Database,
    /// Upgrading the schema failed. The database file has already been
    /// restored to its pre-upgrade state when this is raised.
    #[display("schema upgrade failed")]
    SchemaUpgrade,
    /// The database was written by a newer release; refuse to touch it.
    #[display("database schema version {installed} is newer than supported version {supported}")]
    SchemaTooNew { installed: u32, supported: u32 },
    /// No upgrade script produces the given schema version.
    #[display("no upgrade script for schema version {_0}")]
    MissingUpgrade(#[error(not(source))] u32),
    /// The run's index log could not be closed or moved into place. The
    /// partial file has been removed and the run must be considered failed.
    #[display("could not finalize index log: {}", _0.display())]
    LogFinalization(#[error(not(source))] PathBuf),
    /// A connection was requested while the pool is sized to zero.
    #[display("connection pool is drained")]
    PoolDrained,
    #[display("I/O error")]
    Io,
    #[display("invalid catalog data: {_0}")]
    InvalidData(#[error(not(source))] &'static str),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Database | Self::Io | Self::PoolDrained)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use exn::ResultExt;

    #[test]
    fn error_kind_display() {
        assert_eq!(
            ErrorKind::SchemaTooNew { installed: 9, supported: 4 }.to_string(),
            "database schema version 9 is newer than supported version 4"
        );
        assert_eq!(
            ErrorKind::NotFound(PathBuf::from("/srv/archive/index.sl3")).to_string(),
            "database not found: /srv/archive/index.sl3"
        );
        assert_eq!(ErrorKind::MissingUpgrade(3).to_string(), "no upgrade script for schema version 3");
    }

    #[test]
    fn error_kind_retryable() {
        assert!(ErrorKind::Io.is_retryable());
        assert!(!ErrorKind::SchemaUpgrade.is_retryable());
        assert!(!ErrorKind::LogFinalization(PathBuf::from("x.lst")).is_retryable());
    }

    #[test]
    fn error_wraps_source() {
        let result: std::result::Result<(), std::io::Error> =
            Err(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope"));
        let err: Result<()> = result.or_raise(|| ErrorKind::Io);
        assert!(matches!(&*err.unwrap_err(), ErrorKind::Io));
    }
}
