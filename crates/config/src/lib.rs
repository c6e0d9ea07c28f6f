//! Configuration for stowage.
//!
//! Settings are read from a TOML file and then overridden by environment
//! variables prefixed with `STOWAGE_` (e.g. `STOWAGE_POOL_SIZE=8`). Only the
//! settings the catalog needs live here; everything else the backup tool
//! reads is somebody else's problem.

pub mod error;

use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};

/// File name of the index database when no explicit path is configured.
pub const DEFAULT_DATABASE_NAME: &str = "index.sl3";
const DEFAULT_POOL_SIZE: u32 = 4;
const ENV_PREFIX: &str = "STOWAGE_";

/// Secret handed to whatever opens the archive's text streams.
///
/// The catalog never looks inside; it only passes it along. `Debug` output is
/// redacted so it can't end up in logs by accident.
#[derive(Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct Password(String);
impl Password {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}
impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Password(***)")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Top-level directory holding all archived content and run logs.
    pub archive_root_path: PathBuf,
    #[serde(default)]
    database_path: Option<PathBuf>,
    pub password: Password,
    /// Number of pooled database connections shared by backup workers.
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
}

fn default_pool_size() -> u32 {
    DEFAULT_POOL_SIZE
}

impl Config {
    pub fn new(archive_root_path: impl Into<PathBuf>, password: Password) -> Self {
        Self {
            archive_root_path: archive_root_path.into(),
            database_path: None,
            password,
            pool_size: DEFAULT_POOL_SIZE,
        }
    }

    /// Load from a TOML file, with `STOWAGE_*` environment variables taking
    /// precedence. A missing file is not an error as long as the environment
    /// supplies every required value.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let figment = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX));
        Self::from_figment(figment)
    }

    /// Extract and validate from an arbitrary figment.
    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: Self = figment.extract().or_raise(|| ErrorKind::Load)?;
        config.validate()?;
        tracing::debug!(
            archive_root = %config.archive_root_path.display(),
            database = %config.database_path().display(),
            pool_size = config.pool_size,
            "Configuration loaded"
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.archive_root_path.is_absolute() {
            exn::bail!(ErrorKind::Invalid("archive_root_path must be absolute"));
        }
        if self.pool_size == 0 {
            exn::bail!(ErrorKind::Invalid("pool_size must be at least 1"));
        }
        Ok(())
    }

    /// Location of the index database; inside the archive root unless
    /// configured otherwise.
    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| self.archive_root_path.join(DEFAULT_DATABASE_NAME))
    }

    pub fn with_database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.database_path = Some(path.into());
        self
    }

    pub fn with_pool_size(mut self, pool_size: u32) -> Self {
        self.pool_size = pool_size;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("stowage.toml");
        std::fs::write(
            &file,
            "archive_root_path = \"/srv/archive\"\npassword = \"hunter2\"\npool_size = 7\n",
        )
        .unwrap();
        let config = Config::load(&file).unwrap();
        assert_eq!(config.archive_root_path, PathBuf::from("/srv/archive"));
        assert_eq!(config.password.expose(), "hunter2");
        assert_eq!(config.pool_size, 7);
    }

    #[test]
    fn test_database_path_defaults_into_archive_root() {
        let figment = Figment::new().merge(Toml::string("archive_root_path = \"/srv/archive\"\npassword = \"x\""));
        let config = Config::from_figment(figment).unwrap();
        assert_eq!(config.database_path(), PathBuf::from("/srv/archive/index.sl3"));
        assert_eq!(config.pool_size, DEFAULT_POOL_SIZE);
        let config = config.with_database_path("/var/lib/stowage/index.sl3");
        assert_eq!(config.database_path(), PathBuf::from("/var/lib/stowage/index.sl3"));
    }

    #[rstest]
    #[case("archive_root_path = \"relative/archive\"\npassword = \"x\"")]
    #[case("archive_root_path = \"/srv/archive\"\npassword = \"x\"\npool_size = 0")]
    fn test_invalid_values_are_rejected(#[case] toml: &str) {
        let err = Config::from_figment(Figment::new().merge(Toml::string(toml))).unwrap_err();
        assert!(matches!(&*err, ErrorKind::Invalid(_)));
    }

    #[test]
    fn test_missing_required_value() {
        let err = Config::from_figment(Figment::new().merge(Toml::string("password = \"x\""))).unwrap_err();
        assert!(matches!(&*err, ErrorKind::Load));
        let cause = &err.frame().children()[0];
        assert!(cause.error().to_string().contains("archive_root_path"));
    }

    #[test]
    fn test_password_is_redacted() {
        let config = Config::new("/srv/archive", Password::new("correct horse battery staple"));
        let debug = format!("{config:?}");
        assert!(!debug.contains("correct horse"));
        assert!(debug.contains("Password(***)"));
    }
}
