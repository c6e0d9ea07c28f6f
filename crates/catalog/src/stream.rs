//! Text streams for index logs.
//!
//! Whatever turns a log line into bytes on disk (and back) sits behind
//! [`StreamOpener`]. It is handed the configured [`Password`] and may encrypt,
//! compress or do nothing at all; the catalog only ever sees plain lines.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;
use stowage_config::Password;

pub type BoxSyncRead = Box<dyn Read + Send + 'static>;
pub type BoxSyncWrite = Box<dyn Write + Send + 'static>;

pub trait StreamOpener: Send + Sync {
    /// Create (or truncate) `path` and return a writer into it.
    fn create(&self, path: &Path, password: &Password) -> io::Result<BoxSyncWrite>;

    /// Open `path` for reading back what [`create`](Self::create) wrote.
    fn open(&self, path: &Path, password: &Password) -> io::Result<BoxSyncRead>;
}

/// Pass-through streams; the password is ignored.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainText;

impl StreamOpener for PlainText {
    fn create(&self, path: &Path, _password: &Password) -> io::Result<BoxSyncWrite> {
        Ok(Box::new(File::create(path)?))
    }

    fn open(&self, path: &Path, _password: &Password) -> io::Result<BoxSyncRead> {
        Ok(Box::new(File::open(path)?))
    }
}
