//! Fill in the archive columns added by the version 3 upgrade.

use crate::archive::scan_tree;
use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use sqlx::{Connection, SqliteConnection};
use std::path::Path;
use tracing::instrument;

/// Record where each checksum and each run's log actually live in the
/// archive. Checksums and runs not found in the tree keep `NULL`.
#[instrument(skip(conn))]
pub(crate) async fn archive_columns(conn: &mut SqliteConnection, archive_root: &Path) -> Result<()> {
    let root = archive_root.to_path_buf();
    let tree = tokio::task::spawn_blocking(move || scan_tree(&root))
        .await
        .or_raise(|| ErrorKind::Io)??;

    let mut tx = conn.begin().await.or_raise(|| ErrorKind::Database)?;
    let mut locations = 0;
    for item in &tree.content {
        locations += sqlx::query("UPDATE location SET archive_dir = ?, is_compressed = ? WHERE checksum = ?")
            .bind(item.archive_dir.as_str())
            .bind(item.is_compressed)
            .bind(item.checksum.as_str())
            .execute(&mut *tx)
            .await
            .or_raise(|| ErrorKind::Database)?
            .rows_affected();
    }
    let mut runs = 0;
    for log in &tree.logs {
        runs += sqlx::query("UPDATE run SET archive_dir = ? WHERE run_name = ?")
            .bind(log.archive_dir.as_str())
            .bind(log.run_name.as_str())
            .execute(&mut *tx)
            .await
            .or_raise(|| ErrorKind::Database)?
            .rows_affected();
    }
    tx.commit().await.or_raise(|| ErrorKind::Database)?;
    tracing::info!(locations, runs, "Backfilled archive columns");
    Ok(())
}
