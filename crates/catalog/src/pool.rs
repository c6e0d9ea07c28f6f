//! Fixed-size connection pool that can be drained to zero.
//!
//! Draining is the only way to get exclusive access to the database file:
//! [`ConnectionPool::resize`] to zero waits for every checked-out connection
//! to come back, closes them all, and leaves the pool empty until it's
//! resized again. The schema upgrade relies on this to copy and, if needed,
//! restore the whole file.

use crate::error::{ErrorKind, Result};
use exn::{OptionExt, ResultExt};
use sqlx::pool::{PoolConnection, PoolConnectionMetadata};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{Sqlite, SqliteConnection, Transaction};
use std::time::Duration;
use tokio::sync::Mutex;

// Backup workers queue up for a connection rather than fail; the timeout only
// exists to turn a leaked connection into an error instead of a hang.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(60 * 60);

#[derive(Debug)]
struct PoolState {
    pool: Option<SqlitePool>,
    size: u32,
}

#[derive(Debug)]
pub struct ConnectionPool {
    options: SqliteConnectOptions,
    state: Mutex<PoolState>,
}

impl ConnectionPool {
    /// Open a pool of `size` connections. A size of zero creates the pool
    /// drained.
    pub async fn open(options: SqliteConnectOptions, size: u32) -> Result<Self> {
        let pool = match size {
            0 => None,
            n => Some(Self::connect(&options, n).await?),
        };
        Ok(Self {
            options,
            state: Mutex::new(PoolState { pool, size }),
        })
    }

    async fn connect(options: &SqliteConnectOptions, size: u32) -> Result<SqlitePool> {
        SqlitePoolOptions::new()
            // Applies the query-based PRAGMAs to every connection the pool
            // opens, not only the first one.
            .after_connect(|conn, meta| Box::pin(async move { Self::apply_pragmas(conn, meta).await }))
            .max_connections(size)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect_with(options.clone())
            .await
            .or_raise(|| ErrorKind::Database)
    }

    /// Additional PRAGMA settings that aren't exposed via SqliteConnectOptions.
    async fn apply_pragmas(conn: &mut SqliteConnection, _meta: PoolConnectionMetadata) -> sqlx::Result<()> {
        sqlx::query(
            r#"
                PRAGMA locking_mode = NORMAL;
                PRAGMA cache_size = -8192;
                PRAGMA temp_store = MEMORY;
            "#,
        )
        .execute(conn)
        .await?;
        Ok(())
    }

    /// Current capacity; zero while drained.
    pub async fn size(&self) -> u32 {
        self.state.lock().await.size
    }

    /// Check out a connection, waiting while all of them are in use. The
    /// connection goes back to the pool when dropped.
    pub async fn acquire(&self) -> Result<PoolConnection<Sqlite>> {
        let pool = self.handle().await?;
        pool.acquire().await.or_raise(|| ErrorKind::Database)
    }

    /// Check out a connection and start a transaction on it. Rolled back on
    /// drop unless committed.
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        let pool = self.handle().await?;
        pool.begin().await.or_raise(|| ErrorKind::Database)
    }

    async fn handle(&self) -> Result<SqlitePool> {
        self.state.lock().await.pool.clone().ok_or_raise(|| ErrorKind::PoolDrained)
    }

    /// Change the pool's capacity, returning the previous one.
    ///
    /// Every existing connection is closed first, which waits until each
    /// checked-out connection has been returned. Callers must not hold a
    /// connection from this pool while resizing it.
    pub async fn resize(&self, size: u32) -> Result<u32> {
        let mut state = self.state.lock().await;
        let previous = state.size;
        if previous == size && (size == 0) == state.pool.is_none() {
            return Ok(previous);
        }
        if let Some(pool) = state.pool.take() {
            pool.close().await;
        }
        state.size = 0;
        if size > 0 {
            state.pool = Some(Self::connect(&self.options, size).await?);
            state.size = size;
        }
        tracing::debug!(from = previous, to = size, "Resized connection pool");
        Ok(previous)
    }

    /// Drain the pool for good.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        if let Some(pool) = state.pool.take() {
            pool.close().await;
        }
        state.size = 0;
    }
}
