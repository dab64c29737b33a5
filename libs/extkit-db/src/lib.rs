//! Database handle for the extension runtime.
//!
//! The runtime persists three kinds of state: installed module records, the
//! local catalog mirror and the per-module key-value table. All of it lives in
//! a single SQLite database reached through an sqlx pool.
//!
//! Pool behaviour is driven by [`ConnectOpts`] while journal/synchronous/busy
//! settings can be tuned through a whitelist of DSN query parameters
//! (`journal_mode`, `synchronous`, `busy_timeout`, `wal`).
//!
//! # Example
//! ```rust,no_run
//! # async fn demo() -> extkit_db::Result<()> {
//! use extkit_db::{ConnectOpts, DbHandle};
//!
//! let db = DbHandle::connect("sqlite://data/host.db?wal=true", ConnectOpts::default()).await?;
//! sqlx::query("SELECT 1").execute(db.pool()).await?;
//! db.close().await;
//! # Ok(())
//! # }
//! ```

mod sqlite;

use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool, Transaction};
use thiserror::Error;

pub use sqlite::is_memory_dsn;

/// Library-local result type.
pub type Result<T> = std::result::Result<T, DbError>;

/// Typed error for the DB handle and helpers.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("Unknown DSN: {0}")]
    UnknownDsn(String),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Connection options.
#[derive(Clone, Debug)]
pub struct ConnectOpts {
    /// Maximum number of connections in the pool. In-memory databases always use one.
    pub max_conns: Option<u32>,
    /// Timeout to acquire a connection from the pool.
    pub acquire_timeout: Option<Duration>,
    /// Busy timeout applied when the DSN does not carry its own.
    pub busy_timeout: Duration,
    /// For file DSNs, create parent directories if missing.
    pub create_dirs: bool,
}

impl Default for ConnectOpts {
    fn default() -> Self {
        Self {
            max_conns: Some(10),
            acquire_timeout: Some(Duration::from_secs(30)),
            busy_timeout: Duration::from_millis(5000),
            create_dirs: true,
        }
    }
}

/// Main handle.
#[derive(Clone, Debug)]
pub struct DbHandle {
    pool: SqlitePool,
    dsn: String,
}

impl DbHandle {
    /// Connect and build handle.
    pub async fn connect(dsn: &str, opts: ConnectOpts) -> Result<Self> {
        let target = sqlite::SqliteTarget::parse(dsn)?;
        if opts.create_dirs {
            target.ensure_parent_dir()?;
        }

        let mut conn = SqliteConnectOptions::from_str(&target.clean_dsn)?.create_if_missing(true);
        conn = target.pragmas.apply(conn, target.memory, opts.busy_timeout);

        let mut pool = SqlitePoolOptions::new();
        if target.memory {
            // every connection to :memory: is a distinct database; keep exactly one alive
            pool = pool
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        } else if let Some(n) = opts.max_conns {
            pool = pool.max_connections(n);
        }
        if let Some(t) = opts.acquire_timeout {
            pool = pool.acquire_timeout(t);
        }

        let pool = pool.connect_with(conn).await?;
        tracing::debug!(dsn = %target.clean_dsn, memory = target.memory, "database connected");

        Ok(Self {
            pool,
            dsn: target.clean_dsn,
        })
    }

    /// Graceful pool close. (Dropping the pool also closes it; this just makes it explicit.)
    pub async fn close(self) {
        self.pool.close().await
    }

    /// Get the DSN used for this connection (pragma parameters stripped).
    pub fn dsn(&self) -> &str {
        &self.dsn
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Run `f` inside a transaction: commit on `Ok`, roll back on `Err`.
    pub async fn with_tx<F, T, E>(&self, f: F) -> std::result::Result<T, E>
    where
        F: for<'c> FnOnce(
            &'c mut Transaction<'static, Sqlite>,
        ) -> std::pin::Pin<Box<dyn Future<Output = std::result::Result<T, E>> + Send + 'c>>,
        E: From<sqlx::Error>,
    {
        let mut tx = self.pool.begin().await?;
        match f(&mut tx).await {
            Ok(v) => {
                tx.commit().await?;
                Ok(v)
            }
            Err(e) => {
                // Best-effort rollback; keep the original error.
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }
}
