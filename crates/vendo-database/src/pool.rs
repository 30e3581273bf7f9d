//! Pooled read-only connections for the session store.
//!
//! WAL mode lets readers run concurrently with the single [`crate::executor::Writer`]
//! thread without contending for a lock, so `findBy*`/`iterateActive` snapshot
//! queries borrow from this pool directly instead of funneling through the
//! writer's channel.

use crate::error::from_r2d2;
use crate::{migrations, DatabaseResult};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use std::path::Path;
use std::time::Duration;
use tracing::info;

const INIT_PRAGMAS: &str = "
    PRAGMA journal_mode = WAL;
    PRAGMA synchronous = NORMAL;
    PRAGMA foreign_keys = ON;
    PRAGMA busy_timeout = 5000;
    PRAGMA query_only = ON;
";

/// Tunables for the reader pool.
#[derive(Debug, Clone)]
pub struct ReaderPoolConfig {
    pub max_size: u32,
    pub connection_timeout: Duration,
}

impl Default for ReaderPoolConfig {
    fn default() -> Self {
        Self {
            max_size: 4,
            connection_timeout: Duration::from_secs(5),
        }
    }
}

/// A small pool of read-only connections to the session store database.
pub struct ReaderPool {
    pool: Pool<SqliteConnectionManager>,
}

impl ReaderPool {
    /// Open a reader pool against an already-migrated database file.
    pub fn open(path: &Path, config: ReaderPoolConfig) -> DatabaseResult<Self> {
        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.execute_batch(INIT_PRAGMAS)?;
            Ok(())
        });

        let pool = Pool::builder()
            .max_size(config.max_size)
            .connection_timeout(config.connection_timeout)
            .build(manager)
            .map_err(from_r2d2)?;

        // A reader opened before the writer has run migrations would see an
        // empty schema; this is defensive but cheap and idempotent.
        {
            let conn = pool.get().map_err(from_r2d2)?;
            let _ = migrations::run_migrations(&conn);
        }

        info!(max_size = config.max_size, "session store reader pool ready");
        Ok(Self { pool })
    }

    pub fn get(&self) -> DatabaseResult<PooledConnection<SqliteConnectionManager>> {
        self.pool.get().map_err(from_r2d2)
    }
}
