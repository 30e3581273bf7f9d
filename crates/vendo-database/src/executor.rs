//! Single-writer async executor for the session store.
//!
//! Every mutation to the gateway's state goes through one dedicated SQLite
//! thread reachable only via an internal channel. This keeps write ordering
//! predictable (FIFO) and never blocks the tokio runtime on disk I/O.
//!
//! Only SQL and lightweight row mapping belong inside [`Writer::call`]'s
//! closure — no subprocess calls, no mutex acquisition that could itself
//! block on this same thread, no heavy computation.

use crate::error::from_tokio_rusqlite;
use crate::{migrations, DatabaseResult};
use std::path::Path;
use tokio_rusqlite::Connection;
use tracing::info;

const INIT_PRAGMAS: &str = "
    PRAGMA journal_mode = WAL;
    PRAGMA synchronous = NORMAL;
    PRAGMA foreign_keys = ON;
    PRAGMA busy_timeout = 5000;
";

/// Handle to the dedicated writer thread. Cheap to clone; all clones share
/// the same background thread and channel.
#[derive(Clone)]
pub struct Writer {
    conn: Connection,
    path: String,
}

impl Writer {
    /// Open (creating if absent) the database at `path`, apply pragmas, run
    /// migrations, and spawn the writer thread.
    pub async fn open(path: &Path) -> DatabaseResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let path_str = path.to_string_lossy().to_string();

        let conn = Connection::open(path)
            .await
            .map_err(from_tokio_rusqlite)?;

        conn.call(|conn| {
            conn.execute_batch(INIT_PRAGMAS)?;
            Ok(())
        })
        .await
        .map_err(from_tokio_rusqlite)?;

        conn.call(|conn| {
            migrations::run_migrations(conn)
                .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
            Ok(())
        })
        .await
        .map_err(from_tokio_rusqlite)?;

        info!(path = %path_str, "session store writer ready");
        Ok(Self { conn, path: path_str })
    }

    /// Run a closure against the writer connection, awaiting its result.
    pub async fn call<F, T>(&self, f: F) -> DatabaseResult<T>
    where
        F: FnOnce(&rusqlite::Connection) -> DatabaseResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let outer = self.conn.call(move |conn| Ok(f(conn))).await;
        match outer {
            Ok(inner) => inner,
            Err(e) => Err(from_tokio_rusqlite(e)),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub async fn close(self) -> DatabaseResult<()> {
        self.conn.close().await.map_err(from_tokio_rusqlite)?;
        info!(path = %self.path, "session store writer closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn open_creates_database_and_runs_migrations() {
        let dir = tempdir().unwrap();
        let writer = Writer::open(&dir.path().join("store.sqlite")).await.unwrap();
        let version: i32 = writer
            .call(|conn| {
                Ok(conn.query_row("SELECT COALESCE(MAX(version), 0) FROM migrations", [], |row| {
                    row.get(0)
                })?)
            })
            .await
            .unwrap();
        assert_eq!(version, migrations::CURRENT_VERSION);
    }

    #[tokio::test]
    async fn writes_are_serialized_and_visible() {
        let dir = tempdir().unwrap();
        let writer = Writer::open(&dir.path().join("store.sqlite")).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..10 {
            let writer = writer.clone();
            handles.push(tokio::spawn(async move {
                writer
                    .call(move |conn| {
                        crate::queries::upsert_rate(conn, 10 + i, 5, 256, 256)?;
                        Ok(())
                    })
                    .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }

        let rates = writer.call(|conn| crate::queries::list_rates(conn)).await.unwrap();
        assert_eq!(rates.len(), 10);
    }
}
