//! Async SQLite executor using a dedicated background thread.
//!
//! Only SQL runs inside [`AsyncDatabase::call`] — quota math is expressed as
//! triggers so it stays inside SQLite, but CMAC verification and
//! broadcast-channel notification fan-out always happen outside the
//! closure, in the caller.

use crate::migrations;
use crate::{from_tokio_rusqlite, StoreError, StoreResult};
use std::path::Path;
use tokio_rusqlite::Connection;
use tracing::info;

#[derive(Clone)]
pub struct AsyncDatabase {
    conn: Connection,
    path: String,
}

impl AsyncDatabase {
    pub async fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Connection(e.to_string()))?;
        }
        let path_str = path.to_string_lossy().to_string();

        info!(path = %path_str, "opening server change store");
        let conn = Connection::open(&path_str).await.map_err(|e| StoreError::Connection(e.to_string()))?;

        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
            )?;
            Ok(())
        })
        .await
        .map_err(from_tokio_rusqlite)?;

        conn.call(|conn| {
            migrations::run_migrations(conn).map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
            Ok(())
        })
        .await
        .map_err(from_tokio_rusqlite)?;

        Ok(Self { conn, path: path_str })
    }

    #[cfg(test)]
    pub async fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory().await.map_err(|e| StoreError::Connection(e.to_string()))?;
        conn.call(|conn| {
            conn.execute_batch("PRAGMA foreign_keys = ON;")?;
            migrations::run_migrations(conn).map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
            Ok(())
        })
        .await
        .map_err(from_tokio_rusqlite)?;
        Ok(Self { conn, path: ":memory:".to_string() })
    }

    /// Run a closure that produces a [`StoreResult`] on the dedicated thread.
    pub async fn call<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&rusqlite::Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let outer = self.conn.call(move |conn| Ok(f(conn))).await;
        match outer {
            Ok(inner) => inner,
            Err(e) => Err(from_tokio_rusqlite(e)),
        }
    }

    /// Run a closure that only produces plain `rusqlite` errors.
    pub async fn call_sqlite<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&rusqlite::Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.conn.call(move |conn| Ok(f(conn)?)).await.map_err(from_tokio_rusqlite)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub async fn close(self) -> StoreResult<()> {
        self.conn.close().await.map_err(|e| StoreError::Connection(format!("{e:?}")))
    }
}
