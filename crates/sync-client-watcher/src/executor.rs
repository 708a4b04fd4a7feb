//! Async SQLite executor using a dedicated background thread, mirroring
//! `sync-server-store::executor::AsyncDatabase` (same single-writer-thread
//! discipline, same `call`/`call_sqlite` split) but with an `update_hook`
//! wired up at open time for shadow-table wake-ups (see `notify.rs`).

use crate::error::{from_tokio_rusqlite, WatcherError, WatcherResult};
use crate::identifier;
use crate::notify::ChangeNotifier;
use crate::schema;
use rusqlite::hooks::Action;
use std::path::Path;
use tokio_rusqlite::Connection;
use tracing::info;

#[derive(Clone)]
pub struct AsyncDatabase {
    conn: Connection,
    path: String,
    notifier: ChangeNotifier,
}

impl AsyncDatabase {
    pub async fn open(path: &Path, notifier: ChangeNotifier) -> WatcherResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| WatcherError::Connection(e.to_string()))?;
        }
        let path_str = path.to_string_lossy().to_string();

        info!(path = %path_str, "opening client watcher database");
        let conn = Connection::open(&path_str).await.map_err(|e| WatcherError::Connection(e.to_string()))?;
        Self::init(conn, path_str, notifier).await
    }

    #[cfg(test)]
    pub async fn open_in_memory(notifier: ChangeNotifier) -> WatcherResult<Self> {
        let conn = Connection::open_in_memory().await.map_err(|e| WatcherError::Connection(e.to_string()))?;
        Self::init(conn, ":memory:".to_string(), notifier).await
    }

    async fn init(conn: Connection, path_str: String, notifier: ChangeNotifier) -> WatcherResult<Self> {
        conn.call(|conn| {
            conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")?;
            Ok(())
        })
        .await
        .map_err(from_tokio_rusqlite)?;

        conn.call(|conn| {
            schema::run_meta_migrations(conn).map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
            Ok(())
        })
        .await
        .map_err(from_tokio_rusqlite)?;

        let hook_notifier = notifier.clone();
        conn.call(move |conn| {
            conn.update_hook(Some(move |_action: Action, _db: &str, table: &str, _rowid: i64| {
                if let Some(table) = identifier::strip_shadow_prefix(table) {
                    hook_notifier.notify(table.to_string());
                }
            }));
            Ok(())
        })
        .await
        .map_err(from_tokio_rusqlite)?;

        Ok(Self { conn, path: path_str, notifier })
    }

    pub async fn call<F, T>(&self, f: F) -> WatcherResult<T>
    where
        F: FnOnce(&rusqlite::Connection) -> WatcherResult<T> + Send + 'static,
        T: Send + 'static,
    {
        match self.conn.call(move |conn| Ok(f(conn))).await {
            Ok(inner) => inner,
            Err(e) => Err(from_tokio_rusqlite(e)),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn notifier(&self) -> &ChangeNotifier {
        &self.notifier
    }
}
