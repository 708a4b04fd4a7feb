//! The watcher's public surface: register tables, decide and apply incoming
//! changes, and pull the next outgoing change for upload. Mirrors the shape
//! of `DatabaseWatcher::{shouldStore,storeData,loadData,markUnchanged}` in
//! the original, minus the QVariant key encoding (`rusqlite::types::Value`
//! already carries a real type) and plus the hash tie-break (see
//! `hashing.rs`).

use crate::change_state::ChangeState;
use crate::config::{TableConfig, TableReference};
use crate::error::{WatcherError, WatcherResult};
use crate::executor::AsyncDatabase;
use crate::hashing;
use crate::identifier::{self, quote};
use crate::notify::ChangeNotifier;
use crate::resync::ResyncMode;
use crate::schema;
use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::OptionalExtension;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

/// One row pulled from the server, ready to be judged and possibly applied.
#[derive(Debug, Clone)]
pub struct IncomingChange {
    pub key: Value,
    pub modified: DateTime<Utc>,
    pub uploaded: Option<DateTime<Utc>>,
    pub data: Option<HashMap<String, Value>>,
}

/// One locally-changed row, ready to be encrypted and uploaded.
#[derive(Debug, Clone)]
pub struct OutgoingChange {
    pub key: Value,
    pub modified: DateTime<Utc>,
    pub data: Option<HashMap<String, Value>>,
}

#[derive(Clone)]
struct ResolvedTable {
    config: TableConfig,
    pkey: String,
}

pub struct Watcher {
    db: AsyncDatabase,
    tables: Arc<RwLock<HashMap<String, ResolvedTable>>>,
}

impl Watcher {
    pub async fn open(path: &Path, notifier: ChangeNotifier) -> WatcherResult<Self> {
        let db = AsyncDatabase::open(path, notifier).await?;
        Self::from_db(db).await
    }

    #[cfg(test)]
    pub async fn open_in_memory(notifier: ChangeNotifier) -> WatcherResult<Self> {
        let db = AsyncDatabase::open_in_memory(notifier).await?;
        Self::from_db(db).await
    }

    async fn from_db(db: AsyncDatabase) -> WatcherResult<Self> {
        let loaded = db.call(load_registered_tables).await?;
        Ok(Self { db, tables: Arc::new(RwLock::new(loaded)) })
    }

    pub fn notifier(&self) -> &ChangeNotifier {
        self.db.notifier()
    }

    /// Idempotent: re-registering an already-installed table just refreshes
    /// the in-memory field/reference whitelist, it never re-runs the
    /// shadow-table DDL.
    pub async fn add_table(&self, config: TableConfig) -> WatcherResult<()> {
        let table_name = config.table.clone();
        let config_for_install = config.clone();
        let pkey = self.db.call(move |conn| schema::install_table(conn, &config_for_install)).await?;
        self.tables.write().await.insert(table_name, ResolvedTable { config, pkey });
        Ok(())
    }

    pub async fn should_store(
        &self,
        table: &str,
        key: Value,
        remote_modified: DateTime<Utc>,
        remote_uploaded: Option<DateTime<Utc>>,
        remote_data: Option<HashMap<String, Value>>,
    ) -> WatcherResult<bool> {
        let resolved = self.resolved(table).await?;
        let table_owned = table.to_string();
        self.db
            .call(move |conn| {
                should_store_impl(
                    conn,
                    &table_owned,
                    &resolved.pkey,
                    &resolved.config.fields,
                    &key,
                    remote_modified,
                    remote_uploaded,
                    &remote_data,
                )
            })
            .await
    }

    pub async fn store_data(&self, table: &str, change: IncomingChange) -> WatcherResult<()> {
        let resolved = self.resolved(table).await?;
        let table_owned = table.to_string();
        self.db
            .call(move |conn| {
                store_data_impl(
                    conn,
                    &table_owned,
                    &resolved.pkey,
                    &resolved.config.fields,
                    &resolved.config.references,
                    &change.key,
                    change.modified,
                    change.uploaded,
                    &change.data,
                )
            })
            .await
    }

    pub async fn load_data(&self, table: &str) -> WatcherResult<Option<OutgoingChange>> {
        let resolved = self.resolved(table).await?;
        let table_owned = table.to_string();
        self.db
            .call(move |conn| load_data_impl(conn, &table_owned, &resolved.pkey, &resolved.config.fields))
            .await
    }

    pub async fn mark_unchanged(&self, table: &str, key: Value, modified: DateTime<Utc>) -> WatcherResult<()> {
        let table_owned = table.to_string();
        self.db
            .call(move |conn| mark_state_if_unmodified(conn, &table_owned, &key, modified, ChangeState::Unchanged))
            .await
    }

    pub async fn mark_corrupted(&self, table: &str, key: Value, modified: DateTime<Utc>) -> WatcherResult<()> {
        let table_owned = table.to_string();
        self.db
            .call(move |conn| mark_state_if_unmodified(conn, &table_owned, &key, modified, ChangeState::Corrupted))
            .await
    }

    /// Returns `true` when `mode` includes `CLEAR_SERVER_DATA` — the caller
    /// (the table state machine) owns sending the `remove-table` request,
    /// the watcher only reports that one was asked for.
    pub async fn resync_table(&self, table: &str, mode: ResyncMode) -> WatcherResult<bool> {
        let resolved = self.resolved(table).await?;
        let table_owned = table.to_string();
        self.db.call(move |conn| resync_table_impl(conn, &table_owned, &resolved.pkey, mode)).await
    }

    pub async fn last_sync(&self, table: &str) -> WatcherResult<Option<DateTime<Utc>>> {
        let table_owned = table.to_string();
        self.db
            .call(move |conn| {
                let raw: Option<String> = conn
                    .query_row("SELECT last_sync FROM sync_tables WHERE table_name = ?1", [&table_owned], |row| {
                        row.get(0)
                    })
                    .optional()?;
                raw.map(|s| parse_timestamp(&s)).transpose()
            })
            .await
    }

    async fn resolved(&self, table: &str) -> WatcherResult<ResolvedTable> {
        self.tables.read().await.get(table).cloned().ok_or_else(|| WatcherError::UnknownTable(table.to_string()))
    }
}

fn load_registered_tables(conn: &rusqlite::Connection) -> WatcherResult<HashMap<String, ResolvedTable>> {
    let mut tables = Vec::new();
    {
        let mut stmt = conn.prepare("SELECT table_name, pkey_name FROM sync_tables")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            tables.push((row.get::<_, String>(0)?, row.get::<_, String>(1)?));
        }
    }

    let mut resolved = HashMap::with_capacity(tables.len());
    for (table, pkey) in tables {
        let fields = {
            let mut stmt = conn.prepare("SELECT field_name FROM sync_fields WHERE table_name = ?1")?;
            let mut rows = stmt.query([&table])?;
            let mut fields = Vec::new();
            while let Some(row) = rows.next()? {
                fields.push(row.get::<_, String>(0)?);
            }
            fields
        };

        let references = {
            let mut stmt = conn.prepare("SELECT fkey_table, fkey_field FROM sync_references WHERE table_name = ?1")?;
            let mut rows = stmt.query([&table])?;
            let mut references = Vec::new();
            while let Some(row) = rows.next()? {
                references.push(TableReference { fkey_table: row.get(0)?, fkey_field: row.get(1)? });
            }
            references
        };

        let config = TableConfig { table: table.clone(), primary_key: Some(pkey.clone()), fields, references };
        resolved.insert(table, ResolvedTable { config, pkey });
    }
    Ok(resolved)
}

#[allow(clippy::too_many_arguments)]
fn should_store_impl(
    conn: &rusqlite::Connection,
    table: &str,
    pkey_col: &str,
    fields: &[String],
    key: &Value,
    remote_modified: DateTime<Utc>,
    remote_uploaded: Option<DateTime<Utc>>,
    remote_data: &Option<HashMap<String, Value>>,
) -> WatcherResult<bool> {
    let shadow = identifier::shadow_table(table);
    let local_tstamp: Option<String> = conn
        .query_row(&format!("SELECT tstamp FROM {} WHERE pkey = ?1", quote(&shadow)), [key], |row| row.get(0))
        .optional()?;

    let Some(local_tstamp) = local_tstamp else {
        return Ok(true);
    };
    let local_modified = parse_timestamp(&local_tstamp)?;

    if local_modified > remote_modified {
        if let Some(uploaded) = remote_uploaded {
            advance_last_sync(conn, table, uploaded)?;
        }
        return Ok(false);
    }
    if local_modified < remote_modified {
        return Ok(true);
    }

    let local_row = load_user_row(conn, table, pkey_col, fields, key)?;
    Ok(hashing::hash_payload(remote_data) > hashing::hash_payload(&local_row))
}

#[allow(clippy::too_many_arguments)]
fn store_data_impl(
    conn: &rusqlite::Connection,
    table: &str,
    pkey_col: &str,
    fields: &[String],
    references: &[TableReference],
    key: &Value,
    modified: DateTime<Utc>,
    uploaded: Option<DateTime<Utc>>,
    data: &Option<HashMap<String, Value>>,
) -> WatcherResult<()> {
    if !should_store_impl(conn, table, pkey_col, fields, key, modified, uploaded, data)? {
        return Ok(());
    }

    match data {
        Some(row) => {
            for reference in references {
                ensure_parent_row(conn, reference, key)?;
            }
            upsert_user_row(conn, table, pkey_col, fields, row)?;
        }
        None => {
            conn.execute(&format!("DELETE FROM {} WHERE {} = ?1", quote(table), quote(pkey_col)), [key])?;
        }
    }

    let shadow = identifier::shadow_table(table);
    conn.execute(
        &format!("UPDATE {} SET changed = ?1, tstamp = ?2 WHERE pkey = ?3", quote(&shadow)),
        rusqlite::params![ChangeState::Unchanged.as_i64(), format_timestamp(modified), key],
    )?;

    if let Some(uploaded) = uploaded {
        advance_last_sync(conn, table, uploaded)?;
    }

    Ok(())
}

fn ensure_parent_row(conn: &rusqlite::Connection, reference: &TableReference, key: &Value) -> WatcherResult<()> {
    let parent_shadow = identifier::shadow_table(&reference.fkey_table);

    let prior_state: Option<(String, i64)> = conn
        .query_row(
            &format!("SELECT tstamp, changed FROM {} WHERE pkey = ?1", quote(&parent_shadow)),
            [key],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    let affected = conn.execute(
        &format!(
            "INSERT OR IGNORE INTO {} ({}) VALUES (?1)",
            quote(&reference.fkey_table),
            quote(&reference.fkey_field)
        ),
        [key],
    )?;

    if affected != 0 {
        match prior_state {
            Some((tstamp, changed)) => {
                conn.execute(
                    &format!("UPDATE {} SET tstamp = ?1, changed = ?2 WHERE pkey = ?3", quote(&parent_shadow)),
                    rusqlite::params![tstamp, changed, key],
                )?;
            }
            None => {
                // The insert trigger just created a shadow row for the stub
                // parent; track it as a clean baseline instead of erasing it,
                // or the parent's real data can never get a shadow row later.
                conn.execute(
                    &format!("UPDATE {} SET tstamp = ?1, changed = ?2 WHERE pkey = ?3", quote(&parent_shadow)),
                    rusqlite::params![format_timestamp(Utc::now()), ChangeState::Unchanged.as_i64(), key],
                )?;
            }
        }
    }
    Ok(())
}

fn upsert_user_row(
    conn: &rusqlite::Connection,
    table: &str,
    pkey_col: &str,
    fields: &[String],
    row: &HashMap<String, Value>,
) -> WatcherResult<()> {
    let keys: Vec<&String> =
        if fields.is_empty() { row.keys().collect() } else { fields.iter().filter(|f| row.contains_key(*f)).collect() };
    if keys.is_empty() {
        return Ok(());
    }

    let columns: Vec<String> = keys.iter().map(|k| quote(k)).collect();
    let placeholders: Vec<String> = (1..=keys.len()).map(|i| format!("?{i}")).collect();
    let updates: Vec<String> = columns.iter().map(|c| format!("{c} = excluded.{c}")).collect();

    let sql = format!(
        "INSERT INTO {table} ({cols}) VALUES ({vals}) ON CONFLICT({pkey}) DO UPDATE SET {updates};",
        table = quote(table),
        cols = columns.join(", "),
        vals = placeholders.join(", "),
        pkey = quote(pkey_col),
        updates = updates.join(", "),
    );

    let params: Vec<&Value> = keys.iter().map(|k| &row[*k]).collect();
    conn.execute(&sql, rusqlite::params_from_iter(params))?;
    Ok(())
}

fn load_user_row(
    conn: &rusqlite::Connection,
    table: &str,
    pkey_col: &str,
    fields: &[String],
    key: &Value,
) -> WatcherResult<Option<HashMap<String, Value>>> {
    let columns = if fields.is_empty() { "*".to_string() } else { fields.iter().map(|f| quote(f)).collect::<Vec<_>>().join(", ") };
    let sql = format!("SELECT {columns} FROM {} WHERE {} = ?1", quote(table), quote(pkey_col));

    let mut stmt = conn.prepare(&sql)?;
    let column_names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
    let mut rows = stmt.query([key])?;

    if let Some(row) = rows.next()? {
        let mut map = HashMap::with_capacity(column_names.len());
        for (i, name) in column_names.iter().enumerate() {
            map.insert(name.clone(), row.get::<_, Value>(i)?);
        }
        Ok(Some(map))
    } else {
        Ok(None)
    }
}

fn load_data_impl(
    conn: &rusqlite::Connection,
    table: &str,
    pkey_col: &str,
    fields: &[String],
) -> WatcherResult<Option<OutgoingChange>> {
    let shadow = identifier::shadow_table(table);
    let data_columns = if fields.is_empty() {
        "dataTable.*".to_string()
    } else {
        fields.iter().map(|f| format!("dataTable.{}", quote(f))).collect::<Vec<_>>().join(", ")
    };

    let sql = format!(
        "SELECT syncTable.pkey, syncTable.tstamp, {data_columns} \
         FROM {shadow_q} AS syncTable \
         LEFT JOIN {table_q} AS dataTable ON syncTable.pkey = dataTable.{pkey_q} \
         WHERE syncTable.changed = ?1 \
         ORDER BY syncTable.tstamp ASC \
         LIMIT 1",
        shadow_q = quote(&shadow),
        table_q = quote(table),
        pkey_q = quote(pkey_col),
    );

    let mut stmt = conn.prepare(&sql)?;
    let column_names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
    let mut rows = stmt.query(rusqlite::params![ChangeState::Changed.as_i64()])?;

    let Some(row) = rows.next()? else {
        return Ok(None);
    };

    let key: Value = row.get(0)?;
    let tstamp: String = row.get(1)?;
    let modified = parse_timestamp(&tstamp)?;

    let first_data_value: Value = row.get(2)?;
    let data = if matches!(first_data_value, Value::Null) {
        None
    } else {
        let mut map = HashMap::with_capacity(column_names.len().saturating_sub(2));
        for (i, name) in column_names.iter().enumerate().skip(2) {
            map.insert(name.clone(), row.get::<_, Value>(i)?);
        }
        Some(map)
    };

    Ok(Some(OutgoingChange { key, modified, data }))
}

fn mark_state_if_unmodified(
    conn: &rusqlite::Connection,
    table: &str,
    key: &Value,
    modified: DateTime<Utc>,
    state: ChangeState,
) -> WatcherResult<()> {
    let shadow = identifier::shadow_table(table);
    let current: Option<String> = conn
        .query_row(&format!("SELECT tstamp FROM {} WHERE pkey = ?1", quote(&shadow)), [key], |row| row.get(0))
        .optional()?;

    let Some(current) = current else {
        return Ok(());
    };
    if current != format_timestamp(modified) {
        return Ok(());
    }

    conn.execute(
        &format!("UPDATE {} SET changed = ?1 WHERE pkey = ?2", quote(&shadow)),
        rusqlite::params![state.as_i64(), key],
    )?;
    Ok(())
}

fn resync_table_impl(conn: &rusqlite::Connection, table: &str, pkey_col: &str, mode: ResyncMode) -> WatcherResult<bool> {
    let shadow = identifier::shadow_table(table);

    if mode.contains(ResyncMode::CLEAR_LOCAL_DATA) {
        conn.execute(&format!("DELETE FROM {}", quote(&shadow)), [])?;
        conn.execute(&format!("DELETE FROM {}", quote(table)), [])?;
    } else if mode.contains(ResyncMode::CLEAN_LOCAL_DATA) {
        conn.execute(&format!("DELETE FROM {}", quote(&shadow)), [])?;
        schema::inflate_all(conn, table, &shadow, pkey_col)?;
    } else if mode.contains(ResyncMode::CHECK_LOCAL_DATA) {
        schema::inflate_missing(conn, table, &shadow, pkey_col)?;
    }

    if mode.contains(ResyncMode::UPLOAD) {
        conn.execute(
            &format!("UPDATE {} SET changed = ?1", quote(&shadow)),
            [ChangeState::Changed.as_i64()],
        )?;
    }

    if mode.contains(ResyncMode::DOWNLOAD) {
        conn.execute("UPDATE sync_tables SET last_sync = NULL WHERE table_name = ?1", [table])?;
    }

    Ok(mode.contains(ResyncMode::CLEAR_SERVER_DATA))
}

fn advance_last_sync(conn: &rusqlite::Connection, table: &str, uploaded: DateTime<Utc>) -> WatcherResult<()> {
    conn.execute(
        "UPDATE sync_tables SET last_sync = ?1 WHERE table_name = ?2",
        rusqlite::params![format_timestamp(uploaded), table],
    )?;
    Ok(())
}

fn format_timestamp(value: DateTime<Utc>) -> String {
    value.format(TIMESTAMP_FORMAT).to_string()
}

fn parse_timestamp(value: &str) -> WatcherResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value).map(|dt| dt.with_timezone(&Utc)).map_err(|_| WatcherError::InvalidTimestamp(value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TableConfig;

    async fn test_watcher() -> Watcher {
        Watcher::open_in_memory(ChangeNotifier::new()).await.unwrap()
    }

    async fn create_contacts_table(watcher: &Watcher) {
        watcher
            .db
            .call(|conn| {
                conn.execute_batch("CREATE TABLE contacts (id INTEGER PRIMARY KEY, name TEXT NOT NULL, age INTEGER);")?;
                Ok(())
            })
            .await
            .unwrap();
        watcher.add_table(TableConfig::new("contacts").fields(["id", "name", "age"])).await.unwrap();
    }

    #[tokio::test]
    async fn add_table_inflates_existing_rows_as_changed() {
        let watcher = test_watcher().await;
        watcher
            .db
            .call(|conn| {
                conn.execute_batch(
                    "CREATE TABLE contacts (id INTEGER PRIMARY KEY, name TEXT NOT NULL, age INTEGER);
                     INSERT INTO contacts (id, name, age) VALUES (1, 'Ada', 30);",
                )?;
                Ok(())
            })
            .await
            .unwrap();
        watcher.add_table(TableConfig::new("contacts").fields(["id", "name", "age"])).await.unwrap();

        let loaded = watcher.load_data("contacts").await.unwrap().expect("inflated row should be queued");
        assert_eq!(loaded.key, Value::Integer(1));
        assert!(loaded.data.is_some());
    }

    #[tokio::test]
    async fn stub_parent_row_from_a_reference_gets_a_shadow_row() {
        let watcher = test_watcher().await;
        watcher
            .db
            .call(|conn| {
                conn.execute_batch(
                    "CREATE TABLE folders (id INTEGER PRIMARY KEY, name TEXT);
                     CREATE TABLE notes (id INTEGER PRIMARY KEY, folder_id INTEGER, body TEXT);",
                )?;
                Ok(())
            })
            .await
            .unwrap();
        watcher.add_table(TableConfig::new("folders").fields(["id", "name"])).await.unwrap();
        watcher
            .add_table(TableConfig::new("notes").fields(["id", "folder_id", "body"]).reference("folders", "id"))
            .await
            .unwrap();

        let mut row = HashMap::new();
        row.insert("id".to_string(), Value::Integer(1));
        row.insert("folder_id".to_string(), Value::Integer(42));
        row.insert("body".to_string(), Value::Text("hello".to_string()));

        watcher
            .store_data(
                "notes",
                IncomingChange { key: Value::Integer(1), modified: Utc::now(), uploaded: None, data: Some(row) },
            )
            .await
            .unwrap();

        let shadow_state: (String, i64) = watcher
            .db
            .call(|conn| {
                Ok(conn.query_row(
                    "SELECT tstamp, changed FROM __sync_folders WHERE pkey = ?1",
                    rusqlite::params![42],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )?)
            })
            .await
            .unwrap();
        assert_eq!(shadow_state.1, ChangeState::Unchanged.as_i64());
    }

    #[tokio::test]
    async fn store_data_applies_newer_remote_and_marks_unchanged() {
        let watcher = test_watcher().await;
        create_contacts_table(&watcher).await;

        let mut row = HashMap::new();
        row.insert("id".to_string(), Value::Integer(1));
        row.insert("name".to_string(), Value::Text("Ada".to_string()));
        row.insert("age".to_string(), Value::Integer(30));

        let modified = Utc::now();
        watcher
            .store_data(
                "contacts",
                IncomingChange { key: Value::Integer(1), modified, uploaded: Some(modified), data: Some(row) },
            )
            .await
            .unwrap();

        assert_eq!(watcher.load_data("contacts").await.unwrap().map(|c| c.key), None);
        assert!(watcher.last_sync("contacts").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn should_store_rejects_older_remote_but_still_advances_last_sync() {
        let watcher = test_watcher().await;
        create_contacts_table(&watcher).await;

        let now = Utc::now();
        let older = now - chrono::Duration::seconds(60);

        let mut row = HashMap::new();
        row.insert("id".to_string(), Value::Integer(1));
        row.insert("name".to_string(), Value::Text("Ada".to_string()));
        row.insert("age".to_string(), Value::Integer(30));
        watcher
            .store_data("contacts", IncomingChange { key: Value::Integer(1), modified: now, uploaded: Some(now), data: Some(row) })
            .await
            .unwrap();

        let should = watcher
            .should_store("contacts", Value::Integer(1), older, Some(older), None)
            .await
            .unwrap();
        assert!(!should);
    }

    #[tokio::test]
    async fn mark_unchanged_is_a_noop_if_row_was_re_edited() {
        let watcher = test_watcher().await;
        create_contacts_table(&watcher).await;

        watcher
            .db
            .call(|conn| {
                conn.execute("INSERT INTO contacts (id, name, age) VALUES (1, 'Ada', 30)", [])?;
                Ok(())
            })
            .await
            .unwrap();

        let stale_modified = Utc::now() - chrono::Duration::seconds(5);
        watcher.mark_unchanged("contacts", Value::Integer(1), stale_modified).await.unwrap();

        let pending = watcher.load_data("contacts").await.unwrap();
        assert!(pending.is_some(), "row edited after upload should remain changed");
    }
}
