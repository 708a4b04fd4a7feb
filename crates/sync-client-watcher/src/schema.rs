//! Static meta-table migrations plus the per-table shadow schema installer.
//!
//! The three meta tables are fixed and versioned like any other migration
//! (`sync-server-store::migrations` convention); the shadow table, its
//! index, and its four triggers are built per caller-supplied table name at
//! `add_table` time instead, since the set of watched tables isn't known
//! until the embedding application registers them.

use crate::change_state::ChangeState;
use crate::config::TableConfig;
use crate::error::{WatcherError, WatcherResult};
use crate::identifier::{self, quote, validate};
use rusqlite::Connection;
use tracing::{debug, info};

pub const META_MIGRATION_VERSION: i32 = 1;

pub fn run_meta_migrations(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS watcher_migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    let current: i32 =
        conn.query_row("SELECT COALESCE(MAX(version), 0) FROM watcher_migrations", [], |row| row.get(0)).unwrap_or(0);
    info!(current_version = current, target_version = META_MIGRATION_VERSION, "running watcher meta migrations");

    if current < 1 {
        conn.execute_batch(
            "CREATE TABLE sync_tables (
                table_name TEXT PRIMARY KEY,
                pkey_name TEXT NOT NULL,
                last_sync TEXT
            );

            CREATE TABLE sync_fields (
                table_name TEXT NOT NULL REFERENCES sync_tables(table_name) ON DELETE CASCADE,
                field_name TEXT NOT NULL,
                PRIMARY KEY(table_name, field_name)
            );

            CREATE TABLE sync_references (
                table_name TEXT NOT NULL REFERENCES sync_tables(table_name) ON DELETE CASCADE,
                fkey_table TEXT NOT NULL,
                fkey_field TEXT NOT NULL,
                PRIMARY KEY(table_name, fkey_table, fkey_field)
            );",
        )?;
        conn.execute(
            "INSERT INTO watcher_migrations (version, name) VALUES (1, 'meta_tables')",
            [],
        )?;
    }

    Ok(())
}

/// Resolve the single-column primary key for `table`, rejecting composite
/// keys, when the caller hasn't named one explicitly.
pub fn resolve_primary_key(conn: &Connection, table: &str) -> WatcherResult<String> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote(table)))?;
    let mut pk_columns = stmt
        .query_map([], |row| {
            let name: String = row.get(1)?;
            let pk_order: i64 = row.get(5)?;
            Ok((name, pk_order))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    pk_columns.retain(|(_, order)| *order > 0);
    pk_columns.sort_by_key(|(_, order)| *order);

    match pk_columns.len() {
        1 => Ok(pk_columns.remove(0).0),
        _ => Err(WatcherError::CompositePrimaryKey(table.to_string())),
    }
}

/// Idempotently install everything `add_table` needs for one table: meta
/// rows, the shadow table + index + triggers, and the initial inflate pass.
/// Returns the resolved primary key column name.
pub fn install_table(conn: &Connection, config: &TableConfig) -> WatcherResult<String> {
    validate(&config.table)?;
    if let Some(pk) = &config.primary_key {
        validate(pk)?;
    }
    for field in &config.fields {
        validate(field)?;
    }
    for reference in &config.references {
        validate(&reference.fkey_table)?;
        validate(&reference.fkey_field)?;
    }

    let pkey = match &config.primary_key {
        Some(pk) => pk.clone(),
        None => resolve_primary_key(conn, &config.table)?,
    };

    upsert_meta_rows(conn, config, &pkey)?;

    let shadow = identifier::shadow_table(&config.table);
    let already_installed: bool = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [&shadow],
            |row| row.get::<_, i64>(0),
        )
        .map(|count| count > 0)?;

    if already_installed {
        debug!(table = %config.table, "shadow table already installed");
        return Ok(pkey);
    }

    create_shadow_table(conn, &config.table, &shadow)?;
    create_triggers(conn, &config.table, &shadow, &pkey)?;
    inflate_all(conn, &config.table, &shadow, &pkey)?;
    info!(table = %config.table, "installed sync shadow schema");

    Ok(pkey)
}

fn upsert_meta_rows(conn: &Connection, config: &TableConfig, pkey: &str) -> WatcherResult<()> {
    conn.execute(
        "INSERT INTO sync_tables (table_name, pkey_name, last_sync) VALUES (?1, ?2, NULL)
         ON CONFLICT(table_name) DO UPDATE SET pkey_name = excluded.pkey_name",
        rusqlite::params![config.table, pkey],
    )?;

    conn.execute("DELETE FROM sync_fields WHERE table_name = ?1", [&config.table])?;
    for field in &config.fields {
        conn.execute(
            "INSERT OR IGNORE INTO sync_fields (table_name, field_name) VALUES (?1, ?2)",
            rusqlite::params![config.table, field],
        )?;
    }

    conn.execute("DELETE FROM sync_references WHERE table_name = ?1", [&config.table])?;
    for reference in &config.references {
        conn.execute(
            "INSERT OR IGNORE INTO sync_references (table_name, fkey_table, fkey_field) VALUES (?1, ?2, ?3)",
            rusqlite::params![config.table, reference.fkey_table, reference.fkey_field],
        )?;
    }
    Ok(())
}

fn create_shadow_table(conn: &Connection, table: &str, shadow: &str) -> WatcherResult<()> {
    let escaped_shadow = quote(shadow);
    conn.execute(
        &format!(
            "CREATE TABLE {escaped_shadow} (
                pkey NOT NULL PRIMARY KEY,
                tstamp TEXT NOT NULL,
                changed INTEGER NOT NULL CHECK(changed >= 0 AND changed <= 2)
            );"
        ),
        [],
    )?;

    let index = quote(&identifier::changed_index(table));
    conn.execute(&format!("CREATE INDEX {index} ON {escaped_shadow} (changed ASC);"), [])?;
    Ok(())
}

fn create_triggers(conn: &Connection, table: &str, shadow: &str, pkey: &str) -> WatcherResult<()> {
    let escaped_table = quote(table);
    let escaped_shadow = quote(shadow);
    let escaped_pkey = quote(pkey);
    let changed = ChangeState::Changed.as_i64();

    conn.execute(
        &format!(
            "CREATE TRIGGER {} AFTER INSERT ON {escaped_table} FOR EACH ROW BEGIN
                INSERT OR REPLACE INTO {escaped_shadow} (pkey, tstamp, changed)
                VALUES(NEW.{escaped_pkey}, strftime('%Y-%m-%dT%H:%M:%fZ', 'now'), {changed});
            END;",
            quote(&identifier::insert_trigger(table))
        ),
        [],
    )?;

    conn.execute(
        &format!(
            "CREATE TRIGGER {} AFTER UPDATE ON {escaped_table} FOR EACH ROW
            WHEN NEW.{escaped_pkey} == OLD.{escaped_pkey} BEGIN
                UPDATE {escaped_shadow} SET tstamp = strftime('%Y-%m-%dT%H:%M:%fZ', 'now'), changed = {changed}
                WHERE pkey = NEW.{escaped_pkey};
            END;",
            quote(&identifier::update_trigger(table))
        ),
        [],
    )?;

    conn.execute(
        &format!(
            "CREATE TRIGGER {} AFTER UPDATE ON {escaped_table} FOR EACH ROW
            WHEN NEW.{escaped_pkey} != OLD.{escaped_pkey} BEGIN
                UPDATE {escaped_shadow} SET tstamp = strftime('%Y-%m-%dT%H:%M:%fZ', 'now'), changed = {changed}
                WHERE pkey = OLD.{escaped_pkey};
                INSERT OR REPLACE INTO {escaped_shadow} (pkey, tstamp, changed)
                VALUES(NEW.{escaped_pkey}, strftime('%Y-%m-%dT%H:%M:%fZ', 'now'), {changed});
            END;",
            quote(&identifier::rename_trigger(table))
        ),
        [],
    )?;

    conn.execute(
        &format!(
            "CREATE TRIGGER {} AFTER DELETE ON {escaped_table} FOR EACH ROW BEGIN
                UPDATE {escaped_shadow} SET tstamp = strftime('%Y-%m-%dT%H:%M:%fZ', 'now'), changed = {changed}
                WHERE pkey = OLD.{escaped_pkey};
            END;",
            quote(&identifier::delete_trigger(table))
        ),
        [],
    )?;

    Ok(())
}

/// Insert a shadow row for every user row, used at install time and by
/// `ResyncMode::CLEAN_LOCAL_DATA` (which wipes the shadow table first).
pub(crate) fn inflate_all(conn: &Connection, table: &str, shadow: &str, pkey: &str) -> WatcherResult<()> {
    let changed = ChangeState::Changed.as_i64();
    conn.execute(
        &format!(
            "INSERT INTO {} (pkey, tstamp, changed)
             SELECT {}, strftime('%Y-%m-%dT%H:%M:%fZ', 'now'), {changed} FROM {};",
            quote(shadow),
            quote(pkey),
            quote(table)
        ),
        [],
    )?;
    Ok(())
}

/// Insert a shadow row only for user rows that don't already have one, used
/// by `ResyncMode::CHECK_LOCAL_DATA` to repair drift without touching rows
/// already tracked.
pub(crate) fn inflate_missing(conn: &Connection, table: &str, shadow: &str, pkey: &str) -> WatcherResult<()> {
    let changed = ChangeState::Changed.as_i64();
    conn.execute(
        &format!(
            "INSERT INTO {shadow_q} (pkey, tstamp, changed)
             SELECT {pkey_q}, strftime('%Y-%m-%dT%H:%M:%fZ', 'now'), {changed}
             FROM {table_q}
             WHERE {pkey_q} NOT IN (SELECT pkey FROM {shadow_q});",
            shadow_q = quote(shadow),
            pkey_q = quote(pkey),
            table_q = quote(table),
        ),
        [],
    )?;
    Ok(())
}
