//! Schema migrations for the change store.

use rusqlite::{Connection, Result};
use tracing::info;

pub const CURRENT_VERSION: i32 = 1;

pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    let current_version: i32 =
        conn.query_row("SELECT COALESCE(MAX(version), 0) FROM migrations", [], |row| row.get(0)).unwrap_or(0);

    info!(current_version, target_version = CURRENT_VERSION, "running server store migrations");

    if current_version < 1 {
        migrate_v1_initial_schema(conn)?;
    }

    Ok(())
}

fn record_migration(conn: &Connection, version: i32, name: &str) -> Result<()> {
    conn.execute("INSERT INTO migrations (version, name) VALUES (?1, ?2)", rusqlite::params![version, name])
}

fn migrate_v1_initial_schema(conn: &Connection) -> Result<()> {
    info!("applying migration v1: initial schema");
    conn.execute_batch(
        "
        CREATE TABLE users (
            id TEXT PRIMARY KEY,
            key_index INTEGER NOT NULL DEFAULT 0,
            quota_used INTEGER NOT NULL DEFAULT 0,
            quota_limit INTEGER NOT NULL,
            CHECK (quota_used < quota_limit)
        );

        CREATE TABLE devices (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            name TEXT NOT NULL,
            sign_scheme TEXT NOT NULL,
            sign_key BLOB NOT NULL,
            crypt_scheme TEXT NOT NULL,
            crypt_key BLOB NOT NULL,
            fingerprint BLOB NOT NULL,
            key_mac BLOB NOT NULL,
            last_login TEXT
        );
        CREATE INDEX idx_devices_user_id ON devices(user_id);

        CREATE TABLE data_changes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            device_id TEXT NOT NULL REFERENCES devices(id) ON DELETE CASCADE,
            data_id BLOB NOT NULL,
            key_index INTEGER NOT NULL,
            salt BLOB NOT NULL,
            data BLOB NOT NULL,
            UNIQUE(device_id, data_id)
        );

        CREATE TABLE device_changes (
            blob_id INTEGER NOT NULL REFERENCES data_changes(id) ON DELETE CASCADE,
            device_id TEXT NOT NULL REFERENCES devices(id) ON DELETE CASCADE,
            PRIMARY KEY(blob_id, device_id)
        );
        CREATE INDEX idx_device_changes_device_id ON device_changes(device_id, blob_id);

        CREATE TABLE key_changes (
            device_id TEXT NOT NULL REFERENCES devices(id) ON DELETE CASCADE,
            key_index INTEGER NOT NULL,
            scheme TEXT NOT NULL,
            wrapped_key BLOB NOT NULL,
            verify_mac BLOB NOT NULL,
            PRIMARY KEY(device_id, key_index)
        );

        CREATE TRIGGER quota_increment_on_insert
        AFTER INSERT ON data_changes
        BEGIN
            UPDATE users SET quota_used = quota_used + LENGTH(NEW.data)
            WHERE id = (SELECT user_id FROM devices WHERE id = NEW.device_id);
        END;

        CREATE TRIGGER quota_decrement_on_delete
        AFTER DELETE ON data_changes
        BEGIN
            UPDATE users SET quota_used = MAX(0, quota_used - LENGTH(OLD.data))
            WHERE id = (SELECT user_id FROM devices WHERE id = OLD.device_id);
        END;
        ",
    )?;
    record_migration(conn, 1, "initial_schema")
}
