use crate::models::{DeviceRow, DeviceSummary, KeyChangeRow, KeyChangeStatus, PendingChange, QuotaUpdateSummary};
use crate::{StoreError, StoreResult};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(ffi, _)
            if ffi.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn device_row_from(row: &rusqlite::Row) -> rusqlite::Result<DeviceRow> {
    let id: String = row.get(0)?;
    let user_id: String = row.get(1)?;
    Ok(DeviceRow {
        id: Uuid::parse_str(&id).expect("stored device id is a valid uuid"),
        user_id: Uuid::parse_str(&user_id).expect("stored user id is a valid uuid"),
        name: row.get(2)?,
        sign_scheme: row.get(3)?,
        sign_key: row.get(4)?,
        crypt_scheme: row.get(5)?,
        crypt_key: row.get(6)?,
        fingerprint: row.get(7)?,
        key_mac: row.get(8)?,
    })
}

const DEVICE_COLUMNS: &str = "id, user_id, name, sign_scheme, sign_key, crypt_scheme, crypt_key, fingerprint, key_mac";

/// Create a new account and its first device in one transaction.
pub fn add_new_device(conn: &Connection, device: NewDevice, quota_limit: i64) -> StoreResult<Uuid> {
    let user_id = Uuid::new_v4();
    let device_id = Uuid::new_v4();
    conn.execute_batch("BEGIN IMMEDIATE")?;
    let result = (|| -> StoreResult<Uuid> {
        conn.execute(
            "INSERT INTO users (id, key_index, quota_used, quota_limit) VALUES (?1, 0, 0, ?2)",
            params![user_id.to_string(), quota_limit],
        )?;
        insert_device(conn, device_id, user_id, &device)?;
        Ok(device_id)
    })();
    finish_transaction(conn, result)
}

/// Attach a new device to the user of an already-trusted partner device.
pub fn add_new_device_to_user(conn: &Connection, partner_id: Uuid, device: NewDevice) -> StoreResult<Uuid> {
    let device_id = Uuid::new_v4();
    conn.execute_batch("BEGIN IMMEDIATE")?;
    let result = (|| -> StoreResult<Uuid> {
        let user_id: String = conn
            .query_row("SELECT user_id FROM devices WHERE id = ?1", params![partner_id.to_string()], |r| r.get(0))
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("partner device {partner_id}")))?;
        insert_device(conn, device_id, Uuid::parse_str(&user_id).expect("stored uuid"), &device)?;
        Ok(device_id)
    })();
    finish_transaction(conn, result)
}

pub struct NewDevice {
    pub name: String,
    pub sign_scheme: String,
    pub sign_key: Vec<u8>,
    pub crypt_scheme: String,
    pub crypt_key: Vec<u8>,
    pub fingerprint: Vec<u8>,
    pub key_mac: Vec<u8>,
}

fn insert_device(conn: &Connection, device_id: Uuid, user_id: Uuid, device: &NewDevice) -> rusqlite::Result<()> {
    conn.execute(
        &format!("INSERT INTO devices ({DEVICE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"),
        params![
            device_id.to_string(),
            user_id.to_string(),
            device.name,
            device.sign_scheme,
            device.sign_key,
            device.crypt_scheme,
            device.crypt_key,
            device.fingerprint,
            device.key_mac,
        ],
    )?;
    Ok(())
}

fn finish_transaction<T>(conn: &Connection, result: StoreResult<T>) -> StoreResult<T> {
    match &result {
        Ok(_) => conn.execute_batch("COMMIT")?,
        Err(_) => conn.execute_batch("ROLLBACK")?,
    }
    result
}

/// Remove a device; if it was the last one in its account, remove the
/// account row too.
pub fn remove_device(conn: &Connection, target: Uuid) -> StoreResult<()> {
    conn.execute_batch("BEGIN IMMEDIATE")?;
    let result = (|| -> StoreResult<()> {
        let user_id: String = conn
            .query_row("SELECT user_id FROM devices WHERE id = ?1", params![target.to_string()], |r| r.get(0))
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("device {target}")))?;
        conn.execute("DELETE FROM devices WHERE id = ?1", params![target.to_string()])?;
        let remaining: i64 =
            conn.query_row("SELECT COUNT(*) FROM devices WHERE user_id = ?1", params![user_id], |r| r.get(0))?;
        if remaining == 0 {
            conn.execute("DELETE FROM users WHERE id = ?1", params![user_id])?;
        }
        Ok(())
    })();
    finish_transaction(conn, result)
}

/// Remove every device whose `last_login` is older than `days` days ago
/// (devices that have never logged in are left alone), cascading to their
/// account when it was their last device. Returns how many devices were
/// removed.
pub fn cleanup_stale_devices(conn: &Connection, days: i64) -> StoreResult<u64> {
    let mut stmt = conn.prepare(
        "SELECT id FROM devices WHERE last_login IS NOT NULL AND last_login < datetime('now', ?1)",
    )?;
    let cutoff = format!("-{days} days");
    let stale: Vec<Uuid> = stmt
        .query_map(params![cutoff], |row| {
            let id: String = row.get(0)?;
            Ok(Uuid::parse_str(&id).expect("stored uuid"))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    drop(stmt);

    for device in &stale {
        remove_device(conn, *device)?;
    }
    Ok(stale.len() as u64)
}

/// Change every account's quota limit to `new_limit`. An account's limit is
/// only lowered/raised when it currently fits under the new value
/// (`quota_used < new_limit`); accounts that wouldn't fit are left at their
/// current limit, unless `force` is set, in which case they (and their
/// devices) are deleted outright before the update runs.
pub fn update_quota_limit(conn: &Connection, new_limit: i64, force: bool) -> StoreResult<QuotaUpdateSummary> {
    conn.execute_batch("BEGIN IMMEDIATE")?;
    let result = (|| -> StoreResult<QuotaUpdateSummary> {
        let mut summary = QuotaUpdateSummary::default();

        if force {
            summary.devices_removed = conn.execute(
                "DELETE FROM devices WHERE user_id IN ( \
                     SELECT id FROM users WHERE quota_limit != ?1 AND quota_used >= ?1 \
                 )",
                params![new_limit],
            )? as u64;
            summary.users_removed =
                conn.execute("DELETE FROM users WHERE quota_limit != ?1 AND quota_used >= ?1", params![new_limit])? as u64;
        }

        summary.users_updated =
            conn.execute("UPDATE users SET quota_limit = ?1 WHERE quota_limit != ?1 AND quota_used < ?1", params![new_limit])?
                as u64;

        if !force {
            summary.users_unmatched = conn.query_row(
                "SELECT COUNT(*) FROM users WHERE quota_limit != ?1",
                params![new_limit],
                |row| row.get(0),
            )?;
        }

        Ok(summary)
    })();
    finish_transaction(conn, result)
}

/// Siblings of `device` (every other device sharing its account).
pub fn list_devices(conn: &Connection, device: Uuid) -> StoreResult<Vec<DeviceSummary>> {
    let user_id: String = conn
        .query_row("SELECT user_id FROM devices WHERE id = ?1", params![device.to_string()], |r| r.get(0))
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("device {device}")))?;

    let mut stmt = conn.prepare("SELECT id, name, fingerprint FROM devices WHERE user_id = ?1 AND id != ?2")?;
    let rows = stmt
        .query_map(params![user_id, device.to_string()], |row| {
            let id: String = row.get(0)?;
            Ok(DeviceSummary { id: Uuid::parse_str(&id).expect("stored uuid"), name: row.get(1)?, fingerprint: row.get(2)? })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn load_device(conn: &Connection, device: Uuid) -> StoreResult<DeviceRow> {
    conn.query_row(&format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE id = ?1"), params![device.to_string()], device_row_from)
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("device {device}")))
}

pub fn touch_last_login(conn: &Connection, device: Uuid) -> StoreResult<()> {
    conn.execute(
        "UPDATE devices SET last_login = datetime('now') WHERE id = ?1",
        params![device.to_string()],
    )?;
    Ok(())
}

/// Upload a blob from `device`, fanning it out to every sibling. Rolls back
/// cleanly (blob still acknowledged) if the account turns out to have no
/// siblings to notify — a blob with zero fan-out rows is never left behind.
pub fn add_change(conn: &Connection, device: Uuid, data_id: &[u8], key_index: u32, salt: &[u8], cipher: &[u8]) -> StoreResult<i64> {
    conn.execute_batch("BEGIN IMMEDIATE")?;
    let result = (|| -> StoreResult<(i64, bool)> {
        conn.execute(
            "DELETE FROM data_changes WHERE device_id = ?1 AND data_id = ?2",
            params![device.to_string(), data_id],
        )?;
        let insert = conn.execute(
            "INSERT INTO data_changes (device_id, data_id, key_index, salt, data) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![device.to_string(), data_id, key_index, salt, cipher],
        );
        let blob_id = match insert {
            Ok(_) => conn.last_insert_rowid(),
            Err(e) if is_constraint_violation(&e) => return Err(StoreError::QuotaExceeded),
            Err(e) => return Err(e.into()),
        };

        let siblings = list_devices(conn, device)?;
        for sibling in &siblings {
            conn.execute(
                "INSERT OR IGNORE INTO device_changes (blob_id, device_id) VALUES (?1, ?2)",
                params![blob_id, sibling.id.to_string()],
            )?;
        }
        Ok((blob_id, !siblings.is_empty()))
    })();

    // Whether to commit depends on fan-out, not on Rust-level success: an
    // empty sibling set still acknowledges the upload to the caller, but
    // must roll back so no orphan blob survives with zero fan-out rows.
    match result {
        Ok((blob_id, true)) => {
            conn.execute_batch("COMMIT")?;
            Ok(blob_id)
        }
        Ok((blob_id, false)) => {
            conn.execute_batch("ROLLBACK")?;
            Ok(blob_id)
        }
        Err(e) => {
            conn.execute_batch("ROLLBACK")?;
            Err(e)
        }
    }
}

/// Upload a blob addressed to exactly one target device.
pub fn add_device_change(
    conn: &Connection,
    device: Uuid,
    target: Uuid,
    data_id: &[u8],
    key_index: u32,
    salt: &[u8],
    cipher: &[u8],
) -> StoreResult<i64> {
    conn.execute_batch("BEGIN IMMEDIATE")?;
    let result = (|| -> StoreResult<i64> {
        let existing: Option<i64> = conn
            .query_row(
                "SELECT id FROM data_changes WHERE device_id = ?1 AND data_id = ?2",
                params![device.to_string(), data_id],
                |r| r.get(0),
            )
            .optional()?;

        let blob_id = match existing {
            Some(id) => id,
            None => {
                let insert = conn.execute(
                    "INSERT INTO data_changes (device_id, data_id, key_index, salt, data) VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![device.to_string(), data_id, key_index, salt, cipher],
                );
                match insert {
                    Ok(_) => conn.last_insert_rowid(),
                    Err(e) if is_constraint_violation(&e) => return Err(StoreError::QuotaExceeded),
                    Err(e) => return Err(e.into()),
                }
            }
        };

        conn.execute(
            "INSERT OR IGNORE INTO device_changes (blob_id, device_id) VALUES (?1, ?2)",
            params![blob_id, target.to_string()],
        )?;
        Ok(blob_id)
    })();
    finish_transaction(conn, result)
}

/// Changes fanned out to `device`, oldest first, for stable delivery order.
pub fn load_next_changes(conn: &Connection, device: Uuid, limit: u32, skip: u32) -> StoreResult<Vec<PendingChange>> {
    let mut stmt = conn.prepare(
        "SELECT dc.id, dc.key_index, dc.salt, dc.data
         FROM device_changes fo
         JOIN data_changes dc ON dc.id = fo.blob_id
         WHERE fo.device_id = ?1
         ORDER BY dc.id ASC
         LIMIT ?2 OFFSET ?3",
    )?;
    let rows = stmt
        .query_map(params![device.to_string(), limit, skip], |row| {
            Ok(PendingChange {
                blob_id: row.get(0)?,
                key_index: row.get(1)?,
                salt: row.get(2)?,
                ciphertext: row.get(3)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Remaining fan-out count for `device`, used as the change estimate on the
/// first message of a download batch.
pub fn count_pending_changes(conn: &Connection, device: Uuid) -> StoreResult<u64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM device_changes WHERE device_id = ?1",
        params![device.to_string()],
        |r| r.get(0),
    )?;
    Ok(count as u64)
}

/// Acknowledge delivery: drop the fan-out row, and the blob itself once no
/// fan-out rows reference it.
pub fn complete_change(conn: &Connection, device: Uuid, blob_id: i64) -> StoreResult<()> {
    conn.execute_batch("BEGIN IMMEDIATE")?;
    let result = (|| -> StoreResult<()> {
        conn.execute(
            "DELETE FROM device_changes WHERE blob_id = ?1 AND device_id = ?2",
            params![blob_id, device.to_string()],
        )?;
        let remaining: i64 =
            conn.query_row("SELECT COUNT(*) FROM device_changes WHERE blob_id = ?1", params![blob_id], |r| r.get(0))?;
        if remaining == 0 {
            conn.execute("DELETE FROM data_changes WHERE id = ?1", params![blob_id])?;
        }
        Ok(())
    })();
    finish_transaction(conn, result)
}

/// Attach a new device to a partner's account under a pre-chosen id: used
/// for enrollment, where the server must hand the new device's id to both
/// sides (in `Proof`) before the partner has accepted or denied it.
pub fn add_new_device_to_user_with_id(conn: &Connection, device_id: Uuid, partner_id: Uuid, device: &NewDevice) -> StoreResult<()> {
    conn.execute_batch("BEGIN IMMEDIATE")?;
    let result = (|| -> StoreResult<()> {
        let user_id: String = conn
            .query_row("SELECT user_id FROM devices WHERE id = ?1", params![partner_id.to_string()], |r| r.get(0))
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("partner device {partner_id}")))?;
        insert_device(conn, device_id, Uuid::parse_str(&user_id).expect("stored uuid"), device)?;
        Ok(())
    })();
    finish_transaction(conn, result)
}

/// The account's current key index, looked up via any one of its devices.
pub fn account_key_index(conn: &Connection, device: Uuid) -> StoreResult<u32> {
    let user_id: String = conn
        .query_row("SELECT user_id FROM devices WHERE id = ?1", params![device.to_string()], |r| r.get(0))
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("device {device}")))?;
    Ok(conn.query_row("SELECT key_index FROM users WHERE id = ?1", params![user_id], |r| r.get(0))?)
}

/// Accept only `proposed_index = current+1`, and only when no rotation is
/// already in flight for any device of the account (serializes rotations).
pub fn try_key_change(conn: &Connection, device: Uuid, proposed_index: u32) -> StoreResult<KeyChangeStatus> {
    let user_id: String = conn
        .query_row("SELECT user_id FROM devices WHERE id = ?1", params![device.to_string()], |r| r.get(0))
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("device {device}")))?;

    let current_index: u32 =
        conn.query_row("SELECT key_index FROM users WHERE id = ?1", params![user_id], |r| r.get(0))?;
    if proposed_index != current_index + 1 {
        return Ok(KeyChangeStatus::IndexMismatch { expected: current_index + 1 });
    }

    let pending: i64 = conn.query_row(
        "SELECT COUNT(*) FROM key_changes kc JOIN devices d ON d.id = kc.device_id WHERE d.user_id = ?1",
        params![user_id],
        |r| r.get(0),
    )?;
    if pending > 0 {
        return Ok(KeyChangeStatus::Pending);
    }

    let mut stmt = conn.prepare(&format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE user_id = ?1 AND id != ?2"))?;
    let siblings = stmt
        .query_map(params![user_id, device.to_string()], device_row_from)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(KeyChangeStatus::Accepted { siblings })
}

/// Commit an accepted rotation: advance `users.key_index`, stage one
/// `key_changes` row per sibling, and update the proposer's own `key_mac`.
pub fn update_exchange_key(
    conn: &Connection,
    device: Uuid,
    index: u32,
    new_cmac: &[u8],
    sibling_updates: &[(Uuid, String, Vec<u8>, Vec<u8>)],
) -> StoreResult<()> {
    conn.execute_batch("BEGIN IMMEDIATE")?;
    let result = (|| -> StoreResult<()> {
        let user_id: String = conn
            .query_row("SELECT user_id FROM devices WHERE id = ?1", params![device.to_string()], |r| r.get(0))
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("device {device}")))?;

        conn.execute("UPDATE users SET key_index = ?1 WHERE id = ?2", params![index, user_id])?;
        conn.execute("UPDATE devices SET key_mac = ?1 WHERE id = ?2", params![new_cmac, device.to_string()])?;

        for (sibling, scheme, wrapped, mac) in sibling_updates {
            conn.execute(
                "INSERT INTO key_changes (device_id, key_index, scheme, wrapped_key, verify_mac) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![sibling.to_string(), index, scheme, wrapped, mac],
            )?;
        }
        Ok(())
    })();
    finish_transaction(conn, result)
}

/// Rotation updates waiting for `device` to claim, picked up on login.
pub fn load_key_changes(conn: &Connection, device: Uuid) -> StoreResult<Vec<KeyChangeRow>> {
    let mut stmt =
        conn.prepare("SELECT key_index, scheme, wrapped_key, verify_mac FROM key_changes WHERE device_id = ?1")?;
    let rows = stmt
        .query_map(params![device.to_string()], |row| {
            Ok(KeyChangeRow { key_index: row.get(0)?, scheme: row.get(1)?, wrapped_key: row.get(2)?, verify_mac: row.get(3)? })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// A sibling claims the new index by posting its updated MAC, which
/// removes its `key_changes` row.
pub fn update_cmac(conn: &Connection, device: Uuid, index: u32, mac: &[u8]) -> StoreResult<()> {
    conn.execute_batch("BEGIN IMMEDIATE")?;
    let result = (|| -> StoreResult<()> {
        conn.execute("UPDATE devices SET key_mac = ?1 WHERE id = ?2", params![mac, device.to_string()])?;
        conn.execute(
            "DELETE FROM key_changes WHERE device_id = ?1 AND key_index = ?2",
            params![device.to_string(), index],
        )?;
        Ok(())
    })();
    finish_transaction(conn, result)
}
