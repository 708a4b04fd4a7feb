use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct DeviceRow {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub sign_scheme: String,
    pub sign_key: Vec<u8>,
    pub crypt_scheme: String,
    pub crypt_key: Vec<u8>,
    pub fingerprint: Vec<u8>,
    pub key_mac: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct DeviceSummary {
    pub id: Uuid,
    pub name: String,
    pub fingerprint: Vec<u8>,
}

/// A pending change ready to fan out to a device, as returned by
/// `load_next_changes`.
#[derive(Debug, Clone)]
pub struct PendingChange {
    pub blob_id: i64,
    pub key_index: u32,
    pub salt: Vec<u8>,
    pub ciphertext: Vec<u8>,
}

/// A key rotation update a sibling device has not yet claimed.
#[derive(Debug, Clone)]
pub struct KeyChangeRow {
    pub key_index: u32,
    pub scheme: String,
    pub wrapped_key: Vec<u8>,
    pub verify_mac: Vec<u8>,
}

/// Outcome of `try_key_change`.
#[derive(Debug, Clone)]
pub enum KeyChangeStatus {
    Accepted { siblings: Vec<DeviceRow> },
    Pending,
    IndexMismatch { expected: u32 },
}

/// Outcome of `update_quota_limit`.
#[derive(Debug, Clone, Default)]
pub struct QuotaUpdateSummary {
    /// Users whose `quota_limit` was actually lowered/raised to the new value.
    pub users_updated: u64,
    /// Devices removed because `force` was set and they belonged to an
    /// over-quota account.
    pub devices_removed: u64,
    /// Accounts removed because `force` was set and they were over quota.
    pub users_removed: u64,
    /// Users left untouched (non-force mode) because they don't fit under
    /// the new limit.
    pub users_unmatched: u64,
}
