//! Server-side change store: device registry, blob fan-out and key-rotation
//! bookkeeping, backed by a dedicated-thread SQLite connection.

mod error;
mod executor;
mod migrations;
mod models;
mod notify;
mod queries;

pub use error::{StoreError, StoreResult};
pub(crate) use error::from_tokio_rusqlite;
pub use executor::AsyncDatabase;
pub use models::{DeviceRow, DeviceSummary, KeyChangeRow, KeyChangeStatus, PendingChange, QuotaUpdateSummary};
pub use notify::ChangeNotifier;
pub use queries::NewDevice;

use std::path::Path;
use tokio::sync::broadcast;
use uuid::Uuid;

/// A sibling's share of an in-flight key rotation: which device, the
/// wrapped key and scheme it should receive, and the MAC it should verify
/// against once it unwraps it.
pub struct SiblingKeyShare {
    pub device: Uuid,
    pub scheme: String,
    pub wrapped_key: Vec<u8>,
    pub verify_mac: Vec<u8>,
}

/// Owns the database and the in-process wake-up channel that sessions
/// subscribe to; this is the crate's sole public entry point.
#[derive(Clone)]
pub struct ChangeStore {
    db: AsyncDatabase,
    notifier: ChangeNotifier,
}

impl ChangeStore {
    pub async fn open(path: &Path) -> StoreResult<Self> {
        Ok(Self { db: AsyncDatabase::open(path).await?, notifier: ChangeNotifier::new() })
    }

    #[cfg(test)]
    pub async fn open_in_memory() -> StoreResult<Self> {
        Ok(Self { db: AsyncDatabase::open_in_memory().await?, notifier: ChangeNotifier::new() })
    }

    /// Subscribe to device wake-up notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<Uuid> {
        self.notifier.subscribe()
    }

    pub async fn add_new_device(&self, device: NewDevice, quota_limit: i64) -> StoreResult<Uuid> {
        self.db.call(move |conn| queries::add_new_device(conn, device, quota_limit)).await
    }

    pub async fn add_new_device_to_user(&self, partner_id: Uuid, device: NewDevice) -> StoreResult<Uuid> {
        self.db.call(move |conn| queries::add_new_device_to_user(conn, partner_id, device)).await
    }

    /// Like [`Self::add_new_device_to_user`], but under a caller-chosen id —
    /// needed so the server can tell both enrollment parties the new
    /// device's id (in `Proof`) before the partner has accepted it.
    pub async fn add_new_device_to_user_with_id(&self, device_id: Uuid, partner_id: Uuid, device: NewDevice) -> StoreResult<()> {
        self.db.call(move |conn| queries::add_new_device_to_user_with_id(conn, device_id, partner_id, &device)).await
    }

    pub async fn remove_device(&self, target: Uuid) -> StoreResult<()> {
        self.db.call(move |conn| queries::remove_device(conn, target)).await
    }

    pub async fn list_devices(&self, device: Uuid) -> StoreResult<Vec<DeviceSummary>> {
        self.db.call(move |conn| queries::list_devices(conn, device)).await
    }

    pub async fn load_device(&self, device: Uuid) -> StoreResult<DeviceRow> {
        self.db.call(move |conn| queries::load_device(conn, device)).await
    }

    /// The account's current key index, looked up via any one of its devices.
    pub async fn account_key_index(&self, device: Uuid) -> StoreResult<u32> {
        self.db.call(move |conn| queries::account_key_index(conn, device)).await
    }

    pub async fn touch_last_login(&self, device: Uuid) -> StoreResult<()> {
        self.db.call(move |conn| queries::touch_last_login(conn, device)).await
    }

    /// Remove every device that hasn't logged in for `days` days (and any
    /// account that loses its last device as a result). Returns the number
    /// of devices removed.
    pub async fn cleanup_stale_devices(&self, days: i64) -> StoreResult<u64> {
        self.db.call(move |conn| queries::cleanup_stale_devices(conn, days)).await
    }

    /// Change every account's quota limit to `new_limit`. Accounts that fit
    /// under the new limit are updated; accounts that don't are left alone
    /// unless `force` is set, in which case they're deleted outright.
    pub async fn update_quota_limit(&self, new_limit: i64, force: bool) -> StoreResult<QuotaUpdateSummary> {
        self.db.call(move |conn| queries::update_quota_limit(conn, new_limit, force)).await
    }

    /// Upload a blob, fanning it out to every other device of the account,
    /// then wake up whichever of them are currently connected.
    pub async fn add_change(&self, device: Uuid, data_id: Vec<u8>, key_index: u32, salt: Vec<u8>, cipher: Vec<u8>) -> StoreResult<i64> {
        let blob_id = self
            .db
            .call(move |conn| queries::add_change(conn, device, &data_id, key_index, &salt, &cipher))
            .await?;
        let siblings = self.db.call(move |conn| queries::list_devices(conn, device)).await?;
        self.notifier.notify_many(siblings.into_iter().map(|s| s.id));
        Ok(blob_id)
    }

    /// Upload a blob addressed to exactly one sibling device.
    pub async fn add_device_change(
        &self,
        device: Uuid,
        target: Uuid,
        data_id: Vec<u8>,
        key_index: u32,
        salt: Vec<u8>,
        cipher: Vec<u8>,
    ) -> StoreResult<i64> {
        let blob_id = self
            .db
            .call(move |conn| queries::add_device_change(conn, device, target, &data_id, key_index, &salt, &cipher))
            .await?;
        self.notifier.notify(target);
        Ok(blob_id)
    }

    pub async fn load_next_changes(&self, device: Uuid, limit: u32, skip: u32) -> StoreResult<Vec<PendingChange>> {
        self.db.call(move |conn| queries::load_next_changes(conn, device, limit, skip)).await
    }

    pub async fn count_pending_changes(&self, device: Uuid) -> StoreResult<u64> {
        self.db.call(move |conn| queries::count_pending_changes(conn, device)).await
    }

    pub async fn complete_change(&self, device: Uuid, blob_id: i64) -> StoreResult<()> {
        self.db.call(move |conn| queries::complete_change(conn, device, blob_id)).await
    }

    pub async fn try_key_change(&self, device: Uuid, proposed_index: u32) -> StoreResult<KeyChangeStatus> {
        self.db.call(move |conn| queries::try_key_change(conn, device, proposed_index)).await
    }

    /// Commit an accepted rotation and wake every sibling that now has a
    /// `key_changes` row waiting for it.
    pub async fn update_exchange_key(&self, device: Uuid, index: u32, new_cmac: Vec<u8>, shares: Vec<SiblingKeyShare>) -> StoreResult<()> {
        let notify_targets: Vec<Uuid> = shares.iter().map(|s| s.device).collect();
        let sibling_updates: Vec<(Uuid, String, Vec<u8>, Vec<u8>)> =
            shares.into_iter().map(|s| (s.device, s.scheme, s.wrapped_key, s.verify_mac)).collect();
        self.db
            .call(move |conn| queries::update_exchange_key(conn, device, index, &new_cmac, &sibling_updates))
            .await?;
        self.notifier.notify_many(notify_targets);
        Ok(())
    }

    pub async fn load_key_changes(&self, device: Uuid) -> StoreResult<Vec<KeyChangeRow>> {
        self.db.call(move |conn| queries::load_key_changes(conn, device)).await
    }

    pub async fn update_cmac(&self, device: Uuid, index: u32, mac: Vec<u8>) -> StoreResult<()> {
        self.db.call(move |conn| queries::update_cmac(conn, device, index, &mac)).await
    }

    pub async fn close(self) -> StoreResult<()> {
        self.db.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_device(name: &str) -> NewDevice {
        NewDevice {
            name: name.to_string(),
            sign_scheme: "ed25519".to_string(),
            sign_key: vec![1; 32],
            crypt_scheme: "x25519-hkdf-chacha20poly1305".to_string(),
            crypt_key: vec![2; 32],
            fingerprint: vec![3; 32],
            key_mac: vec![4; 32],
        }
    }

    #[tokio::test]
    async fn new_account_round_trips_through_store() {
        let store = ChangeStore::open_in_memory().await.unwrap();
        let device = store.add_new_device(sample_device("laptop"), 1_000_000).await.unwrap();
        let loaded = store.load_device(device).await.unwrap();
        assert_eq!(loaded.name, "laptop");
        assert!(store.list_devices(device).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn second_device_sees_first_as_sibling() {
        let store = ChangeStore::open_in_memory().await.unwrap();
        let first = store.add_new_device(sample_device("laptop"), 1_000_000).await.unwrap();
        let second = store.add_new_device_to_user(first, sample_device("phone")).await.unwrap();

        let siblings = store.list_devices(first).await.unwrap();
        assert_eq!(siblings.len(), 1);
        assert_eq!(siblings[0].id, second);
    }

    #[tokio::test]
    async fn change_fans_out_and_drains_on_complete() {
        let store = ChangeStore::open_in_memory().await.unwrap();
        let first = store.add_new_device(sample_device("laptop"), 1_000_000).await.unwrap();
        let second = store.add_new_device_to_user(first, sample_device("phone")).await.unwrap();

        let mut rx = store.subscribe();
        let blob_id = store.add_change(first, b"note-1".to_vec(), 0, vec![9; 16], b"ciphertext".to_vec()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), second);

        let pending = store.load_next_changes(second, 10, 0).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].blob_id, blob_id);

        store.complete_change(second, blob_id).await.unwrap();
        assert!(store.load_next_changes(second, 10, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn re_upload_of_same_data_id_replaces_prior_blob() {
        let store = ChangeStore::open_in_memory().await.unwrap();
        let first = store.add_new_device(sample_device("laptop"), 1_000_000).await.unwrap();
        let second = store.add_new_device_to_user(first, sample_device("phone")).await.unwrap();

        store.add_change(first, b"note-1".to_vec(), 0, vec![9; 16], b"v1".to_vec()).await.unwrap();
        store.add_change(first, b"note-1".to_vec(), 0, vec![9; 16], b"v2".to_vec()).await.unwrap();

        let pending = store.load_next_changes(second, 10, 0).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].ciphertext, b"v2");
    }

    #[tokio::test]
    async fn quota_exceeded_is_reported_as_store_error() {
        let store = ChangeStore::open_in_memory().await.unwrap();
        let first = store.add_new_device(sample_device("laptop"), 4).await.unwrap();
        let _second = store.add_new_device_to_user(first, sample_device("phone")).await.unwrap();

        let err = store.add_change(first, b"note-1".to_vec(), 0, vec![9; 16], b"too-big".to_vec()).await.unwrap_err();
        assert!(matches!(err, StoreError::QuotaExceeded));
    }

    #[tokio::test]
    async fn removing_last_device_removes_the_account() {
        let store = ChangeStore::open_in_memory().await.unwrap();
        let first = store.add_new_device(sample_device("laptop"), 1_000_000).await.unwrap();
        store.remove_device(first).await.unwrap();
        assert!(matches!(store.load_device(first).await.unwrap_err(), StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn key_rotation_flow_accepts_then_blocks_concurrent_proposal() {
        let store = ChangeStore::open_in_memory().await.unwrap();
        let first = store.add_new_device(sample_device("laptop"), 1_000_000).await.unwrap();
        let second = store.add_new_device_to_user(first, sample_device("phone")).await.unwrap();

        match store.try_key_change(first, 1).await.unwrap() {
            KeyChangeStatus::Accepted { siblings } => assert_eq!(siblings.len(), 1),
            other => panic!("expected Accepted, got {other:?}"),
        }

        let mut rx = store.subscribe();
        store
            .update_exchange_key(
                first,
                1,
                vec![7; 32],
                vec![SiblingKeyShare { device: second, scheme: "chacha20poly1305".to_string(), wrapped_key: vec![8; 48], verify_mac: vec![9; 32] }],
            )
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap(), second);

        let pending = store.load_key_changes(second).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].key_index, 1);

        match store.try_key_change(second, 2).await.unwrap() {
            KeyChangeStatus::Pending => {}
            other => panic!("expected Pending, got {other:?}"),
        }

        store.update_cmac(second, 1, vec![10; 32]).await.unwrap();
        assert!(store.load_key_changes(second).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stale_proposed_index_is_reported_as_mismatch() {
        let store = ChangeStore::open_in_memory().await.unwrap();
        let first = store.add_new_device(sample_device("laptop"), 1_000_000).await.unwrap();
        match store.try_key_change(first, 5).await.unwrap() {
            KeyChangeStatus::IndexMismatch { expected } => assert_eq!(expected, 1),
            other => panic!("expected IndexMismatch, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cleanup_leaves_devices_that_have_never_logged_in_alone() {
        let store = ChangeStore::open_in_memory().await.unwrap();
        let first = store.add_new_device(sample_device("laptop"), 1_000_000).await.unwrap();

        let removed = store.cleanup_stale_devices(30).await.unwrap();
        assert_eq!(removed, 0);
        assert!(store.load_device(first).await.is_ok());
    }

    #[tokio::test]
    async fn cleanup_leaves_a_device_that_logged_in_within_the_window() {
        let store = ChangeStore::open_in_memory().await.unwrap();
        let first = store.add_new_device(sample_device("laptop"), 1_000_000).await.unwrap();
        store.touch_last_login(first).await.unwrap();

        let removed = store.cleanup_stale_devices(30).await.unwrap();
        assert_eq!(removed, 0);
        assert!(store.load_device(first).await.is_ok());
    }

    #[tokio::test]
    async fn upload_with_no_siblings_is_acknowledged_but_leaves_no_blob() {
        let store = ChangeStore::open_in_memory().await.unwrap();
        let first = store.add_new_device(sample_device("laptop"), 1_000_000).await.unwrap();

        store.add_change(first, b"note-1".to_vec(), 0, vec![9; 16], b"ciphertext".to_vec()).await.unwrap();

        assert!(store.load_next_changes(first, 10, 0).await.unwrap().is_empty());
        let second = store.add_new_device_to_user(first, sample_device("phone")).await.unwrap();
        assert!(store.load_next_changes(second, 10, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn quota_used_reaching_the_limit_exactly_is_rejected() {
        let store = ChangeStore::open_in_memory().await.unwrap();
        let first = store.add_new_device(sample_device("laptop"), 8).await.unwrap();
        let _second = store.add_new_device_to_user(first, sample_device("phone")).await.unwrap();

        let err = store.add_change(first, b"note-1".to_vec(), 0, vec![9; 16], b"12345678".to_vec()).await.unwrap_err();
        assert!(matches!(err, StoreError::QuotaExceeded));
    }

    #[tokio::test]
    async fn quota_limit_update_skips_accounts_that_no_longer_fit() {
        let store = ChangeStore::open_in_memory().await.unwrap();
        let first = store.add_new_device(sample_device("laptop"), 1_000_000).await.unwrap();
        let second = store.add_new_device(sample_device("desktop"), 1_000_000).await.unwrap();
        let _sibling = store.add_new_device_to_user(second, sample_device("phone")).await.unwrap();
        store.add_change(second, b"note-1".to_vec(), 0, vec![9; 16], b"ciphertext".to_vec()).await.unwrap();

        let summary = store.update_quota_limit(5, false).await.unwrap();
        assert_eq!(summary.users_updated, 1);
        assert_eq!(summary.users_unmatched, 1);
        assert_eq!(summary.devices_removed, 0);
        assert_eq!(summary.users_removed, 0);
        assert!(store.load_device(first).await.is_ok());
        assert!(store.load_device(second).await.is_ok());
    }

    #[tokio::test]
    async fn quota_limit_update_forces_removal_of_over_quota_accounts() {
        let store = ChangeStore::open_in_memory().await.unwrap();
        let first = store.add_new_device(sample_device("laptop"), 1_000_000).await.unwrap();
        let second = store.add_new_device(sample_device("desktop"), 1_000_000).await.unwrap();
        let _sibling = store.add_new_device_to_user(second, sample_device("phone")).await.unwrap();
        store.add_change(second, b"note-1".to_vec(), 0, vec![9; 16], b"ciphertext".to_vec()).await.unwrap();

        let summary = store.update_quota_limit(5, true).await.unwrap();
        assert_eq!(summary.users_removed, 1);
        assert!(store.load_device(first).await.is_ok());
        assert!(matches!(store.load_device(second).await.unwrap_err(), StoreError::NotFound(_)));
    }
}
