use std::sync::Arc;
use uuid::Uuid;

/// What the connector needs from a device's long-term identity to sign the
/// handshake (and `Accept`/`NewKey` requests) without owning the rest of
/// the crypto state machine — `sync-crypto`'s `CryptoCore` also manages the
/// rotating account key table and on-disk key material, none of which the
/// wire-level connector has any business touching. Mirrors
/// `message-sync-retriable-worker`'s `ArminAccess` trait: depend on the
/// narrow capability, not the concrete owning type.
pub trait DeviceSigner: Send + Sync {
    fn sign(&self, msg: &[u8]) -> [u8; 64];
    fn sign_public_key(&self) -> [u8; 32];
    fn crypt_public_key(&self) -> [u8; 32];
}

impl DeviceSigner for sync_crypto::CryptoCore {
    fn sign(&self, msg: &[u8]) -> [u8; 64] {
        sync_crypto::CryptoCore::sign(self, msg)
    }

    fn sign_public_key(&self) -> [u8; 32] {
        self.verifying_key().to_bytes()
    }

    fn crypt_public_key(&self) -> [u8; 32] {
        *self.public_encryption_key().as_bytes()
    }
}

/// How a (re)connecting device authenticates itself. The connector rebuilds
/// and re-signs the matching handshake message on every reconnect — the
/// server hands out a fresh nonce on each `Identify`, so nothing here can be
/// precomputed once and replayed.
pub enum Credentials {
    /// First contact: mint a brand-new account. `cmac` proves possession of
    /// the account's symmetric key the same way every other signed message
    /// does (see `sync-crypto`'s CMAC discipline).
    Register { device_name: String, cmac: Vec<u8> },

    /// An already-registered device reconnecting.
    Login { device_id: Uuid, device_name: String },

    /// A brand-new device enrolling against an existing account via a
    /// trusted partner device, identified by `partner_id`. The partner must
    /// already be `Ready` and will receive a `Proof` push to accept or deny.
    Access {
        partner_id: Uuid,
        device_name: String,
        p_nonce: Vec<u8>,
        mac_scheme: String,
        cmac: Vec<u8>,
        trustmac: Vec<u8>,
    },
}

/// Everything the connector needs to speak for this device: its signing
/// capability plus how it wants to authenticate.
pub struct DeviceContext {
    pub identity: Arc<dyn DeviceSigner>,
    pub credentials: Credentials,
}
