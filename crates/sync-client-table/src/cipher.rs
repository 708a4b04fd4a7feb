//! Narrow capability a table sync needs from the account's symmetric key
//! table, mirrored from `sync-client-connector::credentials::DeviceSigner`:
//! depend on the capability, not on the concrete `CryptoCore` that also
//! manages key rotation and on-disk material.

use sync_crypto::CryptoResult;

pub trait PayloadCipher: Send + Sync {
    /// Encrypt `plain` under the current active key. Returns the key index
    /// and nonce that must travel alongside the ciphertext on the wire.
    fn encrypt(&self, plain: &[u8]) -> CryptoResult<(u32, [u8; 12], Vec<u8>)>;

    /// Decrypt a payload encrypted under `key_index`.
    fn decrypt(&self, key_index: u32, nonce: &[u8], ciphertext: &[u8]) -> CryptoResult<Vec<u8>>;
}

impl PayloadCipher for sync_crypto::CryptoCore {
    fn encrypt(&self, plain: &[u8]) -> CryptoResult<(u32, [u8; 12], Vec<u8>)> {
        self.sym_encrypt(plain)
    }

    fn decrypt(&self, key_index: u32, nonce: &[u8], ciphertext: &[u8]) -> CryptoResult<Vec<u8>> {
        self.sym_decrypt(key_index, nonce, ciphertext)
    }
}
