use crate::error::{CryptoError, CryptoResult};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;
use std::collections::BTreeMap;
use x25519_dalek::{PublicKey as XPublicKey, StaticSecret};

/// Scheme identifier for the symmetric account key cipher.
pub const SYM_SCHEME: &str = "chacha20poly1305";

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;
/// Keys older than `current - GC_HORIZON` are dropped on activation.
const GC_HORIZON: u32 = 5;

#[derive(Clone)]
struct AccountKey {
    scheme: String,
    key: [u8; KEY_LEN],
}

struct PendingKey {
    index: u32,
    key: [u8; KEY_LEN],
}

/// The indexed table of symmetric account keys, plus the single in-flight
/// rotation proposal (if any).
///
/// Every device in an account eventually converges on the same table
/// through the two-phase rotation protocol: the proposer calls
/// [`Self::propose_next_key`], wraps the result for every sibling via
/// [`Self::wrap_key_for`], and only calls [`Self::activate_next_key`] once
/// the server has confirmed the rotation. Siblings call
/// [`Self::unwrap_key`] on whatever the server hands them in a `Welcome`.
pub struct AccountKeyTable {
    keys: BTreeMap<u32, AccountKey>,
    current_index: u32,
    pending: Option<PendingKey>,
}

impl AccountKeyTable {
    /// An empty table, as for a brand new device with no account key yet.
    pub fn empty() -> Self {
        Self { keys: BTreeMap::new(), current_index: 0, pending: None }
    }

    /// Rebuild from persisted (index, scheme, key) rows, e.g. loaded back
    /// from the wrapped-key files on disk.
    pub fn from_rows(current_index: u32, rows: Vec<(u32, String, [u8; KEY_LEN])>) -> Self {
        let keys = rows.into_iter().map(|(idx, scheme, key)| (idx, AccountKey { scheme, key })).collect();
        Self { keys, current_index, pending: None }
    }

    pub fn current_index(&self) -> u32 {
        self.current_index
    }

    pub fn known_indices(&self) -> Vec<u32> {
        self.keys.keys().copied().collect()
    }

    /// Encrypt under the current account key.
    pub fn sym_encrypt(&self, plain: &[u8]) -> CryptoResult<(u32, [u8; NONCE_LEN], Vec<u8>)> {
        let entry = self
            .keys
            .get(&self.current_index)
            .ok_or(CryptoError::UnknownKeyIndex(self.current_index))?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let cipher = ChaCha20Poly1305::new_from_slice(&entry.key).expect("32-byte key");
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plain)
            .expect("chacha20poly1305 encryption does not fail");

        Ok((self.current_index, nonce_bytes, ciphertext))
    }

    /// Decrypt under any key this device still knows about.
    pub fn sym_decrypt(&self, key_index: u32, nonce: &[u8], ciphertext: &[u8]) -> CryptoResult<Vec<u8>> {
        let entry = self.keys.get(&key_index).ok_or(CryptoError::UnknownKeyIndex(key_index))?;
        if nonce.len() != NONCE_LEN {
            return Err(CryptoError::InvalidLength(format!("nonce length {}", nonce.len())));
        }
        let cipher = ChaCha20Poly1305::new_from_slice(&entry.key).expect("32-byte key");
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::DecryptionFailed)
    }

    /// Raw bytes of the key at `index`, for primitives (CMAC) that need the
    /// key material directly rather than through the AEAD wrapper.
    pub fn key_bytes(&self, index: u32) -> CryptoResult<[u8; KEY_LEN]> {
        Ok(self.keys.get(&index).ok_or(CryptoError::UnknownKeyIndex(index))?.key)
    }

    /// Wrap the key at `index` (current or a staged pending proposal) for
    /// `peer_pub`, returning `(key_index, scheme, ciphertext)` ready to go
    /// on the wire as a `wrappedKey`/`wrappedSecret` field.
    pub fn wrap_key_for(&self, index: u32, peer_pub: &XPublicKey) -> CryptoResult<(u32, String, Vec<u8>)> {
        let key = if let Some(pending) = &self.pending {
            if pending.index == index {
                &pending.key
            } else {
                &self.keys.get(&index).ok_or(CryptoError::UnknownKeyIndex(index))?.key
            }
        } else {
            &self.keys.get(&index).ok_or(CryptoError::UnknownKeyIndex(index))?.key
        };
        let ciphertext = crate::asym::asym_encrypt(peer_pub, key);
        Ok((index, SYM_SCHEME.to_string(), ciphertext))
    }

    /// Unwrap a key delivered by the server (in a `Welcome`, `Grant`, or
    /// resolved `key_changes` row) using this device's own encryption
    /// private key. `grant_initial` marks the very first key this device
    /// receives on joining an account, which becomes current immediately;
    /// otherwise the key only becomes current if its index is newer than
    /// what this device already has.
    pub fn unwrap_key(
        &mut self,
        own_secret: &StaticSecret,
        index: u32,
        scheme: &str,
        ciphertext: &[u8],
        grant_initial: bool,
    ) -> CryptoResult<()> {
        if scheme != SYM_SCHEME {
            return Err(CryptoError::SchemeMismatch { expected: SYM_SCHEME.to_string(), found: scheme.to_string() });
        }
        let plain = crate::asym::asym_decrypt(own_secret, ciphertext)?;
        let key: [u8; KEY_LEN] =
            plain.try_into().map_err(|_| CryptoError::InvalidLength("unwrapped key is not 32 bytes".to_string()))?;

        self.keys.insert(index, AccountKey { scheme: scheme.to_string(), key });
        if grant_initial || index > self.current_index {
            self.current_index = index;
        }
        Ok(())
    }

    /// Stage a new key one past the current index, returning
    /// `(next_index, scheme)` to send in a `KeyChange`/`NewKey` exchange.
    /// The key is not yet current — call [`Self::activate_next_key`] once
    /// the server has confirmed the rotation.
    pub fn propose_next_key(&mut self) -> (u32, &'static str) {
        let next_index = self.current_index + 1;
        let mut key = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        self.pending = Some(PendingKey { index: next_index, key });
        (next_index, SYM_SCHEME)
    }

    /// Promote the staged proposal to current, dropping any key more than
    /// [`GC_HORIZON`] indices behind it.
    pub fn activate_next_key(&mut self, next_index: u32) -> CryptoResult<()> {
        let pending = self
            .pending
            .take()
            .filter(|p| p.index == next_index)
            .ok_or_else(|| CryptoError::KeyMaterialCorrupt(format!("no matching pending key for index {next_index}")))?;

        self.keys.insert(pending.index, AccountKey { scheme: SYM_SCHEME.to_string(), key: pending.key });
        self.current_index = pending.index;

        let floor = self.current_index.saturating_sub(GC_HORIZON);
        self.keys.retain(|&idx, _| idx >= floor);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;

    fn seeded_table() -> (AccountKeyTable, StaticSecret, XPublicKey) {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = XPublicKey::from(&secret);
        let mut table = AccountKeyTable::empty();
        let (idx, scheme) = table.propose_next_key();
        let (idx2, scheme2, wrapped) = table.wrap_key_for(idx, &public).unwrap();
        assert_eq!(idx, idx2);
        assert_eq!(scheme, scheme2);
        table.activate_next_key(idx).unwrap();
        let mut receiver = AccountKeyTable::empty();
        receiver.unwrap_key(&secret, idx2, &scheme2, &wrapped, true).unwrap();
        (receiver, secret, public)
    }

    #[test]
    fn sym_encrypt_decrypt_round_trips() {
        let (table, _secret, _public) = seeded_table();
        let (index, nonce, ciphertext) = table.sym_encrypt(b"payload").unwrap();
        let plain = table.sym_decrypt(index, &nonce, &ciphertext).unwrap();
        assert_eq!(plain, b"payload");
    }

    #[test]
    fn unknown_index_decrypt_fails() {
        let (table, _secret, _public) = seeded_table();
        assert!(table.sym_decrypt(99, &[0u8; 12], b"x").is_err());
    }

    #[test]
    fn rotation_advances_current_index_and_gcs_old_keys() {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = XPublicKey::from(&secret);
        let mut table = AccountKeyTable::empty();

        for _ in 0..8 {
            let (next, _scheme) = table.propose_next_key();
            let (_, _, wrapped) = table.wrap_key_for(next, &public).unwrap();
            table.activate_next_key(next).unwrap();
            // simulate unwrapping our own proposal, as a sibling would
            let mut mirror = AccountKeyTable::empty();
            mirror.unwrap_key(&secret, next, SYM_SCHEME, &wrapped, true).unwrap();
        }

        assert_eq!(table.current_index(), 8);
        let floor = 8u32.saturating_sub(5);
        assert!(table.known_indices().iter().all(|&idx| idx >= floor));
    }

    #[test]
    fn activate_rejects_mismatched_index() {
        let mut table = AccountKeyTable::empty();
        table.propose_next_key();
        assert!(table.activate_next_key(999).is_err());
    }
}
