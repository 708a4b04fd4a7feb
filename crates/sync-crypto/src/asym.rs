use crate::error::{CryptoError, CryptoResult};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use hkdf::Hkdf;
use rand::RngCore;
use rand_core::OsRng;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};

const NONCE_LEN: usize = 12;
const HKDF_INFO: &[u8] = b"sync-asym-v1";

fn derive_key(shared: &x25519_dalek::SharedSecret) -> [u8; 32] {
    let hkdf = Hkdf::<Sha256>::new(None, shared.as_bytes());
    let mut okm = [0u8; 32];
    hkdf.expand(HKDF_INFO, &mut okm).expect("32 is a valid HKDF-SHA256 output length");
    okm
}

/// Anonymous ECIES-style encryption: an ephemeral X25519 key is generated,
/// diffie-hellman'd against `peer_pub` to derive a one-time symmetric key,
/// and the ephemeral public key is prefixed onto the ciphertext so the
/// recipient can redo the exchange.
///
/// Wire layout: `ephemeral_pub(32) || nonce(12) || aead_ciphertext`.
pub fn asym_encrypt(peer_pub: &PublicKey, plain: &[u8]) -> Vec<u8> {
    let ephemeral = StaticSecret::random_from_rng(OsRng);
    let ephemeral_pub = PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(peer_pub);
    let key = derive_key(&shared);

    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);

    let cipher = ChaCha20Poly1305::new_from_slice(&key).expect("32-byte key");
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plain)
        .expect("chacha20poly1305 encryption does not fail");

    let mut out = Vec::with_capacity(32 + NONCE_LEN + ciphertext.len());
    out.extend_from_slice(ephemeral_pub.as_bytes());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    out
}

/// Inverse of [`asym_encrypt`] using the recipient's own static secret.
pub fn asym_decrypt(own_secret: &StaticSecret, cipher: &[u8]) -> CryptoResult<Vec<u8>> {
    if cipher.len() < 32 + NONCE_LEN {
        return Err(CryptoError::InvalidLength("asym ciphertext shorter than header".to_string()));
    }
    let (ephemeral_pub_bytes, rest) = cipher.split_at(32);
    let (nonce_bytes, ciphertext) = rest.split_at(NONCE_LEN);

    let ephemeral_pub = PublicKey::from(<[u8; 32]>::try_from(ephemeral_pub_bytes).expect("split at 32"));
    let shared = own_secret.diffie_hellman(&ephemeral_pub);
    let key = derive_key(&shared);

    let cipher = ChaCha20Poly1305::new_from_slice(&key).expect("32-byte key");
    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_round_trip() {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        let ciphertext = asym_encrypt(&public, b"top secret payload");
        let plain = asym_decrypt(&secret, &ciphertext).unwrap();
        assert_eq!(plain, b"top secret payload");
    }

    #[test]
    fn wrong_recipient_key_fails() {
        let secret_a = StaticSecret::random_from_rng(OsRng);
        let public_a = PublicKey::from(&secret_a);
        let secret_b = StaticSecret::random_from_rng(OsRng);

        let ciphertext = asym_encrypt(&public_a, b"payload");
        assert!(asym_decrypt(&secret_b, &ciphertext).is_err());
    }

    #[test]
    fn truncated_ciphertext_is_rejected() {
        let secret = StaticSecret::random_from_rng(OsRng);
        assert!(asym_decrypt(&secret, &[0u8; 10]).is_err());
    }
}
