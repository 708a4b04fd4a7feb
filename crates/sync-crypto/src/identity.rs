use crate::error::{CryptoError, CryptoResult};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand_core::OsRng;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as XPublicKey, StaticSecret};

/// The only signing scheme this implementation issues or accepts.
pub const SIGN_SCHEME: &str = "ed25519";
/// The only encryption scheme this implementation issues or accepts.
pub const CRYPT_SCHEME: &str = "x25519-hkdf-chacha20poly1305";

/// A device's long-term signing and encryption key pairs.
///
/// Both are static: they identify the device for its lifetime, unlike the
/// rotating symmetric account key managed separately by [`crate::AccountKeyTable`].
pub struct DeviceIdentity {
    signing: SigningKey,
    encryption: StaticSecret,
}

impl DeviceIdentity {
    /// Generate a fresh identity, validating the requested schemes.
    ///
    /// `sign_param`/`crypt_param` name a scheme variant (e.g. a curve or key
    /// size); this implementation supports exactly one variant of each and
    /// rejects anything else rather than silently substituting it.
    pub fn generate(sign_scheme: &str, crypt_scheme: &str) -> CryptoResult<Self> {
        if sign_scheme != SIGN_SCHEME {
            return Err(CryptoError::SchemeMismatch {
                expected: SIGN_SCHEME.to_string(),
                found: sign_scheme.to_string(),
            });
        }
        if crypt_scheme != CRYPT_SCHEME {
            return Err(CryptoError::SchemeMismatch {
                expected: CRYPT_SCHEME.to_string(),
                found: crypt_scheme.to_string(),
            });
        }
        Ok(Self {
            signing: SigningKey::generate(&mut OsRng),
            encryption: StaticSecret::random_from_rng(OsRng),
        })
    }

    /// Reconstruct an identity from its two private key byte forms, as
    /// loaded back out of the key store.
    pub fn from_bytes(signing: &[u8; 32], encryption: &[u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(signing),
            encryption: StaticSecret::from(*encryption),
        }
    }

    pub fn signing_key_bytes(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }

    pub fn encryption_key_bytes(&self) -> [u8; 32] {
        self.encryption.to_bytes()
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }

    pub fn public_encryption_key(&self) -> XPublicKey {
        XPublicKey::from(&self.encryption)
    }

    pub(crate) fn static_secret(&self) -> &StaticSecret {
        &self.encryption
    }

    pub fn sign(&self, msg: &[u8]) -> [u8; 64] {
        self.signing.sign(msg).to_bytes()
    }

    /// Fingerprint the way every scheme does it here regardless of
    /// construction path: serialize both public keys, then hash — so two
    /// identities with the same key material always fingerprint identically.
    pub fn fingerprint(&self) -> [u8; 32] {
        fingerprint_of(self.verifying_key().as_bytes(), self.public_encryption_key().as_bytes())
    }
}

pub fn fingerprint_of(signing_pub: &[u8], encryption_pub: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(signing_pub);
    hasher.update(encryption_pub);
    hasher.finalize().into()
}

pub fn verify(signing_pub: &[u8; 32], msg: &[u8], signature: &[u8; 64]) -> CryptoResult<()> {
    let key = VerifyingKey::from_bytes(signing_pub).map_err(|_| CryptoError::SignatureInvalid)?;
    let sig = Signature::from_bytes(signature);
    key.verify(msg, &sig).map_err(|_| CryptoError::SignatureInvalid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unknown_scheme() {
        assert!(DeviceIdentity::generate("rsa-4096", CRYPT_SCHEME).is_err());
        assert!(DeviceIdentity::generate(SIGN_SCHEME, "p256").is_err());
    }

    #[test]
    fn sign_and_verify_round_trip() {
        let identity = DeviceIdentity::generate(SIGN_SCHEME, CRYPT_SCHEME).unwrap();
        let sig = identity.sign(b"hello");
        verify(identity.verifying_key().as_bytes(), b"hello", &sig).unwrap();
    }

    #[test]
    fn verify_rejects_tampered_message() {
        let identity = DeviceIdentity::generate(SIGN_SCHEME, CRYPT_SCHEME).unwrap();
        let sig = identity.sign(b"hello");
        assert!(verify(identity.verifying_key().as_bytes(), b"goodbye", &sig).is_err());
    }

    #[test]
    fn fingerprint_is_stable_across_reconstruction() {
        let identity = DeviceIdentity::generate(SIGN_SCHEME, CRYPT_SCHEME).unwrap();
        let fp1 = identity.fingerprint();
        let reloaded = DeviceIdentity::from_bytes(&identity.signing_key_bytes(), &identity.encryption_key_bytes());
        assert_eq!(fp1, reloaded.fingerprint());
    }
}
