use sync_keystore::KeyStoreError;
use thiserror::Error;

/// Errors surfaced by the crypto core.
#[derive(Error, Debug)]
pub enum CryptoError {
    /// The on-disk wrapped-key file set and the settings-tracked key index
    /// set have diverged — the two must always agree.
    #[error("key material corrupt: {0}")]
    KeyMaterialCorrupt(String),

    #[error("key store unavailable: {0}")]
    KeyStoreUnavailable(#[from] KeyStoreError),

    #[error("no account key at index {0}")]
    UnknownKeyIndex(u32),

    #[error("signature verification failed")]
    SignatureInvalid,

    #[error("authenticated decryption failed")]
    DecryptionFailed,

    #[error("invalid key or ciphertext length: {0}")]
    InvalidLength(String),

    #[error("scheme mismatch: expected {expected}, found {found}")]
    SchemeMismatch { expected: String, found: String },
}

pub type CryptoResult<T> = Result<T, CryptoError>;
