use thiserror::Error;

/// Errors surfaced by a [`crate::SecureStorage`] backend.
///
/// The crypto core never swallows these: every variant propagates to the
/// caller as `KeyMaterialCorrupt`/`KeyStoreUnavailable` at its own boundary.
#[derive(Error, Debug)]
pub enum KeyStoreError {
    #[error("key store backend error: {0}")]
    Backend(String),

    #[error("no entry for alias {0:?}")]
    NotFound(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type KeyStoreResult<T> = Result<T, KeyStoreError>;
