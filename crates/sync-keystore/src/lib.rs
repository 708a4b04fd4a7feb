//! Backend-selectable secure storage for the two private-key aliases a
//! device holds (its signing key and its encryption key).
//!
//! [`KeyringStorage`] is the default, backed by whatever native credential
//! store the `keyring` crate finds on the host platform; [`FileStorage`] is
//! a JSON-on-disk fallback for hosts with no usable keyring (most commonly
//! a headless relay server).

mod error;
mod file_backend;
mod keyring_backend;
mod traits;

pub use error::{KeyStoreError, KeyStoreResult};
pub use file_backend::FileStorage;
pub use keyring_backend::KeyringStorage;
pub use traits::SecureStorage;
