use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;

/// Scheme identifier for a password-derived export key.
pub const EXPORT_SCHEME_PBKDF2: &str = "pbkdf2-hmac-sha256";
/// Scheme identifier for a randomly generated export key (no password).
pub const EXPORT_SCHEME_RANDOM: &str = "random";

const SALT_LEN: usize = 16;
const EXPORT_KEY_LEN: usize = 32;
const PBKDF2_ROUNDS: u32 = 210_000;

/// Derive (or generate) a key suitable for wrapping account key material for
/// export. A `None` password yields a uniformly random key instead of a
/// derivation, since there is nothing to derive from; either way the salt is
/// fresh per call.
pub fn derive_export_key(password: Option<&str>) -> (&'static str, [u8; SALT_LEN], [u8; EXPORT_KEY_LEN]) {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);

    match password {
        Some(password) => {
            let mut key = [0u8; EXPORT_KEY_LEN];
            pbkdf2_hmac::<Sha256>(password.as_bytes(), &salt, PBKDF2_ROUNDS, &mut key);
            (EXPORT_SCHEME_PBKDF2, salt, key)
        }
        None => {
            let mut key = [0u8; EXPORT_KEY_LEN];
            rand::thread_rng().fill_bytes(&mut key);
            (EXPORT_SCHEME_RANDOM, salt, key)
        }
    }
}

/// Re-derive the same key from a known salt (used on the decrypting side of
/// an export, where the salt travels alongside the wrapped payload).
pub fn rederive_export_key(password: &str, salt: &[u8; SALT_LEN]) -> [u8; EXPORT_KEY_LEN] {
    let mut key = [0u8; EXPORT_KEY_LEN];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, PBKDF2_ROUNDS, &mut key);
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_password_and_salt_rederives_same_key() {
        let (scheme, salt, key) = derive_export_key(Some("hunter2"));
        assert_eq!(scheme, EXPORT_SCHEME_PBKDF2);
        assert_eq!(rederive_export_key("hunter2", &salt), key);
    }

    #[test]
    fn different_salts_produce_different_keys() {
        let (_, salt_a, key_a) = derive_export_key(Some("hunter2"));
        let (_, salt_b, key_b) = derive_export_key(Some("hunter2"));
        assert_ne!(salt_a, salt_b);
        assert_ne!(key_a, key_b);
    }

    #[test]
    fn no_password_yields_random_scheme() {
        let (scheme, _, key1) = derive_export_key(None);
        let (_, _, key2) = derive_export_key(None);
        assert_eq!(scheme, EXPORT_SCHEME_RANDOM);
        assert_ne!(key1, key2);
    }
}
