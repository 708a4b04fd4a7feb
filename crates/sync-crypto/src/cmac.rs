use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Message authentication tag length, HMAC-SHA256.
pub const MAC_LEN: usize = 32;

/// Compute the MAC over `data` under `key`.
///
/// Named `cmac` throughout this crate's public API for continuity with the
/// wire protocol's `cmac`/`trustmac` fields; the actual primitive is
/// HMAC-SHA256.
pub fn cmac(key: &[u8], data: &[u8]) -> [u8; MAC_LEN] {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Constant-time MAC verification.
pub fn verify(key: &[u8], data: &[u8], tag: &[u8]) -> bool {
    if tag.len() != MAC_LEN {
        return false;
    }
    let expected = cmac(key, data);
    expected.ct_eq(tag).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_accepts_matching_tag() {
        let key = b"account-key-material-32-bytes!!";
        let tag = cmac(key, b"payload");
        assert!(verify(key, b"payload", &tag));
    }

    #[test]
    fn verify_rejects_wrong_key() {
        let tag = cmac(b"key-one", b"payload");
        assert!(!verify(b"key-two", b"payload", &tag));
    }

    #[test]
    fn verify_rejects_tampered_data() {
        let key = b"account-key";
        let tag = cmac(key, b"payload");
        assert!(!verify(key, b"payload!", &tag));
    }
}
