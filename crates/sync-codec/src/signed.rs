use crate::{CodecError, CodecResult};

/// Ed25519 signatures are a fixed 64 bytes.
pub const SIGNATURE_LEN: usize = 64;

/// Append a fixed-size signature to an already-serialized message.
///
/// A signed message on the wire is exactly "the serialized bytes followed
/// by a signature over exactly those bytes" — no extra length prefix is
/// needed since the signature has a fixed, known length.
pub fn append_signature(serialized: &mut Vec<u8>, signature: &[u8; SIGNATURE_LEN]) {
    serialized.extend_from_slice(signature);
}

/// Split a signed payload into (message bytes, signature bytes).
///
/// Re-reads the trailing `SIGNATURE_LEN` bytes as the signature suffix;
/// everything before it is the message that was actually signed.
pub fn split_signature(payload: &[u8]) -> CodecResult<(&[u8], &[u8; SIGNATURE_LEN])> {
    if payload.len() < SIGNATURE_LEN {
        return Err(CodecError::MalformedMessage(
            "payload shorter than a signature suffix".to_string(),
        ));
    }
    let split_at = payload.len() - SIGNATURE_LEN;
    let (message, sig) = payload.split_at(split_at);
    Ok((message, sig.try_into().expect("sliced to SIGNATURE_LEN")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_recovers_message_and_signature() {
        let mut payload = b"hello".to_vec();
        let sig = [7u8; SIGNATURE_LEN];
        append_signature(&mut payload, &sig);

        let (message, found_sig) = split_signature(&payload).unwrap();
        assert_eq!(message, b"hello");
        assert_eq!(found_sig, &sig);
    }

    #[test]
    fn too_short_payload_is_malformed() {
        let payload = vec![0u8; SIGNATURE_LEN - 1];
        assert!(split_signature(&payload).is_err());
    }
}
