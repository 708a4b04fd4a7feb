use crate::Message;
use sync_codec::{append_signature, split_signature, CodecError, CodecResult, SIGNATURE_LEN};

/// Encode an unsigned message: tag + fields, nothing else.
///
/// Panics (via a debug assertion) if called on a message that
/// [`Message::is_signed`] reports as needing a signature; use
/// [`encode_signed`] for those instead.
pub fn encode(message: &Message) -> Vec<u8> {
    debug_assert!(!message.is_signed(), "{} requires a signature", message.tag());
    message.encode()
}

/// Encode a signed message, appending the trailing fixed-length signature
/// produced by `sign` over the serialized tag+fields.
pub fn encode_signed(message: &Message, sign: impl FnOnce(&[u8]) -> [u8; SIGNATURE_LEN]) -> Vec<u8> {
    debug_assert!(message.is_signed(), "{} is not a signed message", message.tag());
    let mut bytes = message.encode();
    let signature = sign(&bytes);
    append_signature(&mut bytes, &signature);
    bytes
}

/// Decode a payload with no signature expected.
pub fn decode(payload: &[u8]) -> CodecResult<Message> {
    Message::decode(payload)
}

/// Split off and verify the trailing signature, then decode the remaining
/// tag+fields payload. `verify` receives the signed bytes and the signature
/// and returns `false` to reject.
pub fn decode_with_verify(
    payload: &[u8],
    verify: impl FnOnce(&[u8], &[u8; SIGNATURE_LEN]) -> bool,
) -> CodecResult<Message> {
    let (signed_bytes, signature) = split_signature(payload)?;
    if !verify(signed_bytes, signature) {
        return Err(CodecError::SignatureInvalid);
    }
    Message::decode(signed_bytes)
}
