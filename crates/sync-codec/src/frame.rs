use crate::{CodecError, CodecResult};
use bytes::{Buf, BytesMut};

/// The single reserved byte that stands for a ping/pong outside normal
/// framing. It can never be mistaken for the start of a typed message
/// because a typed frame always begins with a 4-byte length prefix whose
/// first byte is essentially always zero for any realistic message size.
pub const PING_BYTE: u8 = 0xFF;

/// Default ceiling on a single frame's payload length, guarding against a
/// peer claiming an absurd length prefix and stalling the reader forever.
pub const DEFAULT_MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// Prefix `payload` with its big-endian u32 length.
pub fn encode_frame(payload: &[u8]) -> BytesMut {
    let mut framed = BytesMut::with_capacity(4 + payload.len());
    framed.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    framed.extend_from_slice(payload);
    framed
}

/// Attempt to pull one complete frame's payload out of `buf`.
///
/// Performs the "transactional read" the wire format requires: if the
/// length prefix or the full payload is not yet available, `buf` is left
/// completely untouched (nothing is consumed) and `Ok(None)` is returned,
/// signalling the caller to read more bytes off the socket and retry. Only
/// once a full frame is present is it drained from `buf`.
pub fn try_decode_frame(buf: &mut BytesMut, max_len: u32) -> CodecResult<Option<BytesMut>> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if len > max_len {
        return Err(CodecError::FrameTooLarge { len, max: max_len });
    }
    let total = 4 + len as usize;
    if buf.len() < total {
        return Ok(None);
    }
    buf.advance(4);
    Ok(Some(buf.split_to(len as usize)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_frame() {
        let mut buf = encode_frame(b"hello");
        let decoded = try_decode_frame(&mut buf, DEFAULT_MAX_FRAME_LEN).unwrap().unwrap();
        assert_eq!(&decoded[..], b"hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frame_yields_none_and_leaves_buffer_untouched() {
        let full = encode_frame(b"hello world");
        let mut partial = BytesMut::from(&full[..full.len() - 3]);
        let original_len = partial.len();
        let result = try_decode_frame(&mut partial, DEFAULT_MAX_FRAME_LEN).unwrap();
        assert!(result.is_none());
        assert_eq!(partial.len(), original_len);
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut buf = encode_frame(&vec![0u8; 100]);
        let err = try_decode_frame(&mut buf, 10).unwrap_err();
        assert!(matches!(err, CodecError::FrameTooLarge { len: 100, max: 10 }));
    }

    #[test]
    fn two_frames_back_to_back() {
        let mut buf = encode_frame(b"one");
        buf.extend_from_slice(&encode_frame(b"two"));
        let first = try_decode_frame(&mut buf, DEFAULT_MAX_FRAME_LEN).unwrap().unwrap();
        let second = try_decode_frame(&mut buf, DEFAULT_MAX_FRAME_LEN).unwrap().unwrap();
        assert_eq!(&first[..], b"one");
        assert_eq!(&second[..], b"two");
    }
}
