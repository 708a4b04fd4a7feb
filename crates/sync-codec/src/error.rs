use thiserror::Error;

/// Errors raised while decoding or encoding a wire message.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The frame's declared length exceeds the configured maximum.
    #[error("frame of {len} bytes exceeds the maximum of {max} bytes")]
    FrameTooLarge { len: u32, max: u32 },

    /// A field could not be decoded (short read, bad length prefix, ...).
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// A length-prefixed string was not valid UTF-8.
    #[error("malformed message: invalid utf-8 in string field")]
    InvalidUtf8,

    /// The tag at the head of a frame did not match a known message name.
    #[error("malformed message: unknown tag {0:?}")]
    UnknownTag(String),

    /// The message claims a protocol version below the minimum compatible one.
    #[error("protocol version {found:?} is older than minimum compatible {min:?}")]
    VersionTooOld { found: crate::Version, min: crate::Version },

    /// The signature suffix did not verify against the prefix bytes.
    #[error("signature is invalid")]
    SignatureInvalid,
}

pub type CodecResult<T> = Result<T, CodecError>;
