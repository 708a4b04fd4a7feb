use sync_codec::{CodecError, CodecResult, MessageReader, MessageWriter};

/// The wire error taxonomy of the protocol (spec §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorType {
    /// Terminal; the client must upgrade.
    IncompatibleVersion,
    /// Recoverable; sender retries from Idle.
    UnexpectedMessage,
    /// Recoverable; client reconnects with backoff.
    ServerError,
    /// Terminal for the connection; client disconnects.
    ClientError,
    /// Terminal for the session.
    AuthenticationError,
    /// Enrollment denied or partner unreachable.
    AccessError,
    /// Key index mismatch; client must refresh.
    KeyIndexError,
    /// Concurrent rotation; retry later.
    KeyPendingError,
    /// Upload rejected by quota.
    QuotaHitError,
}

impl ErrorType {
    /// Whether the error taxonomy itself marks this kind as recoverable
    /// by default. Session code may still override this with a specific
    /// `canRecover` flag on the wire (e.g. a `ServerError` right before a
    /// forced disconnect), but this is the sensible default per kind.
    pub fn default_recoverable(self) -> bool {
        matches!(
            self,
            ErrorType::UnexpectedMessage
                | ErrorType::ServerError
                | ErrorType::KeyPendingError
                | ErrorType::QuotaHitError
        )
    }

    fn tag(self) -> u8 {
        match self {
            ErrorType::IncompatibleVersion => 0,
            ErrorType::UnexpectedMessage => 1,
            ErrorType::ServerError => 2,
            ErrorType::ClientError => 3,
            ErrorType::AuthenticationError => 4,
            ErrorType::AccessError => 5,
            ErrorType::KeyIndexError => 6,
            ErrorType::KeyPendingError => 7,
            ErrorType::QuotaHitError => 8,
        }
    }

    fn from_tag(tag: u8) -> CodecResult<Self> {
        Ok(match tag {
            0 => ErrorType::IncompatibleVersion,
            1 => ErrorType::UnexpectedMessage,
            2 => ErrorType::ServerError,
            3 => ErrorType::ClientError,
            4 => ErrorType::AuthenticationError,
            5 => ErrorType::AccessError,
            6 => ErrorType::KeyIndexError,
            7 => ErrorType::KeyPendingError,
            8 => ErrorType::QuotaHitError,
            other => return Err(CodecError::MalformedMessage(format!("unknown error type tag {other}"))),
        })
    }

    pub(crate) fn write(self, w: &mut MessageWriter) {
        w.write_u8(self.tag());
    }

    pub(crate) fn read(r: &mut MessageReader) -> CodecResult<Self> {
        Self::from_tag(r.read_u8()?)
    }
}
