use sync_protocol::ErrorType;
use thiserror::Error;

/// A recognised protocol-level fault: the session sends the client a typed
/// `Error` message naming one of these and moves to the terminal state.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolFault {
    #[error("incompatible protocol version")]
    IncompatibleVersion,
    #[error("message not valid in the current session state")]
    UnexpectedMessage,
    #[error("authentication failed")]
    AuthFailed,
    #[error("access denied")]
    AccessDenied,
    #[error("account quota exceeded")]
    QuotaExceeded,
    #[error("proposed key index does not match the account's next index")]
    KeyIndexMismatch,
    #[error("a key rotation is already pending for this account")]
    PendingKeyConflict,
    #[error("message could not be decoded")]
    MalformedMessage,
}

impl ProtocolFault {
    pub fn wire_error(self) -> (ErrorType, &'static str, bool) {
        match self {
            ProtocolFault::IncompatibleVersion => (ErrorType::IncompatibleVersion, "incompatible protocol version", false),
            ProtocolFault::UnexpectedMessage => (ErrorType::UnexpectedMessage, "unexpected message", true),
            ProtocolFault::AuthFailed => (ErrorType::AuthenticationError, "authentication failed", false),
            ProtocolFault::AccessDenied => (ErrorType::AccessError, "access denied", false),
            ProtocolFault::QuotaExceeded => (ErrorType::QuotaHitError, "account quota exceeded", true),
            ProtocolFault::KeyIndexMismatch => (ErrorType::KeyIndexError, "stale key index", true),
            ProtocolFault::PendingKeyConflict => (ErrorType::KeyPendingError, "key rotation already pending", true),
            ProtocolFault::MalformedMessage => (ErrorType::ClientError, "malformed message", false),
        }
    }
}

/// What a message handler can fail with. `Fault` is sent to the client as a
/// typed, recognised error; `Store` is an infrastructure failure that gets
/// a recoverable `ServerError` and a grace-period disconnect.
#[derive(Error, Debug)]
pub enum HandlerError {
    #[error(transparent)]
    Fault(#[from] ProtocolFault),

    #[error("change store error: {0}")]
    Store(#[from] sync_server_store::StoreError),
}

pub type HandlerResult<T> = Result<T, HandlerError>;

/// Transport/codec-level failure: unrecoverable, the connection is dropped
/// without a chance to send a typed `Error` reply.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] sync_codec::CodecError),

    #[error("idle timeout")]
    IdleTimeout,

    #[error("peer closed the connection")]
    Closed,
}

pub type SessionResult<T> = Result<T, SessionError>;
