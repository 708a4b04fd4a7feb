use thiserror::Error;

/// Failure of a single request issued through the connector, or of the
/// connection itself while a request was in flight.
#[derive(Error, Debug)]
pub enum ConnectorError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] sync_codec::CodecError),

    #[error("server reported an error: {message} ({error_type:?})")]
    Server { error_type: sync_protocol::ErrorType, message: String },

    #[error("connection lost before a reply arrived")]
    Disconnected,

    #[error("request cancelled")]
    Cancelled,

    #[error("connector is not yet authenticated")]
    NotReady,

    #[error("the connector has shut down")]
    Closed,

    #[error("ping keepalive timed out after {0} missed pongs")]
    KeepaliveTimeout(u32),

    #[error("server reply did not match the request that was sent ({expected} got {got})")]
    UnexpectedReply { expected: &'static str, got: &'static str },
}

pub type ConnectorResult<T> = Result<T, ConnectorError>;
