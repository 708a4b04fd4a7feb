use thiserror::Error;

#[derive(Error, Debug)]
pub enum TableSyncError {
    #[error("illegal transition: {0}")]
    IllegalTransition(String),

    #[error("watcher error: {0}")]
    Watcher(#[from] sync_client_watcher::WatcherError),

    #[error("connector error: {0}")]
    Connector(#[from] sync_client_connector::ConnectorError),

    #[error("crypto error: {0}")]
    Crypto(#[from] sync_crypto::CryptoError),

    #[error("payload encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("payload decoding error: {0}")]
    Payload(#[from] crate::payload::PayloadError),

    #[error("request was cancelled before it completed")]
    Cancelled,
}

pub type TableSyncResult<T> = Result<T, TableSyncError>;

impl From<rust_fsm::TransitionImpossibleError> for TableSyncError {
    fn from(_: rust_fsm::TransitionImpossibleError) -> Self {
        TableSyncError::IllegalTransition("state machine rejected this input".to_string())
    }
}
