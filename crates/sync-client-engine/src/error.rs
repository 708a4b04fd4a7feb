use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("illegal lifecycle transition: {0}")]
    IllegalTransition(String),

    #[error("watcher error: {0}")]
    Watcher(#[from] sync_client_watcher::WatcherError),

    #[error("connector error: {0}")]
    Connector(#[from] sync_client_connector::ConnectorError),

    #[error("crypto error: {0}")]
    Crypto(#[from] sync_crypto::CryptoError),

    #[error("table {table} entered Error state")]
    TableFailed { table: String },

    #[error("this database key is already open")]
    DatabaseAlreadyOpen,

    #[error("no database open under key {0}")]
    UnknownDatabase(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

impl From<rust_fsm::TransitionImpossibleError> for EngineError {
    fn from(_: rust_fsm::TransitionImpossibleError) -> Self {
        EngineError::IllegalTransition("lifecycle state machine rejected this input".to_string())
    }
}
