use thiserror::Error;

#[derive(Error, Debug)]
pub enum WatcherError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("table {0} has a composite primary key, which is not supported")]
    CompositePrimaryKey(String),

    #[error("table {0} is not registered with this watcher")]
    UnknownTable(String),

    #[error("invalid identifier: {0:?}")]
    InvalidIdentifier(String),

    #[error("invalid shadow timestamp: {0:?}")]
    InvalidTimestamp(String),
}

pub type WatcherResult<T> = Result<T, WatcherError>;

pub(crate) fn from_tokio_rusqlite(e: tokio_rusqlite::Error) -> WatcherError {
    match e {
        tokio_rusqlite::Error::Rusqlite(e) => WatcherError::Sqlite(e),
        tokio_rusqlite::Error::Close(_) => WatcherError::Connection("connection closed".to_string()),
        other => WatcherError::Connection(other.to_string()),
    }
}
