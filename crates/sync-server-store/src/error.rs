use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("account quota exceeded")]
    QuotaExceeded,

    #[error("no such {0}")]
    NotFound(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

pub(crate) fn from_tokio_rusqlite(e: tokio_rusqlite::Error) -> StoreError {
    match e {
        tokio_rusqlite::Error::Rusqlite(e) => StoreError::Sqlite(e),
        tokio_rusqlite::Error::Close(_) => StoreError::Connection("connection closed".to_string()),
        other => StoreError::Connection(other.to_string()),
    }
}
