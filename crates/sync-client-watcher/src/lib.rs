//! Installs shadow tables and change-tracking triggers over caller-supplied
//! tables in a local SQLite database, and exposes the primitives a table
//! sync state machine needs: decide whether a downloaded row supersedes the
//! local one, apply it, and pull the next locally-changed row for upload.

mod change_state;
mod config;
mod error;
mod executor;
mod hashing;
mod identifier;
mod notify;
mod resync;
mod schema;
mod watcher;

pub use config::{TableConfig, TableReference};
pub use error::{WatcherError, WatcherResult};
pub use notify::ChangeNotifier;
pub use resync::ResyncMode;
pub use watcher::{IncomingChange, OutgoingChange, Watcher};

pub use rusqlite::types::Value;
