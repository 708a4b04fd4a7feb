//! Drives one watched table through its download/upload/live-sync lifecycle
//! against a connector and a watcher, as a standalone state-machine handle
//! an embedding engine can start, stop, and poke.

mod backoff;
mod cipher;
mod error;
mod fsm;
mod payload;
mod table;

pub use backoff::LiveSyncBackoff;
pub use cipher::PayloadCipher;
pub use error::{TableSyncError, TableSyncResult};
pub use fsm::{TableInput, TableMachine, TableMachineState, TableState};
pub use payload::{data_id, RowEnvelope};
pub use table::TableSync;

pub use sync_client_watcher::ResyncMode;
