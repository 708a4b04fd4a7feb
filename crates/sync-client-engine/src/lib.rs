//! Top-level lifecycle for one signed-in account: owns the connector, every
//! open database's watcher, and every registered table's sync machine, and
//! routes sign-in/sign-out/delete-account events across all three.

mod config;
mod engine;
mod error;
mod fsm;

pub use config::ClientConfig;
pub use engine::Engine;
pub use error::{EngineError, EngineResult};
pub use fsm::{EngineInput, EngineMachine, EngineState};

pub use sync_client_connector::{Credentials, DeviceContext, DeviceSigner};
pub use sync_client_table::PayloadCipher;
pub use sync_client_watcher::TableConfig;
