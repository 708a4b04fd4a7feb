use crate::config::ClientConfig;
use crate::error::{EngineError, EngineResult};
use crate::fsm::{EngineInput, EngineMachine, EngineState};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use sync_client_connector::{Connector, ConnectorConfig, Credentials, DeviceContext};
use sync_client_table::{PayloadCipher, TableState, TableSync};
use sync_client_watcher::{ChangeNotifier, TableConfig, Watcher};
use sync_protocol::Message;
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};
use uuid::Uuid;

const ERROR_EVENT_CAPACITY: usize = 64;

/// One table registered against one open database, keyed for lookup and
/// teardown.
type TableKey = (String, String);

/// Top-level owning component graph for a signed-in account: one connector,
/// any number of watched databases, and the per-table sync machines running
/// against them. Shaped like `ymir::session::SessionManager`: an internal
/// FSM tracking transient lifecycle phases, driven by a background task
/// spawned off a `Weak` handle so the engine can be dropped cleanly.
pub struct Engine {
    connector: Arc<Connector>,
    cipher: Arc<dyn PayloadCipher>,
    fsm: Mutex<EngineMachine>,
    state_tx: watch::Sender<EngineState>,
    watchers: Mutex<HashMap<String, Arc<Watcher>>>,
    tables: Mutex<HashMap<TableKey, Arc<TableSync>>>,
    error_tx: broadcast::Sender<EngineError>,
}

impl Engine {
    /// `identity` is the device's signing/encryption capability (normally a
    /// `sync_crypto::CryptoCore`, which implements both `DeviceSigner` and
    /// `PayloadCipher`); `credentials` is whichever handshake variant the
    /// caller has already prepared (fresh `Register`, returning `Login`, or
    /// an enrollment `Access`).
    pub fn new(
        config: ClientConfig,
        identity: Arc<dyn sync_client_connector::DeviceSigner>,
        credentials: Credentials,
        cipher: Arc<dyn PayloadCipher>,
    ) -> Arc<Self> {
        let connector_config = ConnectorConfig {
            server_addr: config.server_addr,
            ping_interval: config.ping_interval,
            missed_pong_limit: config.missed_pong_limit,
        };
        let connector = Arc::new(Connector::new(connector_config, DeviceContext { identity, credentials }));
        let (state_tx, _) = watch::channel(EngineState::Inactive);
        let (error_tx, _) = broadcast::channel(ERROR_EVENT_CAPACITY);

        Arc::new(Self {
            connector,
            cipher,
            fsm: Mutex::new(EngineMachine::new()),
            state_tx,
            watchers: Mutex::new(HashMap::new()),
            tables: Mutex::new(HashMap::new()),
            error_tx,
        })
    }

    pub fn state(&self) -> watch::Receiver<EngineState> {
        self.state_tx.subscribe()
    }

    pub fn device_id(&self) -> Option<Uuid> {
        *self.connector.device_id().borrow()
    }

    /// Aggregated stream of table-level failures and the lifecycle-level
    /// errors this engine itself raises, so the embedding application has
    /// one place to watch rather than polling every `TableSync`.
    pub fn subscribe_errors(&self) -> broadcast::Receiver<EngineError> {
        self.error_tx.subscribe()
    }

    /// Starts the connector's handshake and moves the lifecycle from
    /// `Inactive` to `SigningIn`, resolving to `TableSync` once the
    /// connector reaches a usable state or to `Error` if the connection
    /// never comes up. Panics if called more than once.
    pub fn start(self: &Arc<Self>) -> EngineResult<()> {
        self.transition(EngineInput::SignIn)?;
        self.connector.start();

        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let engine = match weak.upgrade() {
                Some(engine) => engine,
                None => return,
            };
            let mut connector_state = engine.connector.state();
            loop {
                if connector_state.borrow().is_usable() {
                    break;
                }
                if connector_state.changed().await.is_err() {
                    let _ = engine.transition(EngineInput::SignInFailed);
                    return;
                }
            }
            if let Err(err) = engine.transition(EngineInput::SignInSuccess) {
                warn!(error = %err, "failed to record connector reaching Ready");
            }
        });

        Ok(())
    }

    /// Opens a SQLite database at `path` and registers it under `key` for
    /// later `add_table` calls. One `Watcher` is kept per open database
    /// connection, per the engine's ownership of "watchers, one per
    /// database connection".
    pub async fn open_database(self: &Arc<Self>, key: impl Into<String>, path: &Path) -> EngineResult<Arc<Watcher>> {
        let key = key.into();
        if self.watchers.lock().expect("lock poisoned").contains_key(&key) {
            return Err(EngineError::DatabaseAlreadyOpen);
        }
        let watcher = Arc::new(Watcher::open(path, ChangeNotifier::new()).await?);
        self.watchers.lock().expect("lock poisoned").insert(key, watcher.clone());
        Ok(watcher)
    }

    /// Registers a table on a previously opened database and starts its
    /// sync machine immediately.
    pub async fn add_table(self: &Arc<Self>, db_key: &str, table_config: TableConfig) -> EngineResult<Arc<TableSync>> {
        let watcher = self
            .watchers
            .lock()
            .expect("lock poisoned")
            .get(db_key)
            .cloned()
            .ok_or_else(|| EngineError::UnknownDatabase(db_key.to_string()))?;

        let table_name = table_config.table.clone();
        watcher.add_table(table_config).await?;

        let table_sync = Arc::new(TableSync::new(table_name.clone(), watcher, self.connector.clone(), self.cipher.clone()));
        table_sync.start();
        self.watch_table_errors(table_sync.clone(), table_name.clone());

        self.tables.lock().expect("lock poisoned").insert((db_key.to_string(), table_name), table_sync.clone());
        Ok(table_sync)
    }

    /// Forwards a table's terminal `Error` state into the engine's
    /// aggregated error stream without forcing the whole engine into
    /// `Error` — a single misbehaving table shouldn't stop sync on every
    /// other table.
    fn watch_table_errors(self: &Arc<Self>, table_sync: Arc<TableSync>, table: String) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut state = table_sync.state();
            loop {
                if *state.borrow() == TableState::Error {
                    let Some(engine) = weak.upgrade() else { return };
                    let _ = engine.error_tx.send(EngineError::TableFailed { table: table.clone() });
                }
                if state.changed().await.is_err() {
                    return;
                }
            }
        });
    }

    /// Two-phase account removal: the server-side device removal first,
    /// then `after_server_removed` for the host app's own identity-provider
    /// cleanup. Either phase failing leaves the lifecycle in `Error` rather
    /// than silently returning to `Inactive`.
    pub async fn delete_account<F, Fut>(self: &Arc<Self>, after_server_removed: F) -> EngineResult<()>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<(), EngineError>>,
    {
        self.transition(EngineInput::DeleteAccount)?;

        let device_id = self.device_id().ok_or_else(|| {
            EngineError::IllegalTransition("deleteAccount requested before the connector has a device id".to_string())
        })?;

        let result = self.remove_this_device(device_id).await;
        if let Err(err) = result {
            let _ = self.transition(EngineInput::DeleteFailed);
            return Err(err);
        }

        if let Err(err) = after_server_removed().await {
            let _ = self.transition(EngineInput::DeleteFailed);
            return Err(err);
        }

        self.transition(EngineInput::DeleteComplete)?;
        info!(device_id = %device_id, "account deleted");
        Ok(())
    }

    async fn remove_this_device(&self, device_id: Uuid) -> EngineResult<()> {
        let (_token, rx) = self.connector.request(Message::Remove(sync_protocol::Remove { device_id }))?;
        match rx.await {
            Ok(Ok(Message::RemoveAck(_))) => Ok(()),
            Ok(Ok(_)) => Err(EngineError::IllegalTransition("server replied to Remove with an unexpected message".to_string())),
            Ok(Err(err)) => Err(EngineError::Connector(err)),
            Err(_) => Err(EngineError::Connector(sync_client_connector::ConnectorError::Disconnected)),
        }
    }

    /// Stops every table's sync machine, the connector, and returns the
    /// lifecycle to `Inactive`.
    pub fn stop(self: &Arc<Self>) -> EngineResult<()> {
        self.transition(EngineInput::Stop)?;
        for table_sync in self.tables.lock().expect("lock poisoned").values() {
            table_sync.stop();
        }
        self.connector.shutdown();
        self.transition(EngineInput::StopComplete)?;
        Ok(())
    }

    fn transition(&self, input: EngineInput) -> EngineResult<EngineState> {
        let mut fsm = self.fsm.lock().expect("lock poisoned");
        let old_state = fsm.state().clone();
        fsm.consume(&input)?;
        let new_state = fsm.state().clone();
        drop(fsm);

        if old_state != new_state {
            info!(?old_state, ?new_state, "engine lifecycle transition");
            let _ = self.state_tx.send(new_state.clone());
        }
        Ok(new_state)
    }
}
