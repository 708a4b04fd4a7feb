//! Drives one watched table's [`fsm::TableMachine`] against a
//! [`sync_client_connector::Connector`] and a [`sync_client_watcher::Watcher`].
//!
//! Shaped like `sync_client_connector::connector::Connector`: a handle that
//! owns an unbounded command channel and a background task, exposing state
//! only through a `watch` channel. `start`/`stop`/`force_sync`/
//! `trigger_upload` mirror the connector's own `start`/`shutdown`/`cancel`
//! split between "submit a command" (cheap, non-blocking) and "the loop
//! that actually does the work".

use crate::backoff::LiveSyncBackoff;
use crate::cipher::PayloadCipher;
use crate::error::TableSyncResult;
use crate::fsm::{TableInput, TableMachine, TableState};
use crate::payload::{self, RowEnvelope};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use sync_client_connector::{ChangeEvent, Connector, ConnectorState};
use sync_client_watcher::{IncomingChange, ResyncMode, Watcher};
use sync_protocol::{Change, Message};
use tokio::sync::{mpsc, watch};
use tracing::warn;

enum Command {
    Start,
    Stop,
    TriggerSync,
    ForceSync,
    TriggerUpload,
    /// Clear this table's local and (best-effort) server-side data. Applies
    /// `mode` via `Watcher::resync_table` before transitioning through
    /// `ActiveDelTable`; `mode` should normally include at least
    /// `CLEAR_LOCAL_DATA`.
    DelTable(ResyncMode),
}

pub struct TableSync {
    cmd_tx: mpsc::UnboundedSender<Command>,
    cmd_rx: Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
    state_tx: watch::Sender<TableState>,
    table: String,
    watcher: Arc<Watcher>,
    connector: Arc<Connector>,
    cipher: Arc<dyn PayloadCipher>,
}

impl TableSync {
    pub fn new(table: impl Into<String>, watcher: Arc<Watcher>, connector: Arc<Connector>, cipher: Arc<dyn PayloadCipher>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(TableState::Inactive);
        Self { cmd_tx, cmd_rx: Mutex::new(Some(cmd_rx)), state_tx, table: table.into(), watcher, connector, cipher }
    }

    /// Spawns the background drive loop and immediately submits `start`.
    /// Panics if called more than once.
    pub fn start(&self) {
        let cmd_rx = self.cmd_rx.lock().expect("lock poisoned").take().expect("TableSync already started");
        let table = self.table.clone();
        let watcher = self.watcher.clone();
        let connector = self.connector.clone();
        let cipher = self.cipher.clone();
        let state_tx = self.state_tx.clone();
        tokio::spawn(run(table, watcher, connector, cipher, cmd_rx, state_tx));
        let _ = self.cmd_tx.send(Command::Start);
    }

    pub fn state(&self) -> watch::Receiver<TableState> {
        self.state_tx.subscribe()
    }

    /// Cancel every in-flight operation, drain nothing further, and return
    /// to `Inactive`.
    pub fn stop(&self) {
        let _ = self.cmd_tx.send(Command::Stop);
    }

    /// Ask the live-sync/idle loop to run a catch-up download pass.
    pub fn trigger_sync(&self) {
        let _ = self.cmd_tx.send(Command::TriggerSync);
    }

    /// Cancel only the current in-flight request and re-enter `Init`,
    /// without clearing anything already queued locally.
    pub fn force_sync(&self) {
        let _ = self.cmd_tx.send(Command::ForceSync);
    }

    pub fn trigger_upload(&self) {
        let _ = self.cmd_tx.send(Command::TriggerUpload);
    }

    pub fn delete_table(&self, mode: ResyncMode) {
        let _ = self.cmd_tx.send(Command::DelTable(mode));
    }
}

async fn run(
    table: String,
    watcher: Arc<Watcher>,
    connector: Arc<Connector>,
    cipher: Arc<dyn PayloadCipher>,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    state_tx: watch::Sender<TableState>,
) {
    let mut machine = TableMachine::new();
    let mut changes = connector.subscribe_changes();
    let mut local_notify = watcher.notifier().subscribe();
    let mut connector_state = connector.state();
    let mut backoff = LiveSyncBackoff::new();
    let mut download_queue: VecDeque<(u64, u32, Vec<u8>, Vec<u8>)> = VecDeque::new();
    let mut pending_del_mode = ResyncMode::empty();

    loop {
        let current = TableState::from(machine.state());
        let _ = state_tx.send(current);

        let input = match current {
            TableState::Inactive => wait_for_command(&mut cmd_rx, &mut pending_del_mode).await,

            TableState::ActiveInit => {
                if !pending_del_mode.is_empty() {
                    TableInput::DelTable
                } else {
                    step_init(&watcher, &table, &connector_state).await
                }
            }

            TableState::ActiveDelTable => {
                step_del_table(&watcher, &table, std::mem::replace(&mut pending_del_mode, ResyncMode::empty())).await
            }

            TableState::PassiveSyncDlRunning => {
                step_dl_running(&connector, &mut changes, &mut download_queue, &mut cmd_rx).await
            }

            TableState::PassiveSyncProcRunning => {
                step_proc_running(&watcher, &connector, &table, cipher.as_ref(), &mut download_queue).await
            }

            TableState::PassiveSyncUploading | TableState::LiveSyncUlFiber => {
                step_uploading(&watcher, &connector, &table, cipher.as_ref()).await
            }

            TableState::LiveSyncLsActive => {
                step_live_sync_wait(&watcher, &table, cipher.as_ref(), &mut changes, &mut local_notify, &mut cmd_rx).await
            }

            TableState::Synchronized => step_synchronized_wait(&mut changes, &mut local_notify, &mut cmd_rx).await,

            TableState::Offline => step_wait_online(&mut connector_state, &mut cmd_rx).await,

            TableState::NetworkError => step_backoff(&mut backoff, &mut cmd_rx).await,

            TableState::Error => wait_for_stop(&mut cmd_rx).await,
        };

        if machine.consume(&input).is_err() {
            warn!(table = %table, ?current, "state machine rejected input, ignoring");
        }
    }
}

/// `Inactive`/terminal-wait states all reduce to "block on the command
/// channel until something actionable arrives".
async fn wait_for_command(cmd_rx: &mut mpsc::UnboundedReceiver<Command>, pending_del_mode: &mut ResyncMode) -> TableInput {
    loop {
        match cmd_rx.recv().await {
            Some(Command::Start) => return TableInput::Start,
            Some(Command::DelTable(mode)) => {
                *pending_del_mode = mode;
                return TableInput::Start;
            }
            Some(_) | None => continue,
        }
    }
}

async fn wait_for_stop(cmd_rx: &mut mpsc::UnboundedReceiver<Command>) -> TableInput {
    loop {
        match cmd_rx.recv().await {
            Some(Command::Stop) => return TableInput::Stop,
            Some(_) | None => continue,
        }
    }
}

/// Resolve `last_sync` and decide whether this table needs a catch-up
/// download pass or can go straight to its live subscription.
async fn step_init(watcher: &Watcher, table: &str, connector_state: &watch::Receiver<ConnectorState>) -> TableInput {
    if !connector_state.borrow().is_usable() {
        return TableInput::NetError;
    }
    match watcher.last_sync(table).await {
        Ok(Some(_)) => TableInput::SyncReady,
        Ok(None) => TableInput::DataReady,
        Err(err) => {
            warn!(table = %table, error = %err, "failed to resolve last_sync");
            TableInput::ErrorEvent
        }
    }
}

async fn step_del_table(watcher: &Watcher, table: &str, mode: ResyncMode) -> TableInput {
    match watcher.resync_table(table, mode).await {
        Ok(clear_server_requested) => {
            if clear_server_requested {
                // The wire protocol (spec §6's message catalogue) has no
                // dedicated remove-table message, only `Remove` for a
                // device. Until the protocol grows one, CLEAR_SERVER_DATA
                // only clears local state; the server's copy reappears on
                // the next full download pass.
                warn!(table = %table, "CLEAR_SERVER_DATA requested but the wire protocol has no remove-table message; cleared locally only");
            }
            TableInput::DelTableDone
        }
        Err(err) => {
            warn!(table = %table, error = %err, "resync_table failed");
            TableInput::ErrorEvent
        }
    }
}

/// Fire `Sync` and collect every `Changed` push until `LastChanged`, or
/// react to a `Stop`/`ForceSync` command arriving mid-wait.
async fn step_dl_running(
    connector: &Connector,
    changes: &mut tokio::sync::broadcast::Receiver<ChangeEvent>,
    queue: &mut VecDeque<(u64, u32, Vec<u8>, Vec<u8>)>,
    cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
) -> TableInput {
    connector.trigger_sync();
    loop {
        tokio::select! {
            event = changes.recv() => match event {
                Ok(ChangeEvent::Changed(changed)) => {
                    queue.push_back((changed.blob_id, changed.key_index, changed.salt, changed.ciphertext));
                }
                Ok(ChangeEvent::LastChanged) => return TableInput::DlReady,
                Ok(ChangeEvent::ConnectionLost) => return TableInput::NetError,
                Ok(ChangeEvent::Ready) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return TableInput::NetError,
            },
            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Stop) => return TableInput::Stop,
                Some(Command::ForceSync) => return TableInput::ForceSync,
                Some(_) | None => continue,
            },
        }
    }
}

/// Decrypt and apply every queued download in arrival order — the ordering
/// guarantee that an upload never races a pending download for the same
/// table.
async fn step_proc_running(
    watcher: &Watcher,
    connector: &Connector,
    table: &str,
    cipher: &dyn PayloadCipher,
    queue: &mut VecDeque<(u64, u32, Vec<u8>, Vec<u8>)>,
) -> TableInput {
    while let Some((blob_id, key_index, salt, ciphertext)) = queue.pop_front() {
        match apply_incoming(watcher, table, cipher, key_index, &salt, &ciphertext).await {
            Ok(()) => connector.ack_changed(blob_id),
            Err(err) => {
                warn!(table = %table, blob_id, error = %err, "failed to apply downloaded row, acking anyway to avoid a re-download loop");
                connector.ack_changed(blob_id);
            }
        }
    }
    TableInput::ProcReady
}

async fn apply_incoming(
    watcher: &Watcher,
    table: &str,
    cipher: &dyn PayloadCipher,
    key_index: u32,
    salt: &[u8],
    ciphertext: &[u8],
) -> TableSyncResult<()> {
    let plain = cipher.decrypt(key_index, salt, ciphertext)?;
    let envelope: RowEnvelope = payload::decode(&plain)?;
    let should_store =
        watcher.should_store(table, envelope.key.clone(), envelope.modified, None, envelope.data.clone()).await?;
    if should_store {
        watcher
            .store_data(
                table,
                IncomingChange { key: envelope.key, modified: envelope.modified, uploaded: None, data: envelope.data },
            )
            .await?;
    }
    Ok(())
}

/// Shared by `PassiveSyncUploading` and `LiveSyncUlFiber`: load the next
/// locally-changed row, encrypt it, upload it, and wait for the ack before
/// loading the next one (spec §5's one-row-at-a-time upload back-pressure).
async fn step_uploading(watcher: &Watcher, connector: &Connector, table: &str, cipher: &dyn PayloadCipher) -> TableInput {
    let change = match watcher.load_data(table).await {
        Ok(Some(change)) => change,
        Ok(None) => return TableInput::SyncReady,
        Err(err) => {
            warn!(table = %table, error = %err, "load_data failed");
            return TableInput::ErrorEvent;
        }
    };

    let envelope = RowEnvelope { key: change.key.clone(), modified: change.modified, data: change.data };
    let plain = match payload::encode(&envelope) {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(table = %table, error = %err, "failed to encode outgoing row");
            return TableInput::ErrorEvent;
        }
    };
    let (key_index, salt, ciphertext) = match cipher.encrypt(&plain) {
        Ok(parts) => parts,
        Err(err) => {
            warn!(table = %table, error = %err, "failed to encrypt outgoing row");
            return TableInput::ErrorEvent;
        }
    };

    let data_id = payload::data_id(table, &change.key);
    let request = Message::Change(Change { data_id, key_index, salt: salt.to_vec(), ciphertext });
    let (_token, rx) = match connector.request(request) {
        Ok(pair) => pair,
        Err(_) => return TableInput::NetError,
    };

    match rx.await {
        Ok(Ok(Message::ChangeAck(_))) => {
            if let Err(err) = watcher.mark_unchanged(table, change.key, change.modified).await {
                warn!(table = %table, error = %err, "mark_unchanged failed after a successful upload");
            }
            TableInput::UlContinue
        }
        Ok(Ok(_)) => {
            warn!(table = %table, "server replied to Change with an unexpected message");
            TableInput::ErrorEvent
        }
        Ok(Err(sync_client_connector::ConnectorError::Disconnected)) => TableInput::NetError,
        Ok(Err(_)) => TableInput::ErrorEvent,
        Err(_) => TableInput::NetError,
    }
}

async fn step_live_sync_wait(
    watcher: &Watcher,
    table: &str,
    cipher: &dyn PayloadCipher,
    changes: &mut tokio::sync::broadcast::Receiver<ChangeEvent>,
    local_notify: &mut tokio::sync::broadcast::Receiver<String>,
    cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
) -> TableInput {
    loop {
        tokio::select! {
            event = changes.recv() => match event {
                Ok(ChangeEvent::Changed(changed)) => {
                    match apply_incoming(watcher, table, cipher, changed.key_index, &changed.salt, &changed.ciphertext).await {
                        Ok(()) => return TableInput::DataReady,
                        Err(err) => {
                            warn!(table = %table, error = %err, "failed to apply a live-sync push");
                            return TableInput::ErrorEvent;
                        }
                    }
                }
                Ok(ChangeEvent::ConnectionLost) => return TableInput::NetError,
                Ok(ChangeEvent::Ready) | Ok(ChangeEvent::LastChanged) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return TableInput::NetError,
            },
            notify = local_notify.recv() => match notify {
                Ok(notified_table) if notified_table == table => return TableInput::TriggerUpload,
                Ok(_) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => return TableInput::TriggerUpload,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => continue,
            },
            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Stop) => return TableInput::Stop,
                Some(Command::ForceSync) => return TableInput::ForceSync,
                Some(Command::TriggerUpload) => return TableInput::TriggerUpload,
                Some(Command::TriggerSync) => return TableInput::TriggerSync,
                Some(Command::DelTable(_)) | Some(Command::Start) | None => continue,
            },
        }
    }
}

async fn step_synchronized_wait(
    changes: &mut tokio::sync::broadcast::Receiver<ChangeEvent>,
    local_notify: &mut tokio::sync::broadcast::Receiver<String>,
    cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
) -> TableInput {
    tokio::select! {
        _ = changes.recv() => TableInput::TriggerSync,
        _ = local_notify.recv() => TableInput::TriggerUpload,
        cmd = cmd_rx.recv() => match cmd {
            Some(Command::Stop) => TableInput::Stop,
            Some(Command::ForceSync) => TableInput::ForceSync,
            Some(Command::TriggerUpload) => TableInput::TriggerUpload,
            Some(Command::TriggerSync) => TableInput::TriggerSync,
            Some(Command::DelTable(_)) | Some(Command::Start) | None => TableInput::TriggerSync,
        },
    }
}

async fn step_wait_online(connector_state: &mut watch::Receiver<ConnectorState>, cmd_rx: &mut mpsc::UnboundedReceiver<Command>) -> TableInput {
    loop {
        tokio::select! {
            changed = connector_state.changed() => {
                if changed.is_err() {
                    continue;
                }
                if connector_state.borrow().is_usable() {
                    return TableInput::GoOnline;
                }
            }
            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Stop) => return TableInput::Stop,
                Some(_) | None => continue,
            },
        }
    }
}

async fn step_backoff(backoff: &mut LiveSyncBackoff, cmd_rx: &mut mpsc::UnboundedReceiver<Command>) -> TableInput {
    let delay = backoff.next();
    tokio::select! {
        _ = tokio::time::sleep(delay) => TableInput::TriggerSync,
        cmd = cmd_rx.recv() => match cmd {
            Some(Command::Stop) => TableInput::Stop,
            Some(Command::ForceSync) => TableInput::ForceSync,
            Some(_) | None => TableInput::TriggerSync,
        },
    }
}
