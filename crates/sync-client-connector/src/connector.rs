use crate::backoff::ReconnectBackoff;
use crate::credentials::{Credentials, DeviceContext, DeviceSigner};
use crate::error::{ConnectorError, ConnectorResult};
use crate::events::{ChangeEvent, EnrollmentEvent};
use crate::pending::PendingQueue;
use crate::state::ConnectorState;
use crate::token::CancellationToken;
use crate::transport::{Incoming, Transport};
use std::sync::Mutex;
use sync_codec::protocol_version;
use sync_protocol::{Access, ChangedAck, Deny, Login, Message, Register};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, warn};
use uuid::Uuid;

const CHANGE_EVENT_CAPACITY: usize = 256;
const ENROLLMENT_EVENT_CAPACITY: usize = 16;

#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    pub server_addr: String,
    pub ping_interval: Duration,
    pub missed_pong_limit: u32,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            server_addr: String::new(),
            ping_interval: Duration::from_secs(20),
            missed_pong_limit: 2,
        }
    }
}

enum Command {
    Request { message: Message, token: CancellationToken, reply: oneshot::Sender<ConnectorResult<Message>> },
    Cancel(CancellationToken),
    Fire(Message),
    Shutdown,
}

/// Owns the single logical connection to the sync server. Reconnects on its
/// own with the fixed backoff table; callers interact with it purely
/// through channels, so a reconnect is invisible except for the state/event
/// streams pausing at `Disconnected`/`ConnectionLost`.
pub struct Connector {
    cmd_tx: mpsc::UnboundedSender<Command>,
    cmd_rx: Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
    state_tx: watch::Sender<ConnectorState>,
    device_id_tx: watch::Sender<Option<Uuid>>,
    changes_tx: broadcast::Sender<ChangeEvent>,
    enrollment_tx: broadcast::Sender<EnrollmentEvent>,
    config: ConnectorConfig,
    context: Mutex<Option<DeviceContext>>,
}

impl Connector {
    pub fn new(config: ConnectorConfig, context: DeviceContext) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ConnectorState::Disconnected);
        let (device_id_tx, _) = watch::channel(None);
        let (changes_tx, _) = broadcast::channel(CHANGE_EVENT_CAPACITY);
        let (enrollment_tx, _) = broadcast::channel(ENROLLMENT_EVENT_CAPACITY);
        Self {
            cmd_tx,
            cmd_rx: Mutex::new(Some(cmd_rx)),
            state_tx,
            device_id_tx,
            changes_tx,
            enrollment_tx,
            config,
            context: Mutex::new(Some(context)),
        }
    }

    /// Spawns the background reconnect/drive loop. Panics if called more
    /// than once.
    pub fn start(&self) {
        let cmd_rx = self.cmd_rx.lock().expect("lock poisoned").take().expect("Connector already started");
        let context = self.context.lock().expect("lock poisoned").take().expect("Connector already started");
        let config = self.config.clone();
        let state_tx = self.state_tx.clone();
        let device_id_tx = self.device_id_tx.clone();
        let changes_tx = self.changes_tx.clone();
        let enrollment_tx = self.enrollment_tx.clone();
        tokio::spawn(run(config, context, cmd_rx, state_tx, device_id_tx, changes_tx, enrollment_tx));
    }

    pub fn state(&self) -> watch::Receiver<ConnectorState> {
        self.state_tx.subscribe()
    }

    pub fn device_id(&self) -> watch::Receiver<Option<Uuid>> {
        self.device_id_tx.subscribe()
    }

    pub fn subscribe_changes(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes_tx.subscribe()
    }

    pub fn subscribe_enrollment(&self) -> broadcast::Receiver<EnrollmentEvent> {
        self.enrollment_tx.subscribe()
    }

    /// Submit a request and get back a token (for `cancel`) plus a receiver
    /// for its reply. Only meaningful for messages the server answers
    /// one-for-one (`Change`, `DeviceChange`, `ListDevices`, `Remove`,
    /// `MacUpdate`, `KeyChange`, `NewKey`, `Accept`) — `Sync`/`ChangedAck`/
    /// `Deny` have no single reply and go through `trigger_sync`/
    /// `ack_changed`/`deny_enrollment` instead.
    pub fn request(&self, message: Message) -> ConnectorResult<(CancellationToken, oneshot::Receiver<ConnectorResult<Message>>)> {
        let token = CancellationToken::new();
        let (reply, rx) = oneshot::channel();
        self.cmd_tx.send(Command::Request { message, token, reply }).map_err(|_| ConnectorError::Closed)?;
        Ok((token, rx))
    }

    pub fn cancel(&self, token: CancellationToken) {
        let _ = self.cmd_tx.send(Command::Cancel(token));
    }

    /// Kick off (or continue) a download pass. Results arrive as
    /// `ChangeEvent::Changed`/`LastChanged` on `subscribe_changes`.
    pub fn trigger_sync(&self) {
        let _ = self.cmd_tx.send(Command::Fire(Message::Sync));
    }

    pub fn ack_changed(&self, blob_id: u64) {
        let _ = self.cmd_tx.send(Command::Fire(Message::ChangedAck(ChangedAck { blob_id })));
    }

    pub fn deny_enrollment(&self, new_device_id: Uuid) {
        let _ = self.cmd_tx.send(Command::Fire(Message::Deny(Deny { new_device_id })));
    }

    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(Command::Shutdown);
    }
}

/// Whether the just-finished connection attempt ended because the caller
/// asked to shut down (stop reconnecting) or because the connection itself
/// failed (keep reconnecting).
enum Outcome {
    Shutdown,
    Lost,
}

async fn run(
    config: ConnectorConfig,
    context: DeviceContext,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    state_tx: watch::Sender<ConnectorState>,
    device_id_tx: watch::Sender<Option<Uuid>>,
    changes_tx: broadcast::Sender<ChangeEvent>,
    enrollment_tx: broadcast::Sender<EnrollmentEvent>,
) {
    let DeviceContext { identity, credentials } = context;
    let mut backoff = ReconnectBackoff::new();

    loop {
        let _ = state_tx.send(ConnectorState::Connecting);
        match connect_and_authenticate(&config.server_addr, &identity, &credentials).await {
            Ok((transport, initial_device_id)) => {
                backoff.reset();
                if let Some(id) = initial_device_id {
                    let _ = device_id_tx.send(Some(id));
                }
                let _ = state_tx.send(ConnectorState::Ready);
                let _ = changes_tx.send(ChangeEvent::Ready);

                let mut pending = PendingQueue::new();
                let outcome = drive_connection(
                    transport,
                    &mut cmd_rx,
                    &config,
                    &identity,
                    &mut pending,
                    &state_tx,
                    &device_id_tx,
                    &changes_tx,
                    &enrollment_tx,
                )
                .await;
                pending.fail_all();
                let _ = state_tx.send(ConnectorState::Disconnected);
                let _ = changes_tx.send(ChangeEvent::ConnectionLost);

                if matches!(outcome, Outcome::Shutdown) {
                    return;
                }
            }
            Err(err) => {
                warn!(error = %err, "connector failed to connect");
                let _ = state_tx.send(ConnectorState::Disconnected);
            }
        }

        let delay = backoff.next();
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(Command::Shutdown) | None => return,
                    Some(Command::Request { reply, .. }) => {
                        let _ = reply.send(Err(ConnectorError::Disconnected));
                    }
                    Some(Command::Cancel(_)) | Some(Command::Fire(_)) => {}
                }
            }
        }
    }
}

/// Connect, send the `Identify`-driven handshake message for `credentials`,
/// and (for `Register`/`Login`) wait for its direct reply. `Access` gets no
/// direct reply — the outcome (`Grant`/`Deny`) is pushed later and handled
/// inside `drive_connection`, so this returns `None` for its device id.
async fn connect_and_authenticate(
    addr: &str,
    identity: &dyn DeviceSigner,
    credentials: &Credentials,
) -> ConnectorResult<(Transport, Option<Uuid>)> {
    let mut transport = Transport::connect(addr).await?;

    let nonce = match transport.next_message().await? {
        Some(Incoming::Frame(payload)) => match sync_protocol::decode(&payload)? {
            Message::Identify(identify) => identify.nonce,
            other => return Err(unexpected("Identify", other.tag())),
        },
        Some(Incoming::Ping) => return Err(unexpected("Identify", "Ping")),
        None => return Err(ConnectorError::Disconnected),
    };

    let handshake = build_handshake(identity, credentials, nonce);
    let signed = sync_protocol::encode_signed(&handshake, |bytes| identity.sign(bytes));
    transport.send_frame(&signed).await?;

    if matches!(credentials, Credentials::Access { .. }) {
        return Ok((transport, None));
    }

    match transport.next_message().await? {
        Some(Incoming::Frame(payload)) => match sync_protocol::decode(&payload)? {
            Message::Account(account) => Ok((transport, Some(account.device_id))),
            Message::Welcome(_) => {
                let device_id = match credentials {
                    Credentials::Login { device_id, .. } => *device_id,
                    _ => unreachable!("Welcome only answers Login"),
                };
                Ok((transport, Some(device_id)))
            }
            Message::Error(err) => Err(ConnectorError::Server { error_type: err.error_type, message: err.message }),
            other => Err(unexpected("Account/Welcome", other.tag())),
        },
        Some(Incoming::Ping) => Err(unexpected("Account/Welcome", "Ping")),
        None => Err(ConnectorError::Disconnected),
    }
}

fn build_handshake(identity: &dyn DeviceSigner, credentials: &Credentials, nonce: Vec<u8>) -> Message {
    let sign_pub_key = identity.sign_public_key().to_vec();
    let crypt_pub_key = identity.crypt_public_key().to_vec();
    match credentials {
        Credentials::Register { device_name, cmac } => Message::Register(Register {
            protocol_version: protocol_version(),
            nonce,
            sign_scheme: sync_crypto::SIGN_SCHEME.to_string(),
            sign_pub_key,
            crypt_scheme: sync_crypto::CRYPT_SCHEME.to_string(),
            crypt_pub_key,
            device_name: device_name.clone(),
            cmac: cmac.clone(),
        }),
        Credentials::Login { device_id, device_name } => Message::Login(Login {
            protocol_version: protocol_version(),
            nonce,
            device_id: *device_id,
            device_name: device_name.clone(),
        }),
        Credentials::Access { partner_id, device_name, p_nonce, mac_scheme, cmac, trustmac } => {
            Message::Access(Access {
                protocol_version: protocol_version(),
                nonce,
                sign_scheme: sync_crypto::SIGN_SCHEME.to_string(),
                sign_pub_key,
                crypt_scheme: sync_crypto::CRYPT_SCHEME.to_string(),
                crypt_pub_key,
                device_name: device_name.clone(),
                p_nonce: p_nonce.clone(),
                partner_id: *partner_id,
                mac_scheme: mac_scheme.clone(),
                cmac: cmac.clone(),
                trustmac: trustmac.clone(),
            })
        }
    }
}

fn unexpected(expected: &'static str, got: &'static str) -> ConnectorError {
    ConnectorError::UnexpectedReply { expected, got }
}

#[allow(clippy::too_many_arguments)]
async fn drive_connection(
    mut transport: Transport,
    cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
    config: &ConnectorConfig,
    identity: &dyn DeviceSigner,
    pending: &mut PendingQueue,
    state_tx: &watch::Sender<ConnectorState>,
    device_id_tx: &watch::Sender<Option<Uuid>>,
    changes_tx: &broadcast::Sender<ChangeEvent>,
    enrollment_tx: &broadcast::Sender<EnrollmentEvent>,
) -> Outcome {
    let mut ping_timer = interval(config.ping_interval);
    ping_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ping_timer.tick().await;
    let mut awaiting_pong = false;
    let mut missed_pongs: u32 = 0;

    loop {
        tokio::select! {
            incoming = transport.next_message() => {
                let incoming = match incoming {
                    Ok(incoming) => incoming,
                    Err(err) => {
                        warn!(error = %err, "connection read failed");
                        return Outcome::Lost;
                    }
                };
                match incoming {
                    None => return Outcome::Lost,
                    Some(Incoming::Ping) => {
                        awaiting_pong = false;
                        missed_pongs = 0;
                    }
                    Some(Incoming::Frame(payload)) => {
                        match sync_protocol::decode(&payload) {
                            Ok(message) => {
                                if !route_frame(message, pending, state_tx, device_id_tx, changes_tx, enrollment_tx) {
                                    return Outcome::Lost;
                                }
                            }
                            Err(err) => {
                                warn!(error = %err, "malformed frame from server");
                                return Outcome::Lost;
                            }
                        }
                    }
                }
            }
            _ = ping_timer.tick() => {
                if awaiting_pong {
                    missed_pongs += 1;
                    if missed_pongs >= config.missed_pong_limit {
                        warn!(missed = missed_pongs, "keepalive timed out");
                        return Outcome::Lost;
                    }
                }
                if transport.send_ping().await.is_err() {
                    return Outcome::Lost;
                }
                awaiting_pong = true;
            }
            cmd = cmd_rx.recv() => {
                match cmd {
                    None | Some(Command::Shutdown) => return Outcome::Shutdown,
                    Some(Command::Request { message, token, reply }) => {
                        let bytes = if message.is_signed() {
                            sync_protocol::encode_signed(&message, |b| identity.sign(b))
                        } else {
                            sync_protocol::encode(&message)
                        };
                        pending.push(token, reply);
                        if transport.send_frame(&bytes).await.is_err() {
                            return Outcome::Lost;
                        }
                    }
                    Some(Command::Cancel(token)) => {
                        pending.cancel(token);
                    }
                    Some(Command::Fire(message)) => {
                        let bytes = sync_protocol::encode(&message);
                        if transport.send_frame(&bytes).await.is_err() {
                            return Outcome::Lost;
                        }
                    }
                }
            }
        }
    }
}

/// Routes one decoded frame: either resolves the oldest pending request, or
/// treats it as an unsolicited push. Returns `false` if the frame signals
/// the connection should be torn down (shouldn't normally happen here —
/// reserved for future fatal-error tags).
fn route_frame(
    message: Message,
    pending: &mut PendingQueue,
    state_tx: &watch::Sender<ConnectorState>,
    device_id_tx: &watch::Sender<Option<Uuid>>,
    changes_tx: &broadcast::Sender<ChangeEvent>,
    enrollment_tx: &broadcast::Sender<EnrollmentEvent>,
) -> bool {
    match message {
        Message::Changed(changed) => {
            let _ = state_tx.send(ConnectorState::ReadyWithChanges);
            let _ = changes_tx.send(ChangeEvent::Changed(changed));
        }
        Message::LastChanged => {
            let _ = state_tx.send(ConnectorState::Ready);
            let _ = changes_tx.send(ChangeEvent::LastChanged);
        }
        Message::Proof(proof) => {
            let _ = enrollment_tx.send(EnrollmentEvent::Proof(proof));
        }
        Message::Grant(grant) => {
            let _ = device_id_tx.send(Some(grant.new_device_id));
            let _ = state_tx.send(ConnectorState::Ready);
            let _ = enrollment_tx.send(EnrollmentEvent::Grant(grant));
        }
        Message::Deny(deny) => {
            let _ = enrollment_tx.send(EnrollmentEvent::Deny(deny));
        }
        reply @ (Message::ChangeAck(_)
        | Message::DeviceChangeAck(_)
        | Message::Devices(_)
        | Message::RemoveAck(_)
        | Message::MacUpdateAck
        | Message::DeviceKeys(_)
        | Message::NewKeyAck(_)
        | Message::AcceptAck(_)
        | Message::Error(_)) => {
            if let Message::Error(ref err) = reply {
                let resolved = pending.resolve_front(Err(ConnectorError::Server {
                    error_type: err.error_type,
                    message: err.message.clone(),
                }));
                if !resolved {
                    warn!(message = %err.message, "server error with no matching pending request");
                }
            } else if !pending.resolve_front(Ok(reply)) {
                debug!("reply with nothing pending for it, dropped");
            }
        }
        other => {
            debug!(tag = other.tag(), "unexpected message outside the handshake, dropped");
        }
    }
    true
}
