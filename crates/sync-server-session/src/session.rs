//! The per-socket session driver: owns one connection's state machine
//! (`Authenticating` / `Idle` / `AwaitingGrant` / `Error`) and runs its
//! message loop to completion.
//!
//! Three things feed the loop besides the socket itself: the store's
//! broadcast channel (another of this account's devices pushed a change),
//! this device's enrollment inbox (a partner relayed a `Proof`/`Grant`/
//! `Deny`), and a ping timer. All four are driven from a single
//! `tokio::select!`, wrapped in an idle timeout that resets on every
//! iteration.

use std::collections::HashMap;
use std::time::Duration;

use rand::RngCore;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::warn;
use uuid::Uuid;

use sync_codec::{min_compatible_version, split_signature, MessageReader, Version};
use sync_protocol::{self as wire, ErrorType, Message};
use sync_server_store::{ChangeStore, KeyChangeStatus, NewDevice, SiblingKeyShare, StoreError};

use crate::error::{HandlerError, HandlerResult, ProtocolFault, SessionError, SessionResult};
use crate::registry::SessionRegistry;
use crate::state::SessionState;
use crate::transport::{Incoming, Transport};

/// Messages a device sends to prove possession of a private key carry a
/// trailing 64-byte signature; everything else is plain tag+fields.
fn is_signed_tag(tag: &str) -> bool {
    matches!(tag, "Register" | "Login" | "Access" | "Accept" | "NewKey")
}

/// A frame decoded into its message and, for signed tags, the exact bytes
/// that were signed plus the signature suffix — kept around so the caller
/// can verify against whichever key turns out to be the right one for this
/// message type, something that isn't known until after the fields
/// themselves have been read.
struct Decoded {
    message: Message,
    signed_bytes: Vec<u8>,
    signature: Option<[u8; 64]>,
}

fn decode_incoming(payload: &[u8]) -> HandlerResult<Decoded> {
    let tag = MessageReader::new(payload)
        .read_tag()
        .map_err(|_| ProtocolFault::MalformedMessage)?;
    if is_signed_tag(&tag) {
        let (signed_bytes, signature) = split_signature(payload).map_err(|_| ProtocolFault::MalformedMessage)?;
        let message = Message::decode(signed_bytes).map_err(|_| ProtocolFault::MalformedMessage)?;
        Ok(Decoded { message, signed_bytes: signed_bytes.to_vec(), signature: Some(*signature) })
    } else {
        let message = Message::decode(payload).map_err(|_| ProtocolFault::MalformedMessage)?;
        Ok(Decoded { message, signed_bytes: payload.to_vec(), signature: None })
    }
}

fn verify_sig(pubkey: &[u8], signed_bytes: &[u8], signature: Option<[u8; 64]>) -> HandlerResult<()> {
    let pubkey: [u8; 32] = pubkey.try_into().map_err(|_| ProtocolFault::AuthFailed)?;
    let signature = signature.ok_or(ProtocolFault::AuthFailed)?;
    sync_crypto::verify(&pubkey, signed_bytes, &signature).map_err(|_| ProtocolFault::AuthFailed)?;
    Ok(())
}

/// Tunables that don't belong to any one connection.
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub quota_limit: i64,
    pub download_limit: u32,
    pub download_threshold: u32,
    pub idle_timeout: Duration,
    pub ping_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            quota_limit: 50 * 1024 * 1024,
            download_limit: 64,
            download_threshold: 16,
            idle_timeout: Duration::from_secs(300),
            ping_interval: Duration::from_secs(30),
        }
    }
}

/// The cached identity of whichever device this socket is speaking for,
/// kept so `Accept`/`NewKey` signatures can be checked without a store
/// round trip on every message.
struct AuthenticatedDevice {
    device_id: Uuid,
    sign_key: Vec<u8>,
}

/// Everything a partner has told us about a device it's vouching for,
/// stashed from `Proof` until the partner's own `Accept`/`Deny` arrives.
struct PendingEnrollment {
    new_device: NewDevice,
}

/// Runs one accepted connection to completion. Consumes the transport;
/// the caller just needs to spawn `Session::new(..).run()`.
pub struct Session {
    store: ChangeStore,
    registry: SessionRegistry,
    config: SessionConfig,
    state: SessionState,
    pacer: crate::download::DownloadPacer,
    nonce: Vec<u8>,
    authenticated: Option<AuthenticatedDevice>,
    own_sign_key: Option<Vec<u8>>,
    pending_enrollments: HashMap<Uuid, PendingEnrollment>,
    registered_under: Option<Uuid>,
}

impl Session {
    pub fn new(store: ChangeStore, registry: SessionRegistry, config: SessionConfig) -> Self {
        let mut nonce = vec![0u8; 16];
        rand::thread_rng().fill_bytes(&mut nonce);
        let pacer = crate::download::DownloadPacer::new(config.download_limit, config.download_threshold);
        Self {
            store,
            registry,
            config,
            state: SessionState::Authenticating,
            pacer,
            nonce,
            authenticated: None,
            own_sign_key: None,
            pending_enrollments: HashMap::new(),
            registered_under: None,
        }
    }

    /// Drive `transport` until the peer disconnects, faults terminally, or
    /// goes idle too long. Unregisters any enrollment inbox on the way out.
    pub async fn run(mut self, mut transport: Transport) {
        if let Err(err) = self.run_inner(&mut transport).await {
            warn!(error = %err, "session ended");
        }
        if let Some(id) = self.registered_under.take() {
            self.registry.unregister(id).await;
        }
    }

    async fn run_inner(&mut self, transport: &mut Transport) -> SessionResult<()> {
        let identify = Message::Identify(wire::Identify {
            protocol_version: sync_codec::protocol_version(),
            nonce: self.nonce.clone(),
            upload_limit: self.config.download_limit,
        });
        self.send(transport, identify).await?;

        let mut changes = self.store.subscribe();
        let mut inbox: Option<mpsc::Receiver<Message>> = None;
        let mut ping_timer = interval(self.config.ping_interval);
        ping_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ping_timer.tick().await; // first tick fires immediately; consume it

        loop {
            let step = timeout(self.config.idle_timeout, async {
                tokio::select! {
                    incoming = transport.next_message() => Step::Incoming(incoming),
                    _ = ping_timer.tick() => Step::Ping,
                    changed = changes.recv() => Step::Changed(changed),
                    relayed = recv_optional(&mut inbox) => Step::Relayed(relayed),
                }
            })
            .await
            .map_err(|_| SessionError::IdleTimeout)?;

            match step {
                Step::Incoming(Ok(None)) => return Ok(()),
                Step::Incoming(Ok(Some(Incoming::Ping))) => transport.send_ping().await?,
                Step::Incoming(Ok(Some(Incoming::Frame(payload)))) => {
                    if !self.on_frame(transport, &payload, &mut inbox).await? {
                        return Ok(());
                    }
                }
                Step::Incoming(Err(err)) => return Err(err),
                Step::Ping => transport.send_ping().await?,
                Step::Changed(Ok(target)) => {
                    if self.authenticated.as_ref().map(|a| a.device_id) == Some(target) {
                        let batch = self.build_download_batch(target).await;
                        self.send_batch_or_fault(transport, batch).await?;
                    }
                }
                Step::Changed(Err(_)) => {
                    // Lagged or the sender side closed; the next refill catches up.
                }
                Step::Relayed(Some(msg)) => {
                    self.deliver_relayed(transport, msg).await?;
                    if matches!(self.state, SessionState::Error) {
                        return Ok(());
                    }
                }
                Step::Relayed(None) => {}
            }
        }
    }

    /// Handle one complete client frame. Returns `false` if the connection
    /// should now be closed.
    async fn on_frame(
        &mut self,
        transport: &mut Transport,
        payload: &[u8],
        inbox: &mut Option<mpsc::Receiver<Message>>,
    ) -> SessionResult<bool> {
        let decoded = match decode_incoming(payload) {
            Ok(d) => d,
            Err(HandlerError::Fault(fault)) => return self.fail(transport, fault).await,
            Err(HandlerError::Store(_)) => unreachable!("decode cannot raise a store error"),
        };
        match self.dispatch(decoded, inbox).await {
            Ok(replies) => self.send_batch_or_fault(transport, Ok(replies)).await,
            Err(HandlerError::Fault(fault)) => self.fail(transport, fault).await,
            Err(HandlerError::Store(err)) => {
                warn!(error = %err, "store error while handling message");
                self.send(
                    transport,
                    Message::Error(wire::ErrorMessage {
                        error_type: ErrorType::ServerError,
                        message: "internal error".to_string(),
                        can_recover: true,
                    }),
                )
                .await?;
                Ok(false)
            }
        }
    }

    /// Send a typed `Error` for `fault` and report whether the connection
    /// stays open.
    async fn fail(&mut self, transport: &mut Transport, fault: ProtocolFault) -> SessionResult<bool> {
        let (error_type, message, can_recover) = fault.wire_error();
        self.send(
            transport,
            Message::Error(wire::ErrorMessage { error_type, message: message.to_string(), can_recover }),
        )
        .await?;
        if !can_recover {
            self.state = SessionState::Error;
        }
        Ok(can_recover)
    }

    async fn send_batch_or_fault(&mut self, transport: &mut Transport, replies: HandlerResult<Vec<Message>>) -> SessionResult<bool> {
        match replies {
            Ok(msgs) => {
                for msg in msgs {
                    self.send(transport, msg).await?;
                }
                Ok(!matches!(self.state, SessionState::Error))
            }
            Err(HandlerError::Fault(fault)) => self.fail(transport, fault).await,
            Err(HandlerError::Store(err)) => {
                warn!(error = %err, "store error during download refill");
                Ok(true)
            }
        }
    }

    async fn send(&self, transport: &mut Transport, msg: Message) -> SessionResult<()> {
        debug_assert!(!msg.is_signed(), "the server never sends a signed message");
        transport.send_frame(&sync_protocol::encode(&msg)).await
    }

    async fn dispatch(&mut self, decoded: Decoded, inbox: &mut Option<mpsc::Receiver<Message>>) -> HandlerResult<Vec<Message>> {
        match self.state.clone() {
            SessionState::Authenticating => self.handle_authenticating(decoded, inbox).await,
            SessionState::Idle { device_id } => self.handle_idle(device_id, decoded).await,
            SessionState::AwaitingGrant { .. } => Err(ProtocolFault::UnexpectedMessage.into()),
            SessionState::Error => Err(ProtocolFault::UnexpectedMessage.into()),
        }
    }

    fn check_version_and_nonce(&self, version: &Version, nonce: &[u8]) -> HandlerResult<()> {
        if *version < min_compatible_version() {
            return Err(ProtocolFault::IncompatibleVersion.into());
        }
        if nonce != self.nonce.as_slice() {
            return Err(ProtocolFault::AuthFailed.into());
        }
        Ok(())
    }

    async fn register_self(&mut self, device_id: Uuid, sign_key: Vec<u8>, inbox: &mut Option<mpsc::Receiver<Message>>) {
        *inbox = Some(self.registry.register(device_id).await);
        self.registered_under = Some(device_id);
        self.state = SessionState::Idle { device_id };
        self.authenticated = Some(AuthenticatedDevice { device_id, sign_key });
    }

    async fn handle_authenticating(&mut self, decoded: Decoded, inbox: &mut Option<mpsc::Receiver<Message>>) -> HandlerResult<Vec<Message>> {
        match decoded.message {
            Message::Register(m) => {
                self.check_version_and_nonce(&m.protocol_version, &m.nonce)?;
                verify_sig(&m.sign_pub_key, &decoded.signed_bytes, decoded.signature)?;
                let fingerprint = sync_crypto::fingerprint_of(&m.sign_pub_key, &m.crypt_pub_key).to_vec();
                let device_id = self
                    .store
                    .add_new_device(
                        NewDevice {
                            name: m.device_name,
                            sign_scheme: m.sign_scheme,
                            sign_key: m.sign_pub_key.clone(),
                            crypt_scheme: m.crypt_scheme,
                            crypt_key: m.crypt_pub_key,
                            fingerprint,
                            key_mac: m.cmac,
                        },
                        self.config.quota_limit,
                    )
                    .await?;
                self.register_self(device_id, m.sign_pub_key, inbox).await;
                Ok(vec![Message::Account(wire::Account { device_id })])
            }
            Message::Login(m) => {
                self.check_version_and_nonce(&m.protocol_version, &m.nonce)?;
                let device = self.store.load_device(m.device_id).await.map_err(|err| match err {
                    StoreError::NotFound(_) => HandlerError::Fault(ProtocolFault::AuthFailed),
                    other => other.into(),
                })?;
                verify_sig(&device.sign_key, &decoded.signed_bytes, decoded.signature)?;
                self.store.touch_last_login(m.device_id).await?;

                let pending_changes = self.store.count_pending_changes(m.device_id).await?;
                let mut rotations = self.store.load_key_changes(m.device_id).await?;
                rotations.sort_by_key(|r| r.key_index);
                let welcome = match rotations.into_iter().next() {
                    Some(rotation) => wire::Welcome {
                        has_changes: pending_changes > 0,
                        key_index: rotation.key_index,
                        scheme: rotation.scheme,
                        wrapped_key: rotation.wrapped_key,
                        cmac: rotation.verify_mac,
                    },
                    None => {
                        let key_index = self.store.account_key_index(m.device_id).await?;
                        wire::Welcome {
                            has_changes: pending_changes > 0,
                            key_index,
                            scheme: String::new(),
                            wrapped_key: Vec::new(),
                            cmac: device.key_mac.clone(),
                        }
                    }
                };
                self.register_self(m.device_id, device.sign_key, inbox).await;
                Ok(vec![Message::Welcome(welcome)])
            }
            Message::Access(m) => {
                self.check_version_and_nonce(&m.protocol_version, &m.nonce)?;
                verify_sig(&m.sign_pub_key, &decoded.signed_bytes, decoded.signature)?;
                let new_device_id = Uuid::new_v4();
                let proof = Message::Proof(wire::Proof {
                    p_nonce: m.p_nonce,
                    new_device_id,
                    device_name: m.device_name,
                    sign_scheme: m.sign_scheme,
                    sign_pub_key: m.sign_pub_key.clone(),
                    crypt_scheme: m.crypt_scheme,
                    crypt_pub_key: m.crypt_pub_key,
                    mac_scheme: m.mac_scheme,
                    cmac: m.cmac,
                    trustmac: m.trustmac,
                });
                if !self.registry.relay(m.partner_id, proof).await {
                    return Err(ProtocolFault::AccessDenied.into());
                }
                let rx = self.registry.register(new_device_id).await;
                *inbox = Some(rx);
                self.registered_under = Some(new_device_id);
                self.state = SessionState::AwaitingGrant { new_device_id, partner_id: m.partner_id };
                self.own_sign_key = Some(m.sign_pub_key);
                Ok(vec![])
            }
            _ => Err(ProtocolFault::UnexpectedMessage.into()),
        }
    }

    async fn handle_idle(&mut self, device_id: Uuid, decoded: Decoded) -> HandlerResult<Vec<Message>> {
        if decoded.message.is_signed() {
            let sign_key = self.authenticated.as_ref().map(|a| a.sign_key.clone()).unwrap_or_default();
            verify_sig(&sign_key, &decoded.signed_bytes, decoded.signature)?;
        }

        match decoded.message {
            Message::Sync => self.build_download_batch(device_id).await,
            Message::Change(c) => {
                self.add_change(device_id, c.data_id.clone(), c.key_index, c.salt, c.ciphertext).await?;
                Ok(vec![Message::ChangeAck(wire::ChangeAck { data_id: c.data_id })])
            }
            Message::DeviceChange(c) => {
                self.store
                    .add_device_change(device_id, c.target_device_id, c.data_id.clone(), c.key_index, c.salt, c.ciphertext)
                    .await
                    .map_err(map_quota)?;
                Ok(vec![Message::DeviceChangeAck(wire::DeviceChangeAck { data_id: c.data_id, target_device_id: c.target_device_id })])
            }
            Message::ChangedAck(a) => {
                let tracked = self.pacer.ack(a.blob_id as i64);
                if tracked {
                    self.store.complete_change(device_id, a.blob_id as i64).await?;
                }
                self.build_download_batch(device_id).await
            }
            Message::ListDevices => {
                let devices = self.store.list_devices(device_id).await?;
                Ok(vec![Message::Devices(wire::Devices {
                    devices: devices
                        .into_iter()
                        .map(|d| wire::DeviceInfoEntry { device_id: d.id, name: d.name, fingerprint: d.fingerprint })
                        .collect(),
                })])
            }
            Message::Remove(r) => {
                self.store.remove_device(r.device_id).await?;
                Ok(vec![Message::RemoveAck(wire::RemoveAck { device_id: r.device_id })])
            }
            Message::MacUpdate(m) => {
                self.store.update_cmac(device_id, m.key_index, m.cmac).await?;
                Ok(vec![Message::MacUpdateAck])
            }
            Message::KeyChange(k) => match self.store.try_key_change(device_id, k.next_index).await? {
                KeyChangeStatus::Accepted { siblings } => Ok(vec![Message::DeviceKeys(wire::DeviceKeys {
                    key_index: k.next_index,
                    duplicated: false,
                    devices: siblings
                        .into_iter()
                        .map(|s| wire::DeviceKeyEntry {
                            device_id: s.id,
                            crypt_scheme: s.crypt_scheme,
                            crypt_key: s.crypt_key,
                            key_mac: s.key_mac,
                        })
                        .collect(),
                })]),
                KeyChangeStatus::Pending => Err(ProtocolFault::PendingKeyConflict.into()),
                KeyChangeStatus::IndexMismatch { .. } => Err(ProtocolFault::KeyIndexMismatch.into()),
            },
            Message::NewKey(n) => {
                let shares = n
                    .updates
                    .into_iter()
                    .map(|u| SiblingKeyShare { device: u.device_id, scheme: n.scheme.clone(), wrapped_key: u.wrapped_key, verify_mac: u.cmac })
                    .collect();
                self.store.update_exchange_key(device_id, n.key_index, n.cmac, shares).await?;
                Ok(vec![Message::NewKeyAck(wire::NewKeyAck { key_index: n.key_index })])
            }
            Message::Accept(a) => {
                let pending = self.pending_enrollments.remove(&a.new_device_id).ok_or(ProtocolFault::UnexpectedMessage)?;
                self.store.add_new_device_to_user_with_id(a.new_device_id, device_id, pending.new_device).await?;
                self.registry
                    .relay(
                        a.new_device_id,
                        Message::Grant(wire::Grant {
                            new_device_id: a.new_device_id,
                            key_index: a.key_index,
                            scheme: a.scheme.clone(),
                            wrapped_secret: a.wrapped_secret.clone(),
                        }),
                    )
                    .await;
                Ok(vec![Message::AcceptAck(wire::AcceptAck { new_device_id: a.new_device_id })])
            }
            Message::Deny(d) => {
                self.pending_enrollments.remove(&d.new_device_id);
                self.registry.relay(d.new_device_id, Message::Deny(wire::Deny { new_device_id: d.new_device_id })).await;
                Ok(vec![])
            }
            _ => Err(ProtocolFault::UnexpectedMessage.into()),
        }
    }

    async fn add_change(&mut self, device_id: Uuid, data_id: Vec<u8>, key_index: u32, salt: Vec<u8>, ciphertext: Vec<u8>) -> HandlerResult<()> {
        self.store.add_change(device_id, data_id, key_index, salt, ciphertext).await.map_err(map_quota)?;
        Ok(())
    }

    /// A message arrived through this session's enrollment inbox rather
    /// than over its own socket: either we're the online partner being
    /// asked to vouch (`Proof`), or we're the suspended requester being
    /// told the outcome (`Grant`/`Deny`).
    async fn deliver_relayed(&mut self, transport: &mut Transport, msg: Message) -> SessionResult<()> {
        match (&self.state, &msg) {
            (SessionState::Idle { .. }, Message::Proof(p)) => {
                let fingerprint = sync_crypto::fingerprint_of(&p.sign_pub_key, &p.crypt_pub_key).to_vec();
                self.pending_enrollments.insert(
                    p.new_device_id,
                    PendingEnrollment {
                        new_device: NewDevice {
                            name: p.device_name.clone(),
                            sign_scheme: p.sign_scheme.clone(),
                            sign_key: p.sign_pub_key.clone(),
                            crypt_scheme: p.crypt_scheme.clone(),
                            crypt_key: p.crypt_pub_key.clone(),
                            fingerprint,
                            key_mac: p.cmac.clone(),
                        },
                    },
                );
                self.send(transport, msg).await
            }
            (SessionState::AwaitingGrant { new_device_id, .. }, Message::Grant(g)) if g.new_device_id == *new_device_id => {
                let new_device_id = *new_device_id;
                self.send(transport, msg).await?;
                let sign_key = self.own_sign_key.clone().unwrap_or_default();
                self.state = SessionState::Idle { device_id: new_device_id };
                self.authenticated = Some(AuthenticatedDevice { device_id: new_device_id, sign_key });
                Ok(())
            }
            (SessionState::AwaitingGrant { new_device_id, .. }, Message::Deny(d)) if d.new_device_id == *new_device_id => {
                self.send(
                    transport,
                    Message::Error(wire::ErrorMessage {
                        error_type: ErrorType::AccessError,
                        message: "enrollment denied".to_string(),
                        can_recover: false,
                    }),
                )
                .await?;
                self.state = SessionState::Error;
                Ok(())
            }
            _ => {
                warn!(state = ?self.state, tag = msg.tag(), "dropping stray relayed message");
                Ok(())
            }
        }
    }

    /// Pull the next batch of a device's pending changes within the
    /// download pacer's budget, closing the batch with `LastChanged` once
    /// the store has nothing left.
    async fn build_download_batch(&mut self, device_id: Uuid) -> HandlerResult<Vec<Message>> {
        if !self.pacer.should_refill() {
            return Ok(vec![]);
        }
        let room = self.pacer.room();
        if room == 0 {
            return Ok(vec![]);
        }
        let skip = self.pacer.skip();
        let pending = self.store.load_next_changes(device_id, room, skip).await?;
        if pending.is_empty() {
            return if self.pacer.batch_open() {
                self.pacer.close_batch();
                Ok(vec![Message::LastChanged])
            } else {
                Ok(vec![])
            };
        }

        let estimate = if self.pacer.wants_estimate() {
            let count = self.store.count_pending_changes(device_id).await?;
            self.pacer.mark_estimate_sent();
            Some(count)
        } else {
            None
        };

        let mut out = Vec::with_capacity(pending.len());
        for (i, change) in pending.into_iter().enumerate() {
            self.pacer.mark_sent(change.blob_id);
            out.push(Message::Changed(wire::Changed {
                blob_id: change.blob_id as u64,
                key_index: change.key_index,
                salt: change.salt,
                ciphertext: change.ciphertext,
                change_estimate: if i == 0 { estimate } else { None },
            }));
        }
        Ok(out)
    }
}

fn map_quota(err: StoreError) -> HandlerError {
    match err {
        StoreError::QuotaExceeded => HandlerError::Fault(ProtocolFault::QuotaExceeded),
        other => other.into(),
    }
}

enum Step {
    Incoming(SessionResult<Option<Incoming>>),
    Ping,
    Changed(Result<Uuid, tokio::sync::broadcast::error::RecvError>),
    Relayed(Option<Message>),
}

async fn recv_optional(inbox: &mut Option<mpsc::Receiver<Message>>) -> Option<Message> {
    match inbox {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
