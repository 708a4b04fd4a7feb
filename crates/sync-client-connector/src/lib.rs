//! Single logical connection to the sync server (spec §4.7).
//!
//! [`Connector`] owns exactly one [`tokio::net::TcpStream`] at a time and
//! reconnects on its own using a fixed backoff table when it drops. Callers
//! never see the socket: they submit requests and get a token back for
//! cancellation, or subscribe to the unsolicited download/enrollment event
//! streams. A ping is sent on an interval; missing its echo twice in a row
//! is treated as a dead connection the same as a read error.

mod backoff;
mod connector;
mod credentials;
mod error;
mod events;
mod pending;
mod state;
mod token;
mod transport;

pub use backoff::ReconnectBackoff;
pub use connector::{Connector, ConnectorConfig};
pub use credentials::{Credentials, DeviceContext, DeviceSigner};
pub use error::{ConnectorError, ConnectorResult};
pub use events::{ChangeEvent, EnrollmentEvent};
pub use state::ConnectorState;
pub use token::CancellationToken;

#[cfg(test)]
mod tests {
    use super::*;
    use credentials::DeviceSigner;
    use ed25519_dalek::{Signer, SigningKey};
    use rand_core::OsRng;
    use std::sync::Arc;
    use std::time::Duration;
    use sync_server_session::{Session, SessionConfig, SessionRegistry, Transport as ServerTransport};
    use sync_server_store::ChangeStore;
    use tokio::net::TcpListener;
    use x25519_dalek::{PublicKey as XPublicKey, StaticSecret};

    /// Bare-bones `DeviceSigner` for exercising the connector on its own,
    /// without dragging in `sync-crypto`'s account-key/keystore plumbing.
    struct TestIdentity {
        signing: SigningKey,
        encryption_public: XPublicKey,
    }

    impl TestIdentity {
        fn generate() -> Self {
            let signing = SigningKey::generate(&mut OsRng);
            let encryption_secret = StaticSecret::random_from_rng(OsRng);
            let encryption_public = XPublicKey::from(&encryption_secret);
            Self { signing, encryption_public }
        }
    }

    impl DeviceSigner for TestIdentity {
        fn sign(&self, msg: &[u8]) -> [u8; 64] {
            self.signing.sign(msg).to_bytes()
        }

        fn sign_public_key(&self) -> [u8; 32] {
            self.signing.verifying_key().to_bytes()
        }

        fn crypt_public_key(&self) -> [u8; 32] {
            self.encryption_public.to_bytes()
        }
    }

    async fn spawn_server() -> std::net::SocketAddr {
        let store = ChangeStore::open_in_memory().await.unwrap();
        let registry = SessionRegistry::new();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(_) => return,
                };
                let transport = ServerTransport::new(stream);
                let session = Session::new(
                    store.clone(),
                    registry.clone(),
                    SessionConfig { idle_timeout: Duration::from_secs(5), ..SessionConfig::default() },
                );
                tokio::spawn(session.run(transport));
            }
        });
        addr
    }

    fn registering_connector(addr: std::net::SocketAddr) -> Connector {
        let identity: Arc<dyn DeviceSigner> = Arc::new(TestIdentity::generate());
        let context = DeviceContext {
            identity,
            credentials: Credentials::Register { device_name: "test-device".to_string(), cmac: vec![1, 2, 3] },
        };
        let config = ConnectorConfig { server_addr: addr.to_string(), ping_interval: Duration::from_secs(30), ..ConnectorConfig::default() };
        Connector::new(config, context)
    }

    #[tokio::test]
    async fn registers_and_reaches_ready() {
        let addr = spawn_server().await;
        let connector = registering_connector(addr);
        connector.start();

        let mut state = connector.state();
        loop {
            if *state.borrow() == ConnectorState::Ready {
                break;
            }
            state.changed().await.unwrap();
        }

        let mut device_id = connector.device_id();
        loop {
            if device_id.borrow().is_some() {
                break;
            }
            device_id.changed().await.unwrap();
        }
    }

    #[tokio::test]
    async fn list_devices_round_trips_after_registering() {
        let addr = spawn_server().await;
        let connector = registering_connector(addr);
        connector.start();

        let mut state = connector.state();
        while *state.borrow() != ConnectorState::Ready {
            state.changed().await.unwrap();
        }

        let (_token, rx) = connector.request(sync_protocol::Message::ListDevices).unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(2), rx).await.unwrap().unwrap().unwrap();
        assert!(matches!(reply, sync_protocol::Message::Devices(_)));
    }

    #[tokio::test]
    async fn cancel_resolves_the_waiter_without_waiting_for_the_server() {
        let addr = spawn_server().await;
        let connector = registering_connector(addr);
        connector.start();

        let mut state = connector.state();
        while *state.borrow() != ConnectorState::Ready {
            state.changed().await.unwrap();
        }

        let (token, rx) = connector.request(sync_protocol::Message::ListDevices).unwrap();
        connector.cancel(token);
        let result = tokio::time::timeout(Duration::from_secs(2), rx).await.unwrap().unwrap();
        assert!(matches!(result, Err(ConnectorError::Cancelled)));
    }
}
