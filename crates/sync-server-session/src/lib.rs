//! Per-socket session state machine for the sync server: authenticates a
//! connection as exactly one device, then serves change upload/download,
//! device management and key-rotation messages until the peer disconnects.
//!
//! [`Session`] owns the state for a single accepted [`tokio::net::TcpStream`]
//! wrapped in a [`Transport`]; a [`SessionRegistry`] shared across all live
//! sessions on a listener lets two of them hand an enrollment off to each
//! other directly, independent of the [`sync_server_store::ChangeStore`]'s
//! own broadcast-based change notifications.

mod download;
mod error;
mod registry;
mod session;
mod state;
mod transport;

pub use download::DownloadPacer;
pub use error::{HandlerError, HandlerResult, ProtocolFault, SessionError, SessionResult};
pub use registry::SessionRegistry;
pub use session::{Session, SessionConfig};
pub use state::SessionState;
pub use transport::{Incoming, Transport};

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use sync_codec::protocol_version;
    use sync_server_store::ChangeStore;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    async fn spawn_server() -> (std::net::SocketAddr, ChangeStore, SessionRegistry) {
        let store = ChangeStore::open_in_memory().await.unwrap();
        let registry = SessionRegistry::new();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let store_for_accept = store.clone();
        let registry_for_accept = registry.clone();
        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(_) => return,
                };
                let transport = Transport::new(stream);
                let session = Session::new(
                    store_for_accept.clone(),
                    registry_for_accept.clone(),
                    SessionConfig { idle_timeout: Duration::from_secs(5), ..SessionConfig::default() },
                );
                tokio::spawn(session.run(transport));
            }
        });
        (addr, store, registry)
    }

    async fn read_frame(stream: &mut TcpStream) -> Vec<u8> {
        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).await.unwrap();
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload).await.unwrap();
        payload
    }

    async fn write_frame(stream: &mut TcpStream, payload: &[u8]) {
        let framed = sync_codec::encode_frame(payload);
        stream.write_all(&framed).await.unwrap();
    }

    #[tokio::test]
    async fn register_then_login_round_trips_through_a_real_socket() {
        let (addr, _store, _registry) = spawn_server().await;

        let mut conn = TcpStream::connect(addr).await.unwrap();
        let identify_bytes = read_frame(&mut conn).await;
        let identify = sync_protocol::decode(&identify_bytes).unwrap();
        let nonce = match identify {
            sync_protocol::Message::Identify(i) => i.nonce,
            other => panic!("expected Identify, got {other:?}"),
        };

        use ed25519_dalek::{Signer, SigningKey};
        use rand_core::OsRng;
        let signing_key = SigningKey::generate(&mut OsRng);

        let register = sync_protocol::Message::Register(sync_protocol::Register {
            protocol_version: protocol_version(),
            nonce,
            sign_scheme: "ed25519".to_string(),
            sign_pub_key: signing_key.verifying_key().to_bytes().to_vec(),
            crypt_scheme: "x25519-hkdf-chacha20poly1305".to_string(),
            crypt_pub_key: vec![0u8; 32],
            device_name: "laptop".to_string(),
            cmac: vec![1, 2, 3],
        });
        let payload = sync_protocol::encode_signed(&register, |signed_bytes| signing_key.sign(signed_bytes).to_bytes());
        write_frame(&mut conn, &payload).await;

        let account_bytes = read_frame(&mut conn).await;
        let account = sync_protocol::decode(&account_bytes).unwrap();
        assert!(matches!(account, sync_protocol::Message::Account(_)));
    }
}
