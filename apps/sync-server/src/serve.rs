//! TCP accept loop: one `Session` per accepted connection, matching the
//! teacher's `tokio::net` + `tokio::spawn` per-connection shape.

use crate::config::ServerConfig;
use std::time::Duration;
use sync_server_session::{Session, SessionConfig, SessionRegistry};
use sync_server_session::Transport;
use sync_server_store::ChangeStore;
use tokio::net::TcpListener;
use tracing::{error, info};

pub async fn run(config: ServerConfig) -> anyhow::Result<()> {
    let store = ChangeStore::open(&config.database_path).await?;
    let registry = SessionRegistry::new();
    let listener = TcpListener::bind(&config.bind_addr).await?;
    info!(addr = %config.bind_addr, db = %config.database_path.display(), "sync server listening");

    let session_config = SessionConfig {
        quota_limit: config.quota_limit_bytes,
        download_limit: config.download_limit,
        download_threshold: config.download_threshold,
        idle_timeout: Duration::from_secs(config.idle_timeout_secs),
        ping_interval: Duration::from_secs(config.ping_interval_secs),
    };

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(err) => {
                error!(error = %err, "accept failed");
                continue;
            }
        };
        info!(%peer, "accepted connection");

        let transport = Transport::new(stream);
        let session = Session::new(store.clone(), registry.clone(), session_config.clone());
        tokio::spawn(async move {
            session.run(transport).await;
            info!(%peer, "session ended");
        });
    }
}
