//! Minimal host app for `sync-client-engine`: registers or re-logs-in one
//! device, opens a local SQLite database, watches a single `notes` table,
//! and runs until interrupted.

mod settings;

use clap::Parser;
use serde::{Deserialize, Serialize};
use settings::FileSettingsStore;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use sync_client_engine::{ClientConfig, Credentials, Engine, TableConfig};
use sync_crypto::{CryptoCore, KeyFileStore, CRYPT_SCHEME, SIGN_SCHEME};
use sync_keystore::FileStorage;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "sync-client-demo")]
#[command(about = "Example client embedding the sync engine against one SQLite table")]
struct Cli {
    /// Address of the sync server, e.g. 127.0.0.1:7420
    #[arg(long)]
    server: String,

    /// Name this device registers or re-authenticates under.
    #[arg(long, default_value = "demo-device")]
    device_name: String,

    /// Directory for this device's key material, settings, and database.
    #[arg(long, default_value = "./sync-client-demo-state")]
    state_dir: PathBuf,
}

#[derive(Serialize, Deserialize)]
struct DeviceRecord {
    device_id: Uuid,
    device_name: String,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry().with(filter).with(fmt::layer()).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let cli = Cli::parse();
    std::fs::create_dir_all(&cli.state_dir)?;

    let key_store = Box::new(FileStorage::new(cli.state_dir.join("keys"))?);
    let key_files = KeyFileStore::new(cli.state_dir.join("account-keys"))?;
    let settings = FileSettingsStore::open(cli.state_dir.join("settings.json"))?;

    let record_path = cli.state_dir.join("device.json");
    let (core, credentials) = if record_path.exists() {
        let raw = std::fs::read_to_string(&record_path)?;
        let record: DeviceRecord = serde_json::from_str(&raw)?;
        let core = CryptoCore::load(key_store, key_files, &settings)?;
        (core, Credentials::Login { device_id: record.device_id, device_name: record.device_name })
    } else {
        let core = CryptoCore::generate(SIGN_SCHEME, CRYPT_SCHEME, key_store, key_files)?;
        // A real deployment proves this registration through whatever
        // invite/pairing flow the host app implements; this demo has none,
        // so it registers with a placeholder proof the server accepts only
        // because it has no competing account to distinguish it from.
        (core, Credentials::Register { device_name: cli.device_name.clone(), cmac: vec![0u8; 32] })
    };

    let core = Arc::new(core);
    let identity: Arc<dyn sync_client_engine::DeviceSigner> = core.clone();
    let cipher: Arc<dyn sync_client_engine::PayloadCipher> = core.clone();

    let config = ClientConfig {
        server_addr: cli.server.clone(),
        device_name: cli.device_name.clone(),
        ping_interval: Duration::from_secs(20),
        missed_pong_limit: 2,
    };

    let engine = Engine::new(config, identity, credentials, cipher);
    engine.start()?;

    let db_path = cli.state_dir.join("notes.sqlite3");
    prepare_schema(&db_path)?;
    let _watcher = engine.open_database("notes", &db_path).await?;
    engine
        .add_table(
            "notes",
            TableConfig::new("notes").primary_key("id").fields(["id", "body"]),
        )
        .await?;

    let mut lifecycle = engine.state();
    loop {
        match *lifecycle.borrow() {
            sync_client_engine::EngineState::TableSync => break,
            sync_client_engine::EngineState::Error => anyhow::bail!("sign-in failed"),
            _ => {}
        }
        if lifecycle.changed().await.is_err() {
            anyhow::bail!("engine dropped before reaching TableSync");
        }
    }

    if !record_path.exists() {
        if let Some(id) = engine.device_id() {
            let record = DeviceRecord { device_id: id, device_name: cli.device_name.clone() };
            std::fs::write(&record_path, serde_json::to_string_pretty(&record)?)?;
            tracing::info!(device_id = %id, "registered, device record saved");
        }
    }

    tracing::info!("engine running; press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    engine.stop()?;
    Ok(())
}

fn prepare_schema(path: &std::path::Path) -> anyhow::Result<()> {
    let conn = rusqlite::Connection::open(path)?;
    conn.execute_batch("CREATE TABLE IF NOT EXISTS notes (id TEXT PRIMARY KEY, body TEXT)")?;
    Ok(())
}
