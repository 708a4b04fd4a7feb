//! Sync server binary: CLI surface, layered configuration, and the listener.

mod config;
mod logging;
mod serve;

use clap::{Parser, Subcommand};
use config::ServerConfig;
use std::path::PathBuf;
use sync_server_store::ChangeStore;

#[derive(Parser)]
#[command(name = "sync-server")]
#[command(about = "End-to-end encrypted multi-device sync server")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to a TOML config file; falls back to QDSAPP_CONFIG_FILE, then a
    /// default search path, then built-in defaults.
    #[arg(long, env = "QDSAPP_CONFIG_FILE")]
    config_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); overrides the config file.
    #[arg(long, global = true)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run pending schema migrations and exit.
    Migrate,
    /// Remove devices that haven't logged in for more than `days` days.
    Cleanup {
        days: i64,
    },
    /// Change every account's quota limit. Accounts that fit under the new
    /// value are updated; accounts that don't are left alone unless
    /// `--force` is given, in which case they (and their devices) are
    /// deleted outright.
    QuotaLimit {
        limit: i64,
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = ServerConfig::load(cli.config_file.as_deref())?;
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }
    logging::init(&config.log_level, config.log_json);

    match cli.command {
        None => serve::run(config).await,
        Some(Commands::Migrate) => {
            // `ChangeStore::open` runs every pending migration before returning.
            ChangeStore::open(&config.database_path).await?;
            tracing::info!("migrations applied");
            Ok(())
        }
        Some(Commands::Cleanup { days }) => {
            let store = ChangeStore::open(&config.database_path).await?;
            let removed = store.cleanup_stale_devices(days).await?;
            tracing::info!(removed, days, "stale device cleanup complete");
            Ok(())
        }
        Some(Commands::QuotaLimit { limit, force }) => {
            let store = ChangeStore::open(&config.database_path).await?;
            let summary = store.update_quota_limit(limit, force).await?;
            if force {
                tracing::info!(
                    devices_removed = summary.devices_removed,
                    users_removed = summary.users_removed,
                    "deleted over-quota accounts before applying new limit"
                );
            }
            if summary.users_updated > 0 {
                tracing::info!(users_updated = summary.users_updated, limit, "quota limit updated");
            } else {
                tracing::debug!(limit, "no quota changed for any user");
            }
            if summary.users_unmatched > 0 {
                tracing::warn!(
                    unmatched = summary.users_unmatched,
                    limit,
                    "users cannot be updated to the new limit because they would exceed it"
                );
            }
            Ok(())
        }
    }
}
