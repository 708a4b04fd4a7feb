//! Layered server configuration: CLI flag, then `QDSAPP_CONFIG_FILE`, then a
//! default search path, loaded through the `config` crate the way every
//! other app in this pack assembles its settings.

use serde::Deserialize;
use std::path::{Path, PathBuf};

const ENV_CONFIG_FILE: &str = "QDSAPP_CONFIG_FILE";
const DEFAULT_SEARCH_PATHS: [&str; 2] = ["./config.toml", "/etc/qdsapp/config.toml"];

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub database_path: PathBuf,
    pub quota_limit_bytes: i64,
    pub idle_timeout_secs: u64,
    pub ping_interval_secs: u64,
    pub download_limit: u32,
    pub download_threshold: u32,
    pub log_level: String,
    pub log_json: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:7420".to_string(),
            database_path: PathBuf::from("./qdsapp.sqlite3"),
            quota_limit_bytes: 50 * 1024 * 1024,
            idle_timeout_secs: 300,
            ping_interval_secs: 30,
            download_limit: 64,
            download_threshold: 16,
            log_level: "info".to_string(),
            log_json: false,
        }
    }
}

impl ServerConfig {
    /// Resolves which file to load: an explicit CLI flag wins, then
    /// `QDSAPP_CONFIG_FILE`, then the first of the default search paths that
    /// exists on disk. Returns `None` if nothing was found, in which case
    /// callers run on defaults.
    pub fn resolve_path(cli_flag: Option<&Path>) -> Option<PathBuf> {
        if let Some(path) = cli_flag {
            return Some(path.to_path_buf());
        }
        if let Ok(path) = std::env::var(ENV_CONFIG_FILE) {
            return Some(PathBuf::from(path));
        }
        DEFAULT_SEARCH_PATHS.iter().map(PathBuf::from).find(|p| p.exists())
    }

    pub fn load(cli_flag: Option<&Path>) -> Result<Self, config::ConfigError> {
        let defaults = Self::default();
        let mut builder = config::Config::builder()
            .set_default("bind_addr", defaults.bind_addr)?
            .set_default("database_path", defaults.database_path.to_string_lossy().to_string())?
            .set_default("quota_limit_bytes", defaults.quota_limit_bytes)?
            .set_default("idle_timeout_secs", defaults.idle_timeout_secs)?
            .set_default("ping_interval_secs", defaults.ping_interval_secs)?
            .set_default("download_limit", defaults.download_limit)?
            .set_default("download_threshold", defaults.download_threshold)?
            .set_default("log_level", defaults.log_level)?
            .set_default("log_json", defaults.log_json)?;

        if let Some(path) = Self::resolve_path(cli_flag) {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        builder.build()?.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_load_with_no_file_present() {
        std::env::remove_var(ENV_CONFIG_FILE);
        let config = ServerConfig::load(None).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:7420");
    }

    #[test]
    fn cli_flag_overrides_the_env_var() {
        let dir = tempfile::tempdir().unwrap();
        let env_path = dir.path().join("from-env.toml");
        std::fs::write(&env_path, "bind_addr = \"127.0.0.1:1\"\n").unwrap();
        let flag_path = dir.path().join("from-flag.toml");
        std::fs::write(&flag_path, "bind_addr = \"127.0.0.1:2\"\n").unwrap();

        std::env::set_var(ENV_CONFIG_FILE, &env_path);
        let resolved = ServerConfig::resolve_path(Some(&flag_path));
        std::env::remove_var(ENV_CONFIG_FILE);

        assert_eq!(resolved, Some(flag_path));
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "bind_addr = \"127.0.0.1:9000\"\nquota_limit_bytes = 1000\n").unwrap();

        let config = ServerConfig::load(Some(&path)).unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:9000");
        assert_eq!(config.quota_limit_bytes, 1000);
        assert_eq!(config.download_limit, 64, "unset fields keep their default");
    }
}
