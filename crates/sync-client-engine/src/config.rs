use std::time::Duration;

/// Constructed programmatically by the embedding application — this crate
/// only defines the struct and its defaults; loading it from a file or the
/// environment is the host app's own concern.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_addr: String,
    pub device_name: String,
    pub ping_interval: Duration,
    pub missed_pong_limit: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: String::new(),
            device_name: String::new(),
            ping_interval: Duration::from_secs(20),
            missed_pong_limit: 2,
        }
    }
}
