//! Local-write wake-up notification.
//!
//! SQLite has no `LISTEN`/`NOTIFY`; the equivalent here is `rusqlite`'s
//! `update_hook`, registered once on the dedicated database thread, which
//! fires synchronously for every row touched in any table. [`AsyncDatabase`]
//! filters that down to writes on a tracked shadow table and republishes the
//! plain table name here, mirroring `sync-server-store::ChangeNotifier`'s
//! broadcast-channel fan-out. A table's own `store_data` call also touches
//! its shadow table, so subscribers see the occasional self-inflicted
//! wake-up with nothing new to do — harmless, same as a lagged receive.
//!
//! [`AsyncDatabase`]: crate::executor::AsyncDatabase

use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct ChangeNotifier {
    sender: broadcast::Sender<String>,
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeNotifier {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.sender.subscribe()
    }

    pub fn notify(&self, table: String) {
        let _ = self.sender.send(table);
    }
}
