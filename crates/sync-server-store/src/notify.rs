//! Fan-out wake-up notification.
//!
//! The change store's tables model fan-out as rows (`device_changes`), but
//! SQLite triggers can't reach back into the session layer to wake a
//! connected socket. Instead every write that fans a blob out to a device
//! publishes that device's id on a broadcast channel once its transaction
//! has committed; sessions subscribe and filter for their own device id.

use tokio::sync::broadcast;
use uuid::Uuid;

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Clone)]
pub struct ChangeNotifier {
    sender: broadcast::Sender<Uuid>,
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

    /// Subscribe to wake-ups. Lagging subscribers miss old notifications but
    /// keep receiving new ones; callers should treat any receive (including
    /// a `Lagged` error) as "re-check for pending changes".
    pub fn subscribe(&self) -> broadcast::Receiver<Uuid> {
        self.sender.subscribe()
    }

    /// Announce that `device` has new changes waiting. A send with no
    /// subscribers is not an error: nobody is online to care yet.
    pub fn notify(&self, device: Uuid) {
        let _ = self.sender.send(device);
    }

    pub fn notify_many(&self, devices: impl IntoIterator<Item = Uuid>) {
        for device in devices {
            self.notify(device);
        }
    }
}
