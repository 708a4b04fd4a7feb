//! Direct device-to-device relay: `Access` needs to hand a `Proof` straight
//! to the partner device's live session, and that partner's `Accept`/`Deny`
//! needs to find its way back to the still-suspended requester. Both sides
//! must be online for this to work; unlike change fan-out (which is
//! store-backed and survives a disconnected peer) enrollment relay is
//! in-memory only.

use std::collections::HashMap;
use std::sync::Arc;
use sync_protocol::Message;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

#[derive(Clone)]
pub struct SessionRegistry {
    inboxes: Arc<RwLock<HashMap<Uuid, mpsc::Sender<Message>>>>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self { inboxes: Arc::new(RwLock::new(HashMap::new())) }
    }

    pub async fn register(&self, device_id: Uuid) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel(16);
        self.inboxes.write().await.insert(device_id, tx);
        rx
    }

    pub async fn unregister(&self, device_id: Uuid) {
        self.inboxes.write().await.remove(&device_id);
    }

    /// Deliver `message` to `device_id`'s live session, if it has one open.
    /// Returns `true` iff delivered.
    pub async fn relay(&self, device_id: Uuid, message: Message) -> bool {
        let inboxes = self.inboxes.read().await;
        match inboxes.get(&device_id) {
            Some(tx) => tx.send(message).await.is_ok(),
            None => false,
        }
    }
}
