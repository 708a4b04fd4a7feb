use uuid::Uuid;

/// Per-socket session state. `Authenticating` accepts exactly one of
/// `Register`/`Login`/`Access`; everything past that point is `Idle` except
/// while a new device's `Access` request is suspended waiting on its
/// partner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Authenticating,
    Idle { device_id: Uuid },
    AwaitingGrant { new_device_id: Uuid, partner_id: Uuid },
    Error,
}

impl SessionState {
    pub fn device_id(&self) -> Option<Uuid> {
        match self {
            SessionState::Idle { device_id } => Some(*device_id),
            SessionState::AwaitingGrant { new_device_id, .. } => Some(*new_device_id),
            _ => None,
        }
    }
}
