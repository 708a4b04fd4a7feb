/// Connection lifecycle as observed from outside the connector.
///
/// `ReadyWithChanges` is `Ready` plus "a download batch is currently being
/// drained" — callers that only care about request/reply traffic can treat
/// both as equivalent to "authenticated and usable".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    Disconnected,
    Connecting,
    Ready,
    ReadyWithChanges,
}

impl ConnectorState {
    pub fn is_usable(self) -> bool {
        matches!(self, ConnectorState::Ready | ConnectorState::ReadyWithChanges)
    }
}
