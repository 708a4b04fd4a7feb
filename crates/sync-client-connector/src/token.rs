use uuid::Uuid;

/// Opaque handle to one in-flight request, minted when the request is
/// submitted. Used only to cancel interest in the reply — the wire protocol
/// itself carries no request id, so matching against the live connection is
/// strictly positional (see `pending.rs`); a token just tells the connector
/// which queued waiter to drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CancellationToken(Uuid);

impl CancellationToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
