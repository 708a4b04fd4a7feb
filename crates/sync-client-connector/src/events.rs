use sync_protocol::{Changed, Deny, Grant, Proof};

/// Fan-out of the server's download stream: the initial `Sync` batch and
/// every later unsolicited push share this one channel, since the wire
/// protocol doesn't distinguish them. `ConnectionLost`/`Ready` bracket a
/// connection's lifetime so a live-sync subscriber (a table state machine)
/// knows when its standing subscription needs to be re-opened.
#[derive(Debug, Clone)]
pub enum ChangeEvent {
    Ready,
    Changed(Changed),
    LastChanged,
    ConnectionLost,
}

/// Enrollment handshake pushes that don't fit the request/reply model:
/// `Proof` arrives unsolicited at the partner device, and `Grant`/`Deny`
/// arrive unsolicited at the device that sent `Access` (it has no socket
/// frame of its own to correlate them against — see `Credentials::Access`).
#[derive(Debug, Clone)]
pub enum EnrollmentEvent {
    Proof(Proof),
    Grant(Grant),
    Deny(Deny),
}
