use tokio::time::Duration;

/// Quadratic-capped restart delay for a dropped live-sync subscription:
/// `5^n` seconds, `n` bounded at 3 (125s max). Mirrors
/// `sync-client-connector::backoff::ReconnectBackoff`'s walk-and-hold shape,
/// computed instead of tabulated since the spec gives a formula rather than
/// a fixed table.
#[derive(Debug, Clone)]
pub struct LiveSyncBackoff {
    attempt: u32,
}

const MAX_ATTEMPT: u32 = 3;

impl LiveSyncBackoff {
    pub fn new() -> Self {
        Self { attempt: 0 }
    }

    /// The delay before the next subscription restart, then advances.
    pub fn next(&mut self) -> Duration {
        let n = self.attempt.min(MAX_ATTEMPT);
        self.attempt = self.attempt.saturating_add(1);
        Duration::from_secs(5u64.pow(n))
    }

    /// Called once a subscription stays up long enough to be considered
    /// healthy again, so the next drop starts the count over.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for LiveSyncBackoff {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walks_powers_of_five_and_caps_at_n_3() {
        let mut b = LiveSyncBackoff::new();
        let expected = [1u64, 5, 25, 125, 125, 125];
        for secs in expected {
            assert_eq!(b.next(), Duration::from_secs(secs));
        }
    }

    #[test]
    fn reset_restarts_the_count() {
        let mut b = LiveSyncBackoff::new();
        b.next();
        b.next();
        b.reset();
        assert_eq!(b.next(), Duration::from_secs(1));
    }
}
