use tokio::time::Duration;

/// Fixed reconnect backoff table, in seconds. Each failed connection attempt
/// advances one step; a successful connection resets back to the start.
const TABLE_SECS: &[u64] = &[5, 10, 30, 60, 120, 300, 600];

/// Walks [`TABLE_SECS`], holding at the last entry once reached.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    step: usize,
}

impl ReconnectBackoff {
    pub fn new() -> Self {
        Self { step: 0 }
    }

    /// The delay to wait before the next connection attempt, then advances
    /// to the next step.
    pub fn next(&mut self) -> Duration {
        let secs = TABLE_SECS[self.step.min(TABLE_SECS.len() - 1)];
        self.step = self.step.saturating_add(1);
        Duration::from_secs(secs)
    }

    /// Called once a connection succeeds, so the next failure starts over.
    pub fn reset(&mut self) {
        self.step = 0;
    }
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walks_the_table_and_caps() {
        let mut b = ReconnectBackoff::new();
        let expected = [5u64, 10, 30, 60, 120, 300, 600, 600, 600];
        for secs in expected {
            assert_eq!(b.next(), Duration::from_secs(secs));
        }
    }

    #[test]
    fn reset_restarts_from_the_first_step() {
        let mut b = ReconnectBackoff::new();
        b.next();
        b.next();
        b.reset();
        assert_eq!(b.next(), Duration::from_secs(5));
    }
}
