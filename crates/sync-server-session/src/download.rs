use std::collections::BTreeSet;

/// Tracks one session's in-flight download batch so the session loop knows
/// when to ask the store for more, and when a batch is fully drained.
pub struct DownloadPacer {
    limit: u32,
    threshold: u32,
    in_flight: BTreeSet<i64>,
    estimate_sent: bool,
    batch_open: bool,
}

impl DownloadPacer {
    pub fn new(limit: u32, threshold: u32) -> Self {
        Self { limit, threshold, in_flight: BTreeSet::new(), estimate_sent: false, batch_open: false }
    }

    pub fn should_refill(&self) -> bool {
        (self.in_flight.len() as u32) < self.threshold
    }

    pub fn room(&self) -> u32 {
        self.limit.saturating_sub(self.in_flight.len() as u32)
    }

    pub fn skip(&self) -> u32 {
        self.in_flight.len() as u32
    }

    pub fn mark_sent(&mut self, blob_id: i64) {
        self.in_flight.insert(blob_id);
        self.batch_open = true;
    }

    /// Remove an acknowledged blob from the in-flight set. Returns whether
    /// it was actually tracked (a late/duplicate ack is ignored upstream).
    pub fn ack(&mut self, blob_id: i64) -> bool {
        self.in_flight.remove(&blob_id)
    }

    pub fn is_drained(&self) -> bool {
        self.in_flight.is_empty()
    }

    /// Whether the next non-empty send should carry the change estimate.
    pub fn wants_estimate(&self) -> bool {
        !self.estimate_sent
    }

    pub fn mark_estimate_sent(&mut self) {
        self.estimate_sent = true;
    }

    /// Called once `LastChanged` has been sent, resetting for the next batch.
    pub fn close_batch(&mut self) {
        self.estimate_sent = false;
        self.batch_open = false;
    }

    pub fn batch_open(&self) -> bool {
        self.batch_open
    }
}
