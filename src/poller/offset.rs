use std::sync::atomic::{AtomicI64, Ordering};

/// Tracks the highest update id accepted by the poller of one run.
///
/// The value only moves forward. Every session run starts from a fresh tracker.
#[derive(Debug, Default)]
pub struct OffsetTracker {
    last_seen: AtomicI64,
}

impl OffsetTracker {
    pub fn new(initial: i64) -> Self {
        Self {
            last_seen: AtomicI64::new(initial),
        }
    }

    pub fn current(&self) -> i64 {
        self.last_seen.load(Ordering::SeqCst)
    }

    /// Moves the offset to `id` unless it is already further ahead.
    pub fn advance_to(&self, id: i64) -> i64 {
        self.last_seen.fetch_max(id, Ordering::SeqCst).max(id)
    }
}
