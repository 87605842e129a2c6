//! Metrics and progress accounting
//!
//! Purely observational counters for requests issued, requests failed and
//! matches found. The sink never applies back-pressure to the engine.

use std::sync::atomic::{AtomicU64, Ordering};

/// Progress sink receiving engine counters
pub trait Progress: Send + Sync {
    /// A probe was dispatched, regardless of outcome.
    fn increment_requests(&self);

    /// One or more requests failed or were skipped.
    fn increment_failed_requests_by(&self, count: u64);

    /// A match was found for the request.
    fn increment_matched(&self);
}

/// Default in-memory progress implementation backed by atomics
#[derive(Debug, Default)]
pub struct AtomicProgress {
    requests: AtomicU64,
    failed: AtomicU64,
    matched: AtomicU64,
}

impl AtomicProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn matched(&self) -> u64 {
        self.matched.load(Ordering::Relaxed)
    }
}

impl Progress for AtomicProgress {
    fn increment_requests(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    fn increment_failed_requests_by(&self, count: u64) {
        self.failed.fetch_add(count, Ordering::Relaxed);
    }

    fn increment_matched(&self) {
        self.matched.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atomic_progress_counters() {
        let progress = AtomicProgress::new();
        progress.increment_requests();
        progress.increment_requests();
        progress.increment_failed_requests_by(3);
        progress.increment_matched();

        assert_eq!(progress.requests(), 2);
        assert_eq!(progress.failed(), 3);
        assert_eq!(progress.matched(), 1);
    }
}
