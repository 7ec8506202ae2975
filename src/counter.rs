//! Rolling byte counters for upload/download accounting and rate estimation.

use std::time::{Duration, Instant};

/// Default sampling period for the rate estimator.
pub(crate) const SAMPLE_PERIOD: Duration = Duration::from_secs(2);

/// A monotonic byte counter paired with a rolling-window rate estimate.
///
/// Each call to [`Counter::update`] adds to the cumulative total; the rate
/// is only recomputed once at least [`SAMPLE_PERIOD`] has elapsed since the
/// last sample, at which point it becomes `delta * 1000 / elapsed_ms`.
#[derive(Debug)]
pub struct Counter {
    total: u64,
    since_last_sample: u64,
    rate: u64,
    last_sample_at: Instant,
}

impl Counter {
    pub fn new() -> Self {
        Self {
            total: 0,
            since_last_sample: 0,
            rate: 0,
            last_sample_at: Instant::now(),
        }
    }

    /// Adds `bytes` to the cumulative total and, if the sample period has
    /// elapsed, recomputes the rate.
    pub fn update(&mut self, bytes: u64) {
        self.total += bytes;
        self.since_last_sample += bytes;

        let elapsed = self.last_sample_at.elapsed();
        if elapsed >= SAMPLE_PERIOD {
            let elapsed_ms = elapsed.as_millis().max(1) as u64;
            self.rate = self.since_last_sample * 1000 / elapsed_ms;
            self.since_last_sample = 0;
            self.last_sample_at = Instant::now();
        }
    }

    /// The cumulative byte count since the counter was created or last reset.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// The most recently computed rate, in bytes/second.
    pub fn rate(&self) -> u64 {
        self.rate
    }

    /// Resets the counter to its initial state. Idempotent: resetting an
    /// already-zeroed counter is a no-op other than refreshing the sample
    /// clock.
    pub fn reset(&mut self) {
        self.total = 0;
        self.since_last_sample = 0;
        self.rate = 0;
        self.last_sample_at = Instant::now();
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks both directions of a session's transfer, handed to the announce
/// schedulers and the peer sessions so upload/download bytes are counted
/// exactly once each regardless of which component observed them.
#[derive(Debug, Default)]
pub struct ThroughputCounter {
    pub uploaded: Counter,
    pub downloaded: Counter,
}

impl ThroughputCounter {
    pub fn new() -> Self {
        Self {
            uploaded: Counter::new(),
            downloaded: Counter::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulates_total_immediately() {
        let mut counter = Counter::new();
        counter.update(100);
        counter.update(50);
        assert_eq!(counter.total(), 150);
    }

    #[test]
    fn reset_clears_total_and_rate() {
        let mut counter = Counter::new();
        counter.update(100);
        counter.reset();
        assert_eq!(counter.total(), 0);
        assert_eq!(counter.rate(), 0);
    }
}
