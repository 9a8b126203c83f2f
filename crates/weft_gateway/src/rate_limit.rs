//! Per-opcode rate-limit windows.
//!
//! `RATE_LIMITED` dispatches tell the client an opcode is throttled for
//! `retry_after` seconds. The tracker records the window; any later send of
//! that opcode first waits out the remainder.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::time::{Duration, Instant};

/// Tracks when each opcode becomes sendable again.
#[derive(Debug, Default)]
pub struct RateLimitTracker {
    available_at: Mutex<HashMap<u8, Instant>>,
}

impl RateLimitTracker {
    /// Create a tracker with no live windows.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a retry window for an opcode, replacing any earlier one.
    pub fn record(&self, opcode: u8, retry_after: Duration) {
        let until = Instant::now() + retry_after;
        self.available_at
            .lock()
            .expect("rate limit lock")
            .insert(opcode, until);
    }

    /// Time left until the opcode may be sent, if a window is live.
    pub fn remaining(&self, opcode: u8) -> Option<Duration> {
        let mut windows = self.available_at.lock().expect("rate limit lock");
        match windows.get(&opcode) {
            Some(&until) => {
                let now = Instant::now();
                if until <= now {
                    windows.remove(&opcode);
                    None
                } else {
                    Some(until - now)
                }
            }
            None => None,
        }
    }

    /// Sleep until the opcode's window, if any, has elapsed.
    pub async fn wait_for_availability(&self, opcode: u8) {
        if let Some(remaining) = self.remaining(opcode) {
            log::debug!(
                "[RateLimit] opcode {} throttled for {:?}",
                opcode,
                remaining
            );
            tokio::time::sleep(remaining).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn waits_out_the_recorded_window() {
        let tracker = RateLimitTracker::new();
        tracker.record(3, Duration::from_secs(2));

        let start = Instant::now();
        tracker.wait_for_availability(3).await;
        assert!(start.elapsed() >= Duration::from_secs(2));

        // Window consumed; a second send is immediate.
        let start = Instant::now();
        tracker.wait_for_availability(3).await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn windows_are_per_opcode() {
        let tracker = RateLimitTracker::new();
        tracker.record(3, Duration::from_secs(5));

        let start = Instant::now();
        tracker.wait_for_availability(1).await;
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert!(tracker.remaining(3).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn newer_window_replaces_older() {
        let tracker = RateLimitTracker::new();
        tracker.record(3, Duration::from_secs(10));
        tracker.record(3, Duration::from_secs(1));

        let start = Instant::now();
        tracker.wait_for_availability(3).await;
        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(1) && waited < Duration::from_secs(10));
    }
}
