//! Per-transport sliding-window frame rate limiter.
//!
//! No existing rate limiter lives elsewhere in this codebase to adapt, so
//! this follows the same timestamp-pruning shape used for TTL cleanup of
//! buffered state elsewhere: keep a timestamp per observed event, drop
//! everything older than the window on each check, and compare the
//! remaining count against the limit.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Tracks frame arrival timestamps for one transport over a sliding
/// window and reports whether the sustained rate has been exceeded.
#[derive(Debug)]
pub struct SlidingWindowLimiter {
    window: Duration,
    limit: u32,
    timestamps: VecDeque<Instant>,
}

impl SlidingWindowLimiter {
    /// Create a limiter allowing up to `limit` events per `window`.
    #[must_use]
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            window,
            limit,
            timestamps: VecDeque::new(),
        }
    }

    /// Record one event at `now` and report whether the sustained rate
    /// over the trailing window now exceeds the configured limit.
    ///
    /// Returns `true` if the caller should be rate limited (and, per the
    /// frame transport contract, closed with code 1013).
    pub fn record(&mut self, now: Instant) -> bool {
        while let Some(&oldest) = self.timestamps.front() {
            if now.duration_since(oldest) > self.window {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
        self.timestamps.push_back(now);
        self.timestamps.len() as u32 > self.limit
    }
}
