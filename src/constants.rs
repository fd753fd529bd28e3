//! Application-wide constants for mudbroker.
//!
//! Centralizes the limits named throughout the component design: history
//! budgets, queue depths, timeouts, and the wire-level frame limits. Values
//! here are the *compiled-in defaults*; [`crate::config::Config`] allows all
//! of them to be overridden at runtime.

use std::time::Duration;

// ============================================================================
// History & queues
// ============================================================================

/// Default maximum retained history size, in bytes.
pub const HISTORY_BYTES_MAX: usize = 512 * 1024;

/// Default maximum retained history size, in lines.
pub const HISTORY_LINES_MAX: usize = 2_000;

/// Default maximum depth of a session's pending-command queue.
pub const COMMAND_QUEUE_MAX: usize = 10;

/// Default maximum number of buffered outgoing frames per transport before
/// it is closed for back-pressure (close code 1013).
pub const TRANSPORT_WRITE_HIGHWATER: usize = 256;

// ============================================================================
// Timeouts
// ============================================================================

/// Default idle timeout before an unattached session is evicted by sweep.
///
/// The source iterations disagree (5 vs 10 minutes); 10 minutes is the
/// chosen default, configurable via [`crate::config::Config`].
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(600);

/// Interval between `Session Manager` sweep passes.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Maximum time an upstream write may block before failing with
/// `BACKPRESSURE`.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Grace period given to a manually disconnected session to drain
/// in-flight frames to attached transports before the shell is torn down.
pub const DISCONNECT_GRACE_PERIOD: Duration = Duration::from_secs(2);

/// Interval on which a non-terminated partial buffer is re-examined for a
/// recognised prompt pattern.
pub const PARTIAL_FLUSH_INTERVAL: Duration = Duration::from_millis(200);

/// Partial-buffer size above which a prompt check runs even before the
/// next flush tick.
pub const PARTIAL_FLUSH_BYTES: usize = 4 * 1024;

// ============================================================================
// Wire protocol
// ============================================================================

/// Maximum size of a single frame on the wire, in bytes.
pub const MAX_FRAME_BYTES: usize = 64 * 1024;

/// Sustained rate limit, in frames per second, enforced over a 1s sliding
/// window per transport.
pub const RATE_LIMIT_FRAMES_PER_SEC: u32 = 20;

/// Width of the rate-limiter's sliding window.
pub const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(1);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_budgets_are_reasonable() {
        assert!(HISTORY_BYTES_MAX >= 64 * 1024);
        assert!(HISTORY_LINES_MAX >= 100);
    }

    #[test]
    fn test_idle_timeout_defaults_to_ten_minutes() {
        assert_eq!(IDLE_TIMEOUT, Duration::from_secs(600));
        assert!(SWEEP_INTERVAL < IDLE_TIMEOUT);
    }

    #[test]
    fn test_rate_limit_values() {
        assert_eq!(RATE_LIMIT_FRAMES_PER_SEC, 20);
        assert_eq!(RATE_LIMIT_WINDOW, Duration::from_secs(1));
    }
}
