//! Categorical broker errors and their wire-level consequences.
//!
//! These are not propagated as `anyhow::Error` across the session boundary;
//! callers match on the variant to decide what frame (if any) to send and
//! whether the transport or the session is affected. Setup-time failures
//! (config, socket bind, rule-document load) still use `anyhow::Result`.

use std::fmt;

/// Close codes used on the frame transport. See the external interfaces
/// table for the full catalogue.
pub mod close_code {
    /// Normal close.
    pub const NORMAL: u16 = 1000;
    /// Policy violation (bad init).
    pub const POLICY: u16 = 1008;
    /// Transport write error.
    pub const WRITE_ERROR: u16 = 1011;
    /// Rate limited / back-pressure.
    pub const RATE_LIMITED: u16 = 1013;
    /// Owner mismatch or invalidated session.
    pub const OWNER_INVALID: u16 = 4003;
}

/// Categorical broker error kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Frame failed to parse as `{type, payload, meta}` JSON.
    MalformedFrame(String),
    /// Raw frame exceeded the configured maximum size.
    OversizedFrame { limit: usize, actual: usize },
    /// Sustained frame rate exceeded the sliding-window limit.
    RateLimited,
    /// `init` presented a known `publicId` with a non-matching `owner`.
    OwnerMismatch,
    /// `init` presented an `owner` for a `publicId` the manager has never
    /// seen attached with credentials (no known session to validate against).
    UnknownSessionWithOwner,
    /// Upstream connect failed to establish a TCP connection.
    UpstreamUnreachable(String),
    /// Upstream connect did not complete before the deadline.
    UpstreamTimeout,
    /// Upstream connection dropped outside of a requested disconnect.
    UpstreamClosedUnexpectedly,
    /// A transport's command could not be enqueued because the
    /// pending-command queue was full.
    CommandQueueFull,
    /// A sound rule failed to parse; the engine continues with the rest.
    RuleParseError(String),
}

impl BrokerError {
    /// The close code this error implies for the transport it originated
    /// on, if the transport must be closed. `None` means the transport
    /// stays open (the error is reported but non-fatal to the connection).
    #[must_use]
    pub fn close_code(&self) -> Option<u16> {
        match self {
            BrokerError::MalformedFrame(_) | BrokerError::OversizedFrame { .. } => {
                Some(close_code::POLICY)
            }
            BrokerError::RateLimited => Some(close_code::RATE_LIMITED),
            BrokerError::OwnerMismatch | BrokerError::UnknownSessionWithOwner => {
                Some(close_code::OWNER_INVALID)
            }
            BrokerError::UpstreamUnreachable(_)
            | BrokerError::UpstreamTimeout
            | BrokerError::UpstreamClosedUnexpectedly
            | BrokerError::CommandQueueFull
            | BrokerError::RuleParseError(_) => None,
        }
    }

    /// Short machine-readable category name, used as the `reason` or
    /// `message` field in `session_invalid`/`error` frames.
    #[must_use]
    pub fn category(&self) -> &'static str {
        match self {
            BrokerError::MalformedFrame(_) => "malformed_frame",
            BrokerError::OversizedFrame { .. } => "oversized_frame",
            BrokerError::RateLimited => "rate_limited",
            BrokerError::OwnerMismatch => "owner_mismatch",
            BrokerError::UnknownSessionWithOwner => "unknown_session_with_owner",
            BrokerError::UpstreamUnreachable(_) => "upstream_unreachable",
            BrokerError::UpstreamTimeout => "upstream_timeout",
            BrokerError::UpstreamClosedUnexpectedly => "upstream_closed_unexpectedly",
            BrokerError::CommandQueueFull => "queue_full",
            BrokerError::RuleParseError(_) => "rule_parse_error",
        }
    }
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerError::MalformedFrame(detail) => write!(f, "malformed frame: {detail}"),
            BrokerError::OversizedFrame { limit, actual } => {
                write!(f, "frame of {actual} bytes exceeds limit of {limit} bytes")
            }
            BrokerError::RateLimited => write!(f, "frame rate limit exceeded"),
            BrokerError::OwnerMismatch => write!(f, "owner does not match session"),
            BrokerError::UnknownSessionWithOwner => write!(f, "session is unknown"),
            BrokerError::UpstreamUnreachable(detail) => write!(f, "upstream unreachable: {detail}"),
            BrokerError::UpstreamTimeout => write!(f, "upstream connect timed out"),
            BrokerError::UpstreamClosedUnexpectedly => write!(f, "upstream closed unexpectedly"),
            BrokerError::CommandQueueFull => write!(f, "pending command queue full"),
            BrokerError::RuleParseError(detail) => write!(f, "rule parse error: {detail}"),
        }
    }
}

impl std::error::Error for BrokerError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_errors_close_with_policy() {
        assert_eq!(
            BrokerError::MalformedFrame("x".into()).close_code(),
            Some(close_code::POLICY)
        );
        assert_eq!(
            BrokerError::OversizedFrame { limit: 1, actual: 2 }.close_code(),
            Some(close_code::POLICY)
        );
    }

    #[test]
    fn test_rate_limited_closes_with_1013() {
        assert_eq!(BrokerError::RateLimited.close_code(), Some(close_code::RATE_LIMITED));
    }

    #[test]
    fn test_owner_errors_close_with_4003() {
        assert_eq!(BrokerError::OwnerMismatch.close_code(), Some(4003));
        assert_eq!(BrokerError::UnknownSessionWithOwner.close_code(), Some(4003));
    }

    #[test]
    fn test_upstream_and_queue_errors_do_not_close_transport() {
        assert_eq!(BrokerError::UpstreamTimeout.close_code(), None);
        assert_eq!(BrokerError::CommandQueueFull.close_code(), None);
        assert_eq!(BrokerError::RuleParseError("bad regex".into()).close_code(), None);
    }

    #[test]
    fn test_category_names() {
        assert_eq!(BrokerError::CommandQueueFull.category(), "queue_full");
        assert_eq!(BrokerError::OwnerMismatch.category(), "owner_mismatch");
    }
}
