//! Retry classification for sync failures
//!
//! The engine never retries provider calls itself: a blind retry of a create
//! can duplicate the external item. Errors instead tell the caller whether a
//! retry is safe and how long to wait.

use std::time::Duration;

/// Retry classification for errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry the operation
    Retry,
    /// Retry after a specific duration (e.g., from Retry-After header)
    RetryAfter(Duration),
    /// Don't retry, the error is permanent
    NoRetry,
}

impl RetryDecision {
    /// Suggested wait before retrying, if any
    pub fn delay(&self) -> Option<Duration> {
        match self {
            RetryDecision::RetryAfter(d) => Some(*d),
            _ => None,
        }
    }
}

/// Trait for errors that can indicate whether to retry
pub trait RetryableError {
    /// Determine if this error should be retried
    fn retry_decision(&self) -> RetryDecision;
}

/// Parse a `Retry-After` header value given in seconds
pub fn parse_retry_after(value: Option<&str>) -> Option<Duration> {
    value
        .map(str::trim)
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
}
