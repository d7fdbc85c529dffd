//! Error types shared by every resilience component
//!
//! Rejections never execute the protected call and are cheap to produce.
//! Failures of the protected call are wrapped in
//! [`ResilienceError::OperationFailed`] whether or not they were recorded.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Why a call was refused before it ran
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RejectionReason {
    /// The circuit breaker is OPEN or FORCED_OPEN, or HALF_OPEN with no trial
    /// slots left
    CircuitOpen,
    /// The semaphore bulkhead has no free permit
    BulkheadFull,
    /// The rate limiter could not grant a permit within the timeout
    RateLimited,
    /// The thread-pool bulkhead queue is full
    QueueFull,
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CircuitOpen => write!(f, "circuit open"),
            Self::BulkheadFull => write!(f, "bulkhead full"),
            Self::RateLimited => write!(f, "rate limited"),
            Self::QueueFull => write!(f, "queue full"),
        }
    }
}

/// Configuration validation error
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A configuration value is out of range or inconsistent
    #[error("Invalid configuration: {message}")]
    Invalid {
        /// What is wrong with the value
        message: String,
    },
}

impl ConfigError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid { message: message.into() }
    }
}

/// Errors that can occur in resilience operations
///
/// Generic over the protected operation's error type `E` so the original
/// failure is preserved as the error source.
#[derive(Debug, Error)]
pub enum ResilienceError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// The call was refused without running
    #[error("Call not permitted by '{name}': {reason}")]
    Rejected {
        /// Component that refused the call
        name: String,
        /// Why the call was refused
        reason: RejectionReason,
    },

    /// Waiting for a permit exceeded the configured maximum wait
    #[error("Timed out after {timeout:?} waiting for a permit")]
    Timeout {
        /// Maximum wait that elapsed
        timeout: Duration,
    },

    /// The call ran but missed the time limiter's deadline
    #[error("Call to '{name}' timed out after {timeout:?}")]
    TimedOut {
        /// Time limiter that cut the call off
        name: String,
        /// Deadline the call exceeded
        timeout: Duration,
    },

    /// The underlying operation failed
    #[error("Operation failed")]
    OperationFailed {
        /// Error returned by the operation
        #[source]
        source: E,
    },

    /// The worker running the operation went away before reporting a result
    #[error("Worker terminated before completing the task")]
    WorkerLost,
}

impl<E> ResilienceError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    pub(crate) fn rejected(name: &str, reason: RejectionReason) -> Self {
        Self::Rejected { name: name.to_string(), reason }
    }

    pub(crate) fn timed_out(name: &str, timeout: Duration) -> Self {
        Self::TimedOut { name: name.to_string(), timeout }
    }

    /// The rejection reason, if the call never ran
    pub fn rejection_reason(&self) -> Option<RejectionReason> {
        match self {
            Self::Rejected { reason, .. } => Some(*reason),
            _ => None,
        }
    }

    /// Whether the call was refused before running
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Rejected { .. } | Self::Timeout { .. })
    }

    /// The operation's own error, if it ran and failed
    pub fn into_source(self) -> Option<E> {
        match self {
            Self::OperationFailed { source } => Some(source),
            _ => None,
        }
    }
}

/// Result type for resilience operations
pub type ResilienceResult<T, E> = Result<T, ResilienceError<E>>;

/// Configuration result type
pub type ConfigResult<T> = Result<T, ConfigError>;

#[cfg(test)]
mod tests {
    use std::error::Error as _;
    use std::io;

    use super::*;

    /// Validates `ConfigError` display formatting.
    ///
    /// Assertions:
    /// - Confirms the message carries the validation text.
    #[test]
    fn test_config_error_display() {
        let err = ConfigError::invalid("limit_for_period must be at least 1");
        assert_eq!(err.to_string(), "Invalid configuration: limit_for_period must be at least 1");
    }

    /// Validates rejection helpers on `ResilienceError`.
    ///
    /// Assertions:
    /// - Confirms `rejection_reason()` returns the reason for rejections only.
    /// - Ensures an operation failure keeps its source error.
    #[test]
    fn test_rejection_helpers() {
        let rejected: ResilienceError<io::Error> =
            ResilienceError::rejected("backend", RejectionReason::RateLimited);
        assert_eq!(rejected.rejection_reason(), Some(RejectionReason::RateLimited));
        assert!(rejected.is_rejection());
        assert_eq!(rejected.to_string(), "Call not permitted by 'backend': rate limited");

        let failed: ResilienceError<io::Error> =
            ResilienceError::OperationFailed { source: io::Error::other("boom") };
        assert!(!failed.is_rejection());
        assert!(failed.source().is_some());
        assert_eq!(failed.into_source().map(|e| e.to_string()), Some("boom".to_string()));
    }
}
