//! Error types for the gateway core.
//!
//! Every failure a caller can observe maps to one variant here; the
//! `error_code` strings are the stable wire-level kinds. Driver detail
//! beyond a sanitized message never crosses this boundary - the full text
//! goes to the audit stream instead.

use thiserror::Error;

/// Result type alias for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Main error type for gateway operations.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Too many requests inside the sliding window.
    #[error("rate limit exceeded: {reason}")]
    RateLimited {
        /// What was exceeded.
        reason:           String,
        /// Seconds until the oldest request leaves the window.
        retry_after_secs: u64,
    },

    /// The validator refused the statement.
    #[error("statement rejected: {reason}")]
    ValidationRejected {
        /// First rule that rejected the statement.
        reason: String,
    },

    /// Execute was called without a preview-issued token.
    #[error("approval token required: preview the statement first")]
    ApprovalRequired,

    /// Token id is unknown or was already consumed.
    #[error("approval token invalid: {reason}")]
    ApprovalInvalid {
        /// Why the token was not accepted.
        reason: String,
    },

    /// Token is past its validity window.
    #[error("approval token expired {expired_for_secs}s ago")]
    ApprovalExpired {
        /// How long ago the token expired.
        expired_for_secs: u64,
    },

    /// The SQL presented at execute differs from the previewed SQL.
    #[error("approval token does not match the submitted statement")]
    ApprovalMismatch,

    /// Circuit breaker is refusing all database calls.
    #[error("circuit open: retry in {retry_after_secs}s")]
    CircuitOpen {
        /// Remaining cool-down in seconds.
        retry_after_secs: u64,
    },

    /// No idle session became available inside the acquire window.
    #[error("no database session available within {waited_ms}ms")]
    PoolTimeout {
        /// How long the caller waited.
        waited_ms: u64,
    },

    /// Sanitized driver-level failure.
    #[error("database error: {message}")]
    Driver {
        /// Sanitized driver message.
        message: String,
    },

    /// Name failed the identifier whitelist.
    #[error("invalid identifier: {name}")]
    BadIdentifier {
        /// The offending name.
        name: String,
    },

    /// Invalid or missing startup configuration.
    #[error("configuration error: {message}")]
    Configuration {
        /// What is wrong with the configuration.
        message: String,
    },

    /// Unexpected internal failure. Should be rare.
    #[error("internal error: {message}")]
    Internal {
        /// Error message.
        message: String,
    },
}

impl GatewayError {
    /// Create a rate-limited error.
    #[must_use]
    pub fn rate_limited(reason: impl Into<String>, retry_after_secs: u64) -> Self {
        Self::RateLimited {
            reason: reason.into(),
            retry_after_secs,
        }
    }

    /// Create a validation rejection.
    #[must_use]
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::ValidationRejected {
            reason: reason.into(),
        }
    }

    /// Create an approval-invalid error.
    #[must_use]
    pub fn approval_invalid(reason: impl Into<String>) -> Self {
        Self::ApprovalInvalid {
            reason: reason.into(),
        }
    }

    /// Create a driver error.
    #[must_use]
    pub fn driver(message: impl Into<String>) -> Self {
        Self::Driver {
            message: message.into(),
        }
    }

    /// Create a bad-identifier error.
    #[must_use]
    pub fn bad_identifier(name: impl Into<String>) -> Self {
        Self::BadIdentifier { name: name.into() }
    }

    /// Create a configuration error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Stable wire-level error kind.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::ValidationRejected { .. } => "validation_rejected",
            Self::ApprovalRequired => "approval_required",
            Self::ApprovalInvalid { .. } => "approval_invalid",
            Self::ApprovalExpired { .. } => "approval_expired",
            Self::ApprovalMismatch => "approval_mismatch",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::PoolTimeout { .. } => "pool_timeout",
            Self::Driver { .. } => "driver_error",
            Self::BadIdentifier { .. } => "bad_identifier",
            Self::Configuration { .. } => "configuration",
            Self::Internal { .. } => "internal",
        }
    }

    /// Retry-after hint in seconds, where one is meaningful.
    #[must_use]
    pub const fn retry_after(&self) -> Option<u64> {
        match self {
            Self::RateLimited {
                retry_after_secs, ..
            }
            | Self::CircuitOpen {
                retry_after_secs, ..
            } => Some(*retry_after_secs),
            _ => None,
        }
    }

    /// Check if this error was caused by the caller's input or pacing.
    #[must_use]
    pub const fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. }
                | Self::ValidationRejected { .. }
                | Self::ApprovalRequired
                | Self::ApprovalInvalid { .. }
                | Self::ApprovalExpired { .. }
                | Self::ApprovalMismatch
                | Self::BadIdentifier { .. }
        )
    }
}
