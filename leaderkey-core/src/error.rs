//! # Error Types
//!
//! Errors surfaced by members and by coordinator implementations.

use crate::SessionId;
use thiserror::Error;

/// Errors a coordinator reports for a single operation.
///
/// Once a member is running every acquisition error is retried.
/// [`CoordinatorError::is_retryable`] only decides how loudly it is logged,
/// and whether a failed session request can be expected to succeed later.
///
/// # Examples
///
/// ```rust
/// use leaderkey_core::CoordinatorError;
///
/// let error = CoordinatorError::unavailable("connection refused");
/// assert!(error.is_retryable());
///
/// let error = CoordinatorError::permission_denied("ACL not found");
/// assert!(!error.is_retryable());
/// ```
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorError {
    /// The coordination service could not be reached or answered with a
    /// server-side failure
    #[error("Coordinator unavailable: {message}")]
    Unavailable { message: String },

    /// The operation did not complete in time
    #[error("Coordinator timeout: {operation}")]
    Timeout { operation: String },

    /// The session backing the lock no longer exists
    #[error("Session {session} has been invalidated")]
    SessionInvalidated { session: SessionId },

    /// The coordinator answered with something we could not interpret
    #[error("Coordinator protocol error: {message}")]
    Protocol { message: String },

    /// The caller is not authorized to use the key or session
    #[error("Permission denied: {message}")]
    PermissionDenied { message: String },

    /// The request itself is malformed
    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    /// The key exists but is not used as a lock
    #[error("Key {key} is in use by something other than a lock: {message}")]
    Conflict { key: String, message: String },
}

/// Result type for coordinator operations
pub type CoordinatorResult<T> = std::result::Result<T, CoordinatorError>;

impl CoordinatorError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::PermissionDenied {
            message: message.into(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    pub fn session_invalidated(session: SessionId) -> Self {
        Self::SessionInvalidated { session }
    }

    /// Whether retrying the same operation later can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Unavailable { .. }
                | Self::Timeout { .. }
                | Self::SessionInvalidated { .. }
                | Self::Protocol { .. }
        )
    }

    /// Whether a new session is needed before retrying.
    pub fn invalidates_session(&self) -> bool {
        matches!(self, Self::SessionInvalidated { .. })
    }
}

/// Errors returned from member construction and from `Member::run`.
#[derive(Error, Debug)]
pub enum LeaderKeyError {
    /// Options or coordinator configuration are invalid
    #[error("Configuration error: {reason}")]
    Config { reason: String },

    /// The member could not start participating in the election
    #[error("Startup failed for lock {key}: {source}")]
    Startup {
        key: String,
        #[source]
        source: CoordinatorError,
    },

    /// `run` was called while another `run` is in progress
    #[error("Member is already running")]
    AlreadyRunning,

    /// `run` was called on a member that already terminated
    #[error("Member has terminated and cannot be restarted")]
    AlreadyTerminated,

    /// Internal system error
    #[error("Internal error: {reason}")]
    Internal { reason: String },
}

/// Result type for member operations
pub type LeaderKeyResult<T> = std::result::Result<T, LeaderKeyError>;

impl LeaderKeyError {
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    pub fn startup(key: impl Into<String>, source: CoordinatorError) -> Self {
        Self::Startup {
            key: key.into(),
            source,
        }
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }
}

impl From<anyhow::Error> for LeaderKeyError {
    fn from(err: anyhow::Error) -> Self {
        LeaderKeyError::Internal {
            reason: err.to_string(),
        }
    }
}
