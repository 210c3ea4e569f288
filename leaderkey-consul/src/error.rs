//! Errors talking to the Consul HTTP API.

use leaderkey_core::CoordinatorError;
use thiserror::Error;

/// Errors produced by the Consul client and its transports
#[derive(Error, Debug)]
pub enum ConsulError {
    /// The configured agent address cannot be turned into a URL
    #[error("Invalid Consul address {address:?}: {reason}")]
    InvalidAddress { address: String, reason: String },

    /// A request could not be built
    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// Connection or protocol failure below HTTP
    #[error("HTTP transport error: {message}")]
    Transport { message: String },

    /// The request did not complete in time
    #[error("Request timed out: {operation}")]
    Timeout { operation: String },

    /// The agent answered with a non-success status
    #[error("Unexpected status {status} from {operation}: {body}")]
    UnexpectedStatus {
        operation: String,
        status: u16,
        body: String,
    },

    /// The response body did not match the expected shape
    #[error("Failed to decode response from {operation}: {source}")]
    Decode {
        operation: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Result type for Consul client operations
pub type ConsulResult<T> = std::result::Result<T, ConsulError>;

impl ConsulError {
    pub fn invalid_address(address: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidAddress {
            address: address.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_request(reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            reason: reason.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    pub(crate) fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout {
                operation: err
                    .url()
                    .map(|url| url.path().to_string())
                    .unwrap_or_else(|| "request".to_string()),
            }
        } else {
            Self::transport(err.to_string())
        }
    }

    /// The agent refused an operation because the session does not exist.
    pub fn is_invalid_session(&self) -> bool {
        match self {
            Self::UnexpectedStatus { status, body, .. } => {
                *status == 500 && body.to_ascii_lowercase().contains("invalid session")
            }
            _ => false,
        }
    }
}

impl From<ConsulError> for CoordinatorError {
    fn from(err: ConsulError) -> Self {
        match err {
            ConsulError::InvalidAddress { .. } | ConsulError::InvalidRequest { .. } => {
                CoordinatorError::invalid_request(err.to_string())
            }
            ConsulError::Transport { message } => CoordinatorError::unavailable(message),
            ConsulError::Timeout { operation } => CoordinatorError::timeout(operation),
            ConsulError::UnexpectedStatus { status, .. } => match status {
                401 | 403 => CoordinatorError::permission_denied(err.to_string()),
                400 | 405 | 413 => CoordinatorError::invalid_request(err.to_string()),
                _ => CoordinatorError::unavailable(err.to_string()),
            },
            ConsulError::Decode { .. } => CoordinatorError::protocol(err.to_string()),
        }
    }
}
