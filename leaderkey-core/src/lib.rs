//! # LeaderKey Core
//!
//! Shared building blocks for leader election on top of a coordination
//! service that offers sessions and mutually exclusive locks.
//!
//! ## Components
//!
//! - **Membership**: the local role, `Leader` or `Follower`
//! - **LockOptions**: immutable lock configuration assembled by a builder
//! - **Coordinator**: trait implemented by coordination service clients
//! - **HeldLock / LockLostNotifier**: the two halves of one acquisition
//! - **ShutdownLatch**: idempotent termination signal
//! - **Errors**: coordinator errors and member errors
//!
//! ```rust
//! use leaderkey_core::{LockOptions, SessionId};
//! use std::time::Duration;
//!
//! let options = LockOptions::builder("service/api/leader")
//!     .with_session_ttl(Duration::from_secs(10))
//!     .build()
//!     .unwrap();
//!
//! let request = options.lock_request(SessionId::from("adf4238a-882b-9ddc-4a9d-5b6758e4159e"));
//! assert_eq!(request.key, "service/api/leader");
//! ```

pub mod coordinator;
pub mod error;
pub mod options;
pub mod shutdown;
pub mod types;

pub use coordinator::*;
pub use error::*;
pub use options::*;
pub use shutdown::*;
pub use types::*;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_options_round_trip_into_requests() {
        let options = LockOptions::builder("svc/leader")
            .with_session_ttl(Duration::from_secs(20))
            .with_session_behavior(SessionBehavior::Delete)
            .build()
            .unwrap();

        let session = options.session_request();
        assert_eq!(session.ttl, Duration::from_secs(20));
        assert_eq!(session.behavior, SessionBehavior::Delete);
        assert_eq!(session.name, DEFAULT_SESSION_NAME);
    }

    #[test]
    fn test_error_types() {
        let error = CoordinatorError::unavailable("test error");
        assert!(error.is_retryable());

        let error = LeaderKeyError::config("bad key");
        assert_eq!(error.to_string(), "Configuration error: bad key");
    }
}
