//! # Core Types
//!
//! Fundamental types shared by the election loop, the callback dispatcher
//! and coordinator implementations.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// The local process's last-known role in the election.
///
/// A member starts as a [`Membership::Follower`] and only becomes
/// [`Membership::Leader`] once the coordinator confirms the lock is held.
///
/// # Examples
///
/// ```rust
/// use leaderkey_core::Membership;
///
/// let membership = Membership::default();
/// assert_eq!(membership, Membership::Follower);
/// assert!(!membership.is_leader());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Membership {
    /// Not holding the lock.
    #[default]
    Follower,
    /// Holding the lock.
    Leader,
}

impl Membership {
    pub fn is_leader(&self) -> bool {
        matches!(self, Self::Leader)
    }
}

impl fmt::Display for Membership {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Follower => write!(f, "follower"),
            Self::Leader => write!(f, "leader"),
        }
    }
}

/// A membership change produced by the election loop and consumed by the
/// callback dispatcher.
///
/// Transitions are numbered by tenure: the `Leader` transition that opens a
/// tenure and the `Follower` transition that closes it share the same
/// tenure number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipTransition {
    pub membership: Membership,
    pub tenure: u64,
}

impl MembershipTransition {
    pub fn new(membership: Membership, tenure: u64) -> Self {
        Self { membership, tenure }
    }

    pub fn leader(tenure: u64) -> Self {
        Self::new(Membership::Leader, tenure)
    }

    pub fn follower(tenure: u64) -> Self {
        Self::new(Membership::Follower, tenure)
    }
}

impl fmt::Display for MembershipTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (tenure {})", self.membership, self.tenure)
    }
}

/// Identifier of a session created in the coordination service.
///
/// Coordinators hand these out from `create_session`; the value is opaque to
/// the election loop.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Creates a random identifier, for coordinators that mint their own.
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SessionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// What the coordination service does with held locks once a session is
/// invalidated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionBehavior {
    /// Release the lock, keeping the key.
    #[default]
    Release,
    /// Delete the key holding the lock.
    Delete,
}

impl SessionBehavior {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Release => "release",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for SessionBehavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A service health check whose failure invalidates the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceCheck {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl ServiceCheck {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            namespace: None,
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }
}

/// Health signals bound to the session. When any of them fails the
/// coordinator invalidates the session and the lock is lost.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HealthChecks {
    /// Plain check identifiers.
    #[serde(default)]
    pub checks: Vec<String>,
    /// Node-level checks.
    #[serde(default)]
    pub node_checks: Vec<String>,
    /// Service-level checks.
    #[serde(default)]
    pub service_checks: Vec<ServiceCheck>,
}

impl HealthChecks {
    pub fn is_empty(&self) -> bool {
        self.checks.is_empty() && self.node_checks.is_empty() && self.service_checks.is_empty()
    }
}
