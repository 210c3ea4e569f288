//! Lock configuration.
//!
//! [`LockOptions`] is frozen once built: every setter lives on
//! [`LockOptionsBuilder`], which validates the accumulated values in
//! [`LockOptionsBuilder::build`].

use crate::{
    HealthChecks, LeaderKeyError, LeaderKeyResult, LockRequest, ServiceCheck, SessionBehavior,
    SessionId, SessionRequest,
};
use bytes::Bytes;
use std::time::Duration;

/// Session name used when none is configured.
pub const DEFAULT_SESSION_NAME: &str = "Consul API Lock";

/// Session TTL used when none is configured.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(15);

/// Lock delay used when none is configured.
pub const DEFAULT_LOCK_DELAY: Duration = Duration::from_secs(15);

/// Upper bound of a single blocking wait on the lock key.
pub const DEFAULT_LOCK_WAIT_TIME: Duration = Duration::from_secs(15);

/// Capacity of the channel between the election loop and the dispatcher.
pub const DEFAULT_EVENT_BUFFER: usize = 16;

/// Immutable configuration of a single lock.
#[derive(Debug, Clone, PartialEq)]
pub struct LockOptions {
    key: String,
    value: Option<Bytes>,
    session_name: String,
    session_ttl: Duration,
    lock_delay: Duration,
    session_behavior: SessionBehavior,
    health_checks: HealthChecks,
    lock_wait_time: Duration,
    retry_interval: Duration,
    event_buffer: usize,
}

impl LockOptions {
    /// Starts a builder for the given lock key.
    pub fn builder(key: impl Into<String>) -> LockOptionsBuilder {
        LockOptionsBuilder::new(key)
    }

    /// Builds options with every default for `key`.
    pub fn new(key: impl Into<String>) -> LeaderKeyResult<Self> {
        Self::builder(key).build()
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> Option<&Bytes> {
        self.value.as_ref()
    }

    pub fn session_name(&self) -> &str {
        &self.session_name
    }

    pub fn session_ttl(&self) -> Duration {
        self.session_ttl
    }

    pub fn lock_delay(&self) -> Duration {
        self.lock_delay
    }

    pub fn session_behavior(&self) -> SessionBehavior {
        self.session_behavior
    }

    pub fn health_checks(&self) -> &HealthChecks {
        &self.health_checks
    }

    pub fn lock_wait_time(&self) -> Duration {
        self.lock_wait_time
    }

    /// Pause between failed acquisition attempts. Zero retries immediately.
    pub fn retry_interval(&self) -> Duration {
        self.retry_interval
    }

    pub fn event_buffer(&self) -> usize {
        self.event_buffer
    }

    /// The session every tenure of this lock is bound to.
    pub fn session_request(&self) -> SessionRequest {
        SessionRequest {
            name: self.session_name.clone(),
            ttl: self.session_ttl,
            behavior: self.session_behavior,
            lock_delay: self.lock_delay,
            checks: self.health_checks.clone(),
        }
    }

    /// An acquisition request for this lock under `session`.
    pub fn lock_request(&self, session: SessionId) -> LockRequest {
        LockRequest {
            key: self.key.clone(),
            session,
            value: self.value.clone(),
            wait_time: self.lock_wait_time,
        }
    }
}

/// Accumulates lock settings before freezing them into [`LockOptions`].
///
/// # Examples
///
/// ```rust
/// use leaderkey_core::{LockOptions, SessionBehavior};
/// use std::time::Duration;
///
/// let options = LockOptions::builder("service/scheduler/leader")
///     .with_session_ttl(Duration::from_secs(30))
///     .with_lock_delay(Duration::from_secs(5))
///     .with_session_behavior(SessionBehavior::Delete)
///     .build()
///     .unwrap();
///
/// assert_eq!(options.session_ttl(), Duration::from_secs(30));
/// ```
#[derive(Debug, Clone)]
pub struct LockOptionsBuilder {
    key: String,
    value: Option<Bytes>,
    session_name: String,
    session_ttl: Duration,
    lock_delay: Duration,
    session_behavior: SessionBehavior,
    health_checks: HealthChecks,
    lock_wait_time: Duration,
    retry_interval: Duration,
    event_buffer: usize,
}

impl LockOptionsBuilder {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: None,
            session_name: DEFAULT_SESSION_NAME.to_string(),
            session_ttl: DEFAULT_SESSION_TTL,
            lock_delay: DEFAULT_LOCK_DELAY,
            session_behavior: SessionBehavior::default(),
            health_checks: HealthChecks::default(),
            lock_wait_time: DEFAULT_LOCK_WAIT_TIME,
            retry_interval: Duration::ZERO,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    /// Payload stored in the lock key while held.
    pub fn with_value(mut self, value: impl Into<Bytes>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn with_session_name(mut self, name: impl Into<String>) -> Self {
        self.session_name = name.into();
        self
    }

    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = ttl;
        self
    }

    pub fn with_lock_delay(mut self, delay: Duration) -> Self {
        self.lock_delay = delay;
        self
    }

    pub fn with_session_behavior(mut self, behavior: SessionBehavior) -> Self {
        self.session_behavior = behavior;
        self
    }

    pub fn with_health_checks(mut self, checks: HealthChecks) -> Self {
        self.health_checks = checks;
        self
    }

    pub fn with_check(mut self, check: impl Into<String>) -> Self {
        self.health_checks.checks.push(check.into());
        self
    }

    pub fn with_node_check(mut self, check: impl Into<String>) -> Self {
        self.health_checks.node_checks.push(check.into());
        self
    }

    pub fn with_service_check(mut self, check: ServiceCheck) -> Self {
        self.health_checks.service_checks.push(check);
        self
    }

    pub fn with_lock_wait_time(mut self, wait: Duration) -> Self {
        self.lock_wait_time = wait;
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn with_event_buffer(mut self, capacity: usize) -> Self {
        self.event_buffer = capacity;
        self
    }

    /// Validates the accumulated settings and freezes them.
    pub fn build(self) -> LeaderKeyResult<LockOptions> {
        if self.key.trim().is_empty() {
            return Err(LeaderKeyError::config("lock key must not be empty"));
        }
        if self.key.starts_with('/') {
            return Err(LeaderKeyError::config(format!(
                "lock key {:?} must not start with '/'",
                self.key
            )));
        }
        if self.session_ttl.is_zero() {
            return Err(LeaderKeyError::config("session TTL must be positive"));
        }
        if self.session_name.trim().is_empty() {
            return Err(LeaderKeyError::config("session name must not be empty"));
        }
        if self.lock_wait_time.is_zero() {
            return Err(LeaderKeyError::config("lock wait time must be positive"));
        }
        if self.event_buffer == 0 {
            return Err(LeaderKeyError::config(
                "event buffer must hold at least one transition",
            ));
        }

        Ok(LockOptions {
            key: self.key,
            value: self.value,
            session_name: self.session_name,
            session_ttl: self.session_ttl,
            lock_delay: self.lock_delay,
            session_behavior: self.session_behavior,
            health_checks: self.health_checks,
            lock_wait_time: self.lock_wait_time,
            retry_interval: self.retry_interval,
            event_buffer: self.event_buffer,
        })
    }
}
