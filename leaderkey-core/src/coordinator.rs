//! The coordination service seen from the election loop.
//!
//! A [`Coordinator`] creates sessions and acquires locks bound to them.
//! Every successful acquisition yields a [`HeldLock`] whose
//! [`HeldLock::lost`] future resolves once, when the lock is lost without
//! the member asking for it. The coordinator keeps the other half, a
//! [`LockLostNotifier`], inside whatever task watches the lock.

use crate::{CoordinatorResult, HealthChecks, SessionBehavior, SessionId};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::{CancellationToken, DropGuard};

/// Parameters of a new session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRequest {
    pub name: String,
    pub ttl: Duration,
    pub behavior: SessionBehavior,
    pub lock_delay: Duration,
    pub checks: HealthChecks,
}

/// Parameters of a single acquisition attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct LockRequest {
    pub key: String,
    pub session: SessionId,
    pub value: Option<Bytes>,
    /// Upper bound of one blocking wait on the key.
    pub wait_time: Duration,
}

/// Why a held lock was lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LossReason {
    /// The session was invalidated: TTL expired, a health check failed or
    /// the session was destroyed.
    SessionInvalidated,
    /// The key was released, deleted or taken by another session.
    LockReleased,
    /// The coordinator could not confirm ownership any more.
    MonitorFailed,
    /// Whatever watched the lock went away without reporting.
    MonitorStopped,
}

impl LossReason {
    /// Whether the session must be replaced before the next attempt.
    pub fn invalidates_session(&self) -> bool {
        matches!(self, Self::SessionInvalidated)
    }
}

impl fmt::Display for LossReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Self::SessionInvalidated => "session invalidated",
            Self::LockReleased => "lock released",
            Self::MonitorFailed => "monitor failed",
            Self::MonitorStopped => "monitor stopped",
        };
        f.write_str(reason)
    }
}

/// Coordinator half of an acquisition.
///
/// Fires the loss signal at most once. [`LockLostNotifier::released`]
/// completes when the member drops its [`HeldLock`], which is the cue for
/// the coordinator to stop watching the key and clean up.
#[derive(Debug)]
pub struct LockLostNotifier {
    tx: Option<oneshot::Sender<LossReason>>,
    released: CancellationToken,
}

impl LockLostNotifier {
    /// Reports the loss. Returns `false` if the member already let go of
    /// the lock or the loss was reported before.
    pub fn notify(&mut self, reason: LossReason) -> bool {
        match self.tx.take() {
            Some(tx) => tx.send(reason).is_ok(),
            None => false,
        }
    }

    pub fn is_notified(&self) -> bool {
        self.tx.is_none()
    }

    /// Resolves once the member drops the held lock.
    pub async fn released(&self) {
        self.released.cancelled().await
    }

    pub fn is_released(&self) -> bool {
        self.released.is_cancelled()
    }
}

/// Member half of an acquisition.
///
/// Dropping it tells the coordinator the member is done with the lock.
pub struct HeldLock {
    key: String,
    session: SessionId,
    lost_rx: oneshot::Receiver<LossReason>,
    reason: Option<LossReason>,
    _release: DropGuard,
}

impl HeldLock {
    /// Creates a connected pair for a freshly acquired lock.
    pub fn new(key: impl Into<String>, session: SessionId) -> (Self, LockLostNotifier) {
        let (tx, lost_rx) = oneshot::channel();
        let released = CancellationToken::new();

        let held = Self {
            key: key.into(),
            session,
            lost_rx,
            reason: None,
            _release: released.clone().drop_guard(),
        };
        let notifier = LockLostNotifier {
            tx: Some(tx),
            released,
        };

        (held, notifier)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn session(&self) -> &SessionId {
        &self.session
    }

    /// Waits until the lock is lost. Safe to call again after it resolved,
    /// it returns the same reason immediately.
    pub async fn lost(&mut self) -> LossReason {
        if let Some(reason) = self.reason {
            return reason;
        }

        let reason = (&mut self.lost_rx)
            .await
            .unwrap_or(LossReason::MonitorStopped);
        self.reason = Some(reason);
        reason
    }
}

impl fmt::Debug for HeldLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeldLock")
            .field("key", &self.key)
            .field("session", &self.session)
            .field("reason", &self.reason)
            .finish()
    }
}

/// Sessions and locks provided by an external coordination service.
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Checks a session request against the service's limits without
    /// talking to it. Members call this while being built.
    fn validate_session(&self, _request: &SessionRequest) -> CoordinatorResult<()> {
        Ok(())
    }

    /// Creates a session. Implementations keep it alive (TTL renewal) until
    /// it is destroyed or invalidated.
    async fn create_session(&self, request: &SessionRequest) -> CoordinatorResult<SessionId>;

    /// Blocks until the lock is held by `request.session` or `cancel` fires.
    ///
    /// Returns `Ok(None)` when cancelled before the lock was acquired.
    async fn acquire_lock(
        &self,
        request: &LockRequest,
        cancel: &CancellationToken,
    ) -> CoordinatorResult<Option<HeldLock>>;

    /// Destroys a session, releasing whatever it holds.
    ///
    /// Members call this from a detached task and do not wait for it.
    async fn destroy_session(&self, session: &SessionId) -> CoordinatorResult<()>;
}

#[async_trait]
impl<C: Coordinator + ?Sized> Coordinator for Arc<C> {
    fn validate_session(&self, request: &SessionRequest) -> CoordinatorResult<()> {
        (**self).validate_session(request)
    }

    async fn create_session(&self, request: &SessionRequest) -> CoordinatorResult<SessionId> {
        (**self).create_session(request).await
    }

    async fn acquire_lock(
        &self,
        request: &LockRequest,
        cancel: &CancellationToken,
    ) -> CoordinatorResult<Option<HeldLock>> {
        (**self).acquire_lock(request, cancel).await
    }

    async fn destroy_session(&self, session: &SessionId) -> CoordinatorResult<()> {
        (**self).destroy_session(session).await
    }
}
