use async_trait::async_trait;
use leaderkey_core::{
    Coordinator, CoordinatorError, CoordinatorResult, HeldLock, LockLostNotifier, LockRequest,
    LossReason, SessionId, SessionRequest,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// What one acquisition attempt does
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Fails with a retryable error
    Transient,
    /// Fails because the session is gone
    SessionInvalid,
    /// Fails with the given error
    Reject(CoordinatorError),
    /// Acquires and holds until [`ScriptedCoordinator::lose_lock`]
    Acquire,
    /// Acquires and reports the loss right away
    AcquireAndLose(LossReason),
    /// Returns as if cancelled before acquiring
    Cancelled,
    /// Blocks until cancelled
    Hang,
}

/// Coordinator replaying a fixed list of acquisition outcomes.
///
/// Once the script runs out every attempt hangs until cancelled.
pub struct ScriptedCoordinator {
    script: Mutex<VecDeque<Outcome>>,
    session_errors: Mutex<VecDeque<CoordinatorError>>,
    held: Mutex<Option<LockLostNotifier>>,
    attempts: watch::Sender<usize>,
    sessions_created: AtomicUsize,
    sessions_destroyed: AtomicUsize,
}

impl ScriptedCoordinator {
    pub fn new(script: impl IntoIterator<Item = Outcome>) -> Self {
        let (attempts, _) = watch::channel(0);
        Self {
            script: Mutex::new(script.into_iter().collect()),
            session_errors: Mutex::new(VecDeque::new()),
            held: Mutex::new(None),
            attempts,
            sessions_created: AtomicUsize::new(0),
            sessions_destroyed: AtomicUsize::new(0),
        }
    }

    /// Coordinator whose attempts all hang.
    pub fn idle() -> Self {
        Self::new(Vec::new())
    }

    /// Fails the next session creations with `errors`, in order.
    pub fn with_session_errors(self, errors: impl IntoIterator<Item = CoordinatorError>) -> Self {
        self.session_errors.lock().extend(errors);
        self
    }

    pub fn push(&self, outcome: Outcome) {
        self.script.lock().push_back(outcome);
    }

    pub fn attempts(&self) -> usize {
        *self.attempts.borrow()
    }

    pub fn sessions_created(&self) -> usize {
        self.sessions_created.load(Ordering::SeqCst)
    }

    pub fn sessions_destroyed(&self) -> usize {
        self.sessions_destroyed.load(Ordering::SeqCst)
    }

    /// Whether a lock from an [`Outcome::Acquire`] is still held by the
    /// member.
    pub fn is_held(&self) -> bool {
        self.held
            .lock()
            .as_ref()
            .map(|notifier| !notifier.is_released() && !notifier.is_notified())
            .unwrap_or(false)
    }

    /// Takes away the currently held lock. Returns `false` if there is none.
    pub fn lose_lock(&self, reason: LossReason) -> bool {
        match self.held.lock().take() {
            Some(mut notifier) => notifier.notify(reason),
            None => false,
        }
    }

    /// Waits until at least `count` attempts were made.
    pub async fn wait_for_attempts(&self, count: usize, timeout: Duration) -> bool {
        let mut rx = self.attempts.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|attempts| *attempts >= count))
            .await
            .map(|seen| seen.is_ok())
            .unwrap_or(false)
    }
}

impl Default for ScriptedCoordinator {
    fn default() -> Self {
        Self::idle()
    }
}

#[async_trait]
impl Coordinator for ScriptedCoordinator {
    async fn create_session(&self, _request: &SessionRequest) -> CoordinatorResult<SessionId> {
        if let Some(err) = self.session_errors.lock().pop_front() {
            return Err(err);
        }

        let created = self.sessions_created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(SessionId::new(format!("scripted-{}", created)))
    }

    async fn acquire_lock(
        &self,
        request: &LockRequest,
        cancel: &CancellationToken,
    ) -> CoordinatorResult<Option<HeldLock>> {
        self.attempts.send_modify(|attempts| *attempts += 1);
        let outcome = self.script.lock().pop_front().unwrap_or(Outcome::Hang);
        debug!("Scripted attempt {}: {:?}", self.attempts(), outcome);

        match outcome {
            Outcome::Transient => Err(CoordinatorError::unavailable("scripted failure")),
            Outcome::SessionInvalid => Err(CoordinatorError::session_invalidated(
                request.session.clone(),
            )),
            Outcome::Reject(err) => Err(err),
            Outcome::Acquire => {
                let (held, notifier) = HeldLock::new(request.key.clone(), request.session.clone());
                *self.held.lock() = Some(notifier);
                Ok(Some(held))
            }
            Outcome::AcquireAndLose(reason) => {
                let (held, mut notifier) =
                    HeldLock::new(request.key.clone(), request.session.clone());
                notifier.notify(reason);
                Ok(Some(held))
            }
            Outcome::Cancelled => Ok(None),
            Outcome::Hang => {
                cancel.cancelled().await;
                Ok(None)
            }
        }
    }

    async fn destroy_session(&self, _session: &SessionId) -> CoordinatorResult<()> {
        self.sessions_destroyed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use leaderkey_core::LockOptions;

    #[tokio::test]
    async fn test_script_is_replayed_in_order() {
        let coordinator = ScriptedCoordinator::new(vec![Outcome::Transient, Outcome::Acquire]);
        let options = LockOptions::new("svc/leader").unwrap();
        let session = coordinator
            .create_session(&options.session_request())
            .await
            .unwrap();
        let request = options.lock_request(session);
        let cancel = CancellationToken::new();

        assert!(coordinator.acquire_lock(&request, &cancel).await.is_err());
        let mut held = coordinator
            .acquire_lock(&request, &cancel)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(coordinator.attempts(), 2);
        assert!(coordinator.is_held());
        assert!(coordinator.lose_lock(LossReason::LockReleased));
        assert_eq!(held.lost().await, LossReason::LockReleased);
        assert!(!coordinator.is_held());
    }
}
