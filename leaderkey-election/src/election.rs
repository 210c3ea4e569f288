//! The acquisition state machine.

use leaderkey_core::{
    Coordinator, CoordinatorError, HeldLock, LeaderKeyError, LeaderKeyResult, LockOptions,
    Membership, MembershipTransition, SessionId, ShutdownLatch,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Upper bound for a detached session cleanup
const SESSION_DESTROY_TIMEOUT: Duration = Duration::from_secs(5);

/// Repeatedly acquires the lock and reports every change of membership.
///
/// The loop owns the only writer of the membership watch channel and the
/// only sender of transition events. It returns `Ok(())` when cancelled or
/// shut down. The only errors are a first session that cannot be created
/// and a dispatcher that went away while transitions were still owed.
///
/// Sessions are destroyed from detached tasks, also when the loop is
/// dropped mid-flight, so stopping never waits on the coordinator.
pub struct ElectionLoop {
    coordinator: Arc<dyn Coordinator>,
    options: Arc<LockOptions>,
    events: mpsc::Sender<MembershipTransition>,
    shutdown: ShutdownLatch,
    membership: Arc<watch::Sender<Membership>>,
    session: Option<SessionId>,
    tenure: u64,
    attempts: u64,
}

impl ElectionLoop {
    pub fn new(
        coordinator: Arc<dyn Coordinator>,
        options: Arc<LockOptions>,
        events: mpsc::Sender<MembershipTransition>,
        shutdown: ShutdownLatch,
        membership: Arc<watch::Sender<Membership>>,
    ) -> Self {
        Self {
            coordinator,
            options,
            events,
            shutdown,
            membership,
            session: None,
            tenure: 0,
            attempts: 0,
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) -> LeaderKeyResult<()> {
        let key = self.options.key().to_string();

        let request = self.options.session_request();
        let created = tokio::select! {
            biased;
            _ = self.shutdown.wait() => return Ok(()),
            _ = cancel.cancelled() => return Ok(()),
            created = self.coordinator.create_session(&request) => created,
        };
        match created {
            Ok(session) => {
                debug!("Using session {} for {}", session, key);
                self.session = Some(session);
            }
            Err(err) => {
                error!("Failed to create session for {}: {}", key, err);
                return Err(LeaderKeyError::startup(key, err));
            }
        }

        let result = self.elect(&cancel).await;

        // Leaving never produces a Follower event, but the role is reset.
        self.membership.send_replace(Membership::Follower);
        self.discard_session();

        debug!(
            "Election loop for {} finished after {} attempts and {} tenures",
            key, self.attempts, self.tenure
        );
        result
    }

    async fn elect(&mut self, cancel: &CancellationToken) -> LeaderKeyResult<()> {
        loop {
            let session = match self.session.clone() {
                Some(session) => session,
                None => match self.replace_session(cancel).await {
                    Some(Ok(session)) => session,
                    Some(Err(err)) => {
                        warn!(
                            "Failed to create session for {}: {}",
                            self.options.key(),
                            err
                        );
                        if !self.pause(cancel).await {
                            return Ok(());
                        }
                        continue;
                    }
                    None => return Ok(()),
                },
            };

            self.attempts += 1;
            let request = self.options.lock_request(session);
            debug!(
                "Acquiring {} (attempt {})",
                self.options.key(),
                self.attempts
            );

            let acquired = tokio::select! {
                biased;
                _ = self.shutdown.wait() => return Ok(()),
                _ = cancel.cancelled() => return Ok(()),
                acquired = self.coordinator.acquire_lock(&request, cancel) => acquired,
            };

            match acquired {
                Ok(Some(held)) => {
                    if !self.lead(held, cancel).await? {
                        return Ok(());
                    }
                    continue;
                }
                Ok(None) => {
                    debug!("Acquisition of {} cancelled", self.options.key());
                    return Ok(());
                }
                Err(err) if err.invalidates_session() => {
                    warn!("Session lost while acquiring {}: {}", self.options.key(), err);
                    self.discard_session();
                }
                Err(err) if err.is_retryable() => {
                    warn!(
                        "Failed to acquire {} (attempt {}): {}",
                        self.options.key(),
                        self.attempts,
                        err
                    );
                }
                Err(err) => {
                    // Permissions and key usage can change while running.
                    error!(
                        "Coordinator rejected {} (attempt {}), retrying: {}",
                        self.options.key(),
                        self.attempts,
                        err
                    );
                }
            }

            if !self.pause(cancel).await {
                return Ok(());
            }
        }
    }

    /// Holds leadership until the lock is lost. `Ok(false)` when the loop
    /// must exit instead of trying again.
    async fn lead(
        &mut self,
        mut held: HeldLock,
        cancel: &CancellationToken,
    ) -> LeaderKeyResult<bool> {
        self.tenure += 1;
        self.membership.send_replace(Membership::Leader);
        info!(
            "Acquired leadership of {} (tenure {})",
            self.options.key(),
            self.tenure
        );

        if !self
            .emit(MembershipTransition::leader(self.tenure), cancel)
            .await?
        {
            return Ok(false);
        }

        let reason = tokio::select! {
            biased;
            _ = self.shutdown.wait() => return Ok(false),
            _ = cancel.cancelled() => return Ok(false),
            reason = held.lost() => reason,
        };
        drop(held);

        self.membership.send_replace(Membership::Follower);
        info!(
            "Lost leadership of {} (tenure {}): {}",
            self.options.key(),
            self.tenure,
            reason
        );

        if reason.invalidates_session() {
            self.discard_session();
        }

        self.emit(MembershipTransition::follower(self.tenure), cancel)
            .await
    }

    /// Queues a transition for the dispatcher. `Ok(false)` if the loop was
    /// stopped first; an error if the dispatcher is gone.
    async fn emit(
        &self,
        transition: MembershipTransition,
        cancel: &CancellationToken,
    ) -> LeaderKeyResult<bool> {
        tokio::select! {
            biased;
            _ = self.shutdown.wait() => Ok(false),
            _ = cancel.cancelled() => Ok(false),
            sent = self.events.send(transition) => match sent {
                Ok(()) => Ok(true),
                Err(_) => {
                    error!(
                        "Dispatcher for {} is gone, cannot deliver {}",
                        self.options.key(),
                        transition
                    );
                    Err(LeaderKeyError::internal(format!(
                        "callback dispatcher stopped before {} was delivered",
                        transition
                    )))
                }
            },
        }
    }

    /// `None` when stopped before a session was created.
    async fn replace_session(
        &mut self,
        cancel: &CancellationToken,
    ) -> Option<Result<SessionId, CoordinatorError>> {
        let request = self.options.session_request();
        let created = tokio::select! {
            biased;
            _ = self.shutdown.wait() => return None,
            _ = cancel.cancelled() => return None,
            created = self.coordinator.create_session(&request) => created,
        };

        if let Ok(session) = &created {
            debug!("Replaced session for {} with {}", self.options.key(), session);
            self.session = Some(session.clone());
        }
        Some(created)
    }

    /// Forgets the current session and destroys it in the background.
    fn discard_session(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!("No runtime left to destroy session {}", session);
            return;
        };

        let coordinator = self.coordinator.clone();
        runtime.spawn(async move {
            let destroyed = coordinator.destroy_session(&session);
            match tokio::time::timeout(SESSION_DESTROY_TIMEOUT, destroyed).await {
                Ok(Ok(())) => debug!("Destroyed session {}", session),
                Ok(Err(err)) => debug!("Failed to destroy session {}: {}", session, err),
                Err(_) => debug!("Timed out destroying session {}", session),
            }
        });
    }

    /// Waits `retry_interval` between attempts, or just yields when it is
    /// zero. Returns `false` if the loop was stopped meanwhile.
    async fn pause(&self, cancel: &CancellationToken) -> bool {
        let interval = self.options.retry_interval();
        if interval.is_zero() {
            tokio::task::yield_now().await;
            return !(self.shutdown.is_triggered() || cancel.is_cancelled());
        }

        tokio::select! {
            biased;
            _ = self.shutdown.wait() => false,
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(interval) => true,
        }
    }
}

impl Drop for ElectionLoop {
    fn drop(&mut self) {
        self.discard_session();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use leaderkey_core::{CoordinatorResult, LockRequest, LossReason, SessionRequest};
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    enum Step {
        Fail(CoordinatorError),
        Lose(LossReason),
    }

    /// Plays `steps` in order, then blocks until cancelled.
    #[derive(Default)]
    struct StepCoordinator {
        steps: Mutex<VecDeque<Step>>,
        sessions: Mutex<u32>,
        attempts: Mutex<u32>,
        destroyed: Mutex<u32>,
        stuck_destroy: bool,
    }

    impl StepCoordinator {
        fn new(steps: Vec<Step>) -> Arc<Self> {
            Arc::new(Self {
                steps: Mutex::new(steps.into()),
                ..Default::default()
            })
        }

        /// Never finishes destroying a session, like an unreachable agent.
        fn stuck() -> Arc<Self> {
            Arc::new(Self {
                stuck_destroy: true,
                ..Default::default()
            })
        }

        async fn wait_until(&self, done: impl Fn(&Self) -> bool) {
            tokio::time::timeout(Duration::from_secs(5), async {
                while !done(self) {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .expect("condition not reached in time");
        }
    }

    #[async_trait]
    impl Coordinator for StepCoordinator {
        async fn create_session(&self, _request: &SessionRequest) -> CoordinatorResult<SessionId> {
            let mut sessions = self.sessions.lock();
            *sessions += 1;
            Ok(SessionId::new(format!("s{}", sessions)))
        }

        async fn acquire_lock(
            &self,
            request: &LockRequest,
            cancel: &CancellationToken,
        ) -> CoordinatorResult<Option<HeldLock>> {
            *self.attempts.lock() += 1;
            let step = self.steps.lock().pop_front();
            match step {
                Some(Step::Fail(err)) => Err(err),
                Some(Step::Lose(reason)) => {
                    let (held, mut notifier) =
                        HeldLock::new(request.key.clone(), request.session.clone());
                    notifier.notify(reason);
                    Ok(Some(held))
                }
                None => {
                    cancel.cancelled().await;
                    Ok(None)
                }
            }
        }

        async fn destroy_session(&self, _session: &SessionId) -> CoordinatorResult<()> {
            if self.stuck_destroy {
                std::future::pending::<()>().await;
            }
            *self.destroyed.lock() += 1;
            Ok(())
        }
    }

    fn election(
        coordinator: Arc<StepCoordinator>,
    ) -> (
        ElectionLoop,
        mpsc::Receiver<MembershipTransition>,
        watch::Receiver<Membership>,
    ) {
        let options = Arc::new(LockOptions::new("svc/leader").unwrap());
        let (tx, rx) = mpsc::channel(16);
        let (membership, membership_rx) = watch::channel(Membership::Follower);
        let election = ElectionLoop::new(
            coordinator,
            options,
            tx,
            ShutdownLatch::new(),
            Arc::new(membership),
        );
        (election, rx, membership_rx)
    }

    #[tokio::test]
    async fn test_losses_alternate_and_invalid_sessions_are_replaced() {
        let coordinator = StepCoordinator::new(vec![
            Step::Fail(CoordinatorError::unavailable("down")),
            Step::Lose(LossReason::LockReleased),
            Step::Lose(LossReason::SessionInvalidated),
            Step::Fail(CoordinatorError::session_invalidated(SessionId::from("s2"))),
        ]);
        let (election, mut rx, membership) = election(coordinator.clone());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(election.run(cancel.clone()));

        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(rx.recv().await.unwrap());
        }
        cancel.cancel();
        task.await.unwrap().unwrap();

        assert_eq!(
            seen,
            vec![
                MembershipTransition::leader(1),
                MembershipTransition::follower(1),
                MembershipTransition::leader(2),
                MembershipTransition::follower(2),
            ]
        );
        assert_eq!(*membership.borrow(), Membership::Follower);

        // Every session created is destroyed again, including the replaced ones.
        let sessions = *coordinator.sessions.lock();
        assert!(sessions >= 2);
        coordinator
            .wait_until(|c| *c.destroyed.lock() == sessions)
            .await;
    }

    #[tokio::test]
    async fn test_rejected_attempts_are_retried() {
        let coordinator = StepCoordinator::new(vec![
            Step::Lose(LossReason::LockReleased),
            Step::Fail(CoordinatorError::permission_denied("ACL not found")),
            Step::Fail(CoordinatorError::Conflict {
                key: "svc/leader".to_string(),
                message: "unexpected flags".to_string(),
            }),
            Step::Lose(LossReason::LockReleased),
        ]);
        let (election, mut rx, _membership) = election(coordinator.clone());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(election.run(cancel.clone()));

        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(rx.recv().await.unwrap());
        }
        assert_eq!(seen[2], MembershipTransition::leader(2));
        coordinator.wait_until(|c| *c.attempts.lock() >= 5).await;

        cancel.cancel();
        task.await.unwrap().unwrap();
        assert_eq!(*coordinator.sessions.lock(), 1);
    }

    #[tokio::test]
    async fn test_missing_dispatcher_ends_the_loop() {
        let coordinator = StepCoordinator::new(vec![Step::Lose(LossReason::LockReleased)]);
        let (election, rx, membership) = election(coordinator.clone());
        drop(rx);

        let result = election.run(CancellationToken::new()).await;
        assert!(matches!(result, Err(LeaderKeyError::Internal { .. })));
        assert_eq!(*membership.borrow(), Membership::Follower);
        assert_eq!(*coordinator.attempts.lock(), 1);
    }

    #[tokio::test]
    async fn test_cancel_does_not_wait_for_session_cleanup() {
        let coordinator = StepCoordinator::stuck();
        let (election, _rx, _membership) = election(coordinator.clone());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(election.run(cancel.clone()));

        coordinator.wait_until(|c| *c.attempts.lock() >= 1).await;
        cancel.cancel();

        tokio::time::timeout(Duration::from_millis(100), task)
            .await
            .expect("run waited for destroy_session")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_dropped_loop_destroys_its_session() {
        let coordinator = StepCoordinator::new(Vec::new());
        let (election, _rx, _membership) = election(coordinator.clone());
        let task = tokio::spawn(election.run(CancellationToken::new()));

        coordinator.wait_until(|c| *c.attempts.lock() >= 1).await;
        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());

        coordinator.wait_until(|c| *c.destroyed.lock() == 1).await;
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let coordinator = StepCoordinator::new(Vec::new());
        let (election, _rx, _membership) = election(coordinator.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();

        election.run(cancel).await.unwrap();
        assert_eq!(*coordinator.sessions.lock(), 0);
    }
}
