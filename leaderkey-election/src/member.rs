//! The public face of an election participant.

use crate::{CallbackDispatcher, CallbackHandler, ElectionLoop, TransitionHandler};
use bytes::Bytes;
use leaderkey_consul::{ConsulConfig, ConsulCoordinator};
use leaderkey_core::{
    Coordinator, HealthChecks, LeaderKeyError, LeaderKeyResult, LockOptions, LockOptionsBuilder,
    Membership, ServiceCheck, SessionBehavior, ShutdownLatch,
};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Lifecycle of a [`Member`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberState {
    Created,
    Running,
    Terminated,
}

/// A participant in the election for one lock key.
///
/// A member runs at most once: [`Member::run`] takes part in the election
/// until cancelled or stopped, and afterwards the member stays terminated.
///
/// # Examples
///
/// ```rust,no_run
/// use leaderkey_election::Member;
/// use tokio_util::sync::CancellationToken;
///
/// # async fn example() -> leaderkey_core::LeaderKeyResult<()> {
/// let member = Member::builder("service/api/leader")
///     .on_leader(|| println!("leading"))
///     .on_follower(|| println!("following"))
///     .build()?;
///
/// member.run(CancellationToken::new()).await
/// # }
/// ```
pub struct Member {
    coordinator: Arc<dyn Coordinator>,
    options: Arc<LockOptions>,
    handler: Arc<dyn TransitionHandler>,
    shutdown: ShutdownLatch,
    state: Mutex<MemberState>,
    membership: Arc<watch::Sender<Membership>>,
}

impl Member {
    /// Member with no-op callbacks.
    pub fn new(coordinator: Arc<dyn Coordinator>, options: LockOptions) -> LeaderKeyResult<Self> {
        Self::with_handler(coordinator, options, Arc::new(CallbackHandler::new()))
    }

    /// Fails with [`LeaderKeyError::Config`] when the coordinator refuses
    /// the session the options describe.
    pub fn with_handler(
        coordinator: Arc<dyn Coordinator>,
        options: LockOptions,
        handler: Arc<dyn TransitionHandler>,
    ) -> LeaderKeyResult<Self> {
        coordinator
            .validate_session(&options.session_request())
            .map_err(|e| LeaderKeyError::config(format!("lock {}: {}", options.key(), e)))?;

        let (membership, _) = watch::channel(Membership::Follower);
        Ok(Self {
            coordinator,
            options: Arc::new(options),
            handler,
            shutdown: ShutdownLatch::new(),
            state: Mutex::new(MemberState::Created),
            membership: Arc::new(membership),
        })
    }

    pub fn builder(key: impl Into<String>) -> MemberBuilder {
        MemberBuilder::new(key)
    }

    pub fn options(&self) -> &LockOptions {
        &self.options
    }

    /// Last known role.
    pub fn membership(&self) -> Membership {
        *self.membership.borrow()
    }

    /// Receiver that observes every role change.
    pub fn subscribe(&self) -> watch::Receiver<Membership> {
        self.membership.subscribe()
    }

    pub fn state(&self) -> MemberState {
        *self.state.lock()
    }

    /// Takes part in the election until `cancel` fires or [`Member::stop`]
    /// is called.
    ///
    /// Returns `Ok(())` on cancellation or stop. Acquisition failures are
    /// retried; errors are returned when the first session cannot be
    /// created or when the member already ran.
    pub async fn run(&self, cancel: CancellationToken) -> LeaderKeyResult<()> {
        {
            let mut state = self.state.lock();
            match *state {
                MemberState::Running => return Err(LeaderKeyError::AlreadyRunning),
                MemberState::Terminated => return Err(LeaderKeyError::AlreadyTerminated),
                MemberState::Created => *state = MemberState::Running,
            }
        }
        let _terminate = TerminateOnDrop { member: self };

        if self.shutdown.is_triggered() {
            info!("Member for {} stopped before it started", self.options.key());
            return Ok(());
        }

        info!("Member starting for {}", self.options.key());

        let (events_tx, events_rx) = mpsc::channel(self.options.event_buffer());
        let dispatcher =
            CallbackDispatcher::new(self.handler.clone(), events_rx, self.shutdown.clone());
        tokio::spawn(dispatcher.run());

        let election = ElectionLoop::new(
            self.coordinator.clone(),
            self.options.clone(),
            events_tx,
            self.shutdown.clone(),
            self.membership.clone(),
        );
        let result = election.run(cancel).await;

        match &result {
            Ok(()) => info!("Member for {} stopped", self.options.key()),
            Err(e) => error!("Member for {} failed: {}", self.options.key(), e),
        }
        result
    }

    /// Asks a running member to terminate. Safe to call any number of
    /// times, from any thread, before or during [`Member::run`].
    pub fn stop(&self) {
        if self.shutdown.trigger() {
            info!("Stop requested for {}", self.options.key());
        }
    }
}

impl fmt::Debug for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Member")
            .field("key", &self.options.key())
            .field("state", &self.state())
            .field("membership", &self.membership())
            .finish()
    }
}

/// Marks the member terminated and stops the dispatcher however `run`
/// ends, including when its future is dropped.
struct TerminateOnDrop<'a> {
    member: &'a Member,
}

impl Drop for TerminateOnDrop<'_> {
    fn drop(&mut self) {
        self.member.shutdown.trigger();
        *self.member.state.lock() = MemberState::Terminated;
    }
}

enum CoordinatorSource {
    Env,
    Consul(ConsulConfig),
    Custom(Arc<dyn Coordinator>),
}

/// Builds a [`Member`] from lock options, a coordinator and callbacks.
pub struct MemberBuilder {
    options: LockOptionsBuilder,
    coordinator: CoordinatorSource,
    handler: Option<Arc<dyn TransitionHandler>>,
    callbacks: CallbackHandler,
}

impl MemberBuilder {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            options: LockOptions::builder(key),
            coordinator: CoordinatorSource::Env,
            handler: None,
            callbacks: CallbackHandler::new(),
        }
    }

    pub fn with_value(mut self, value: impl Into<Bytes>) -> Self {
        self.options = self.options.with_value(value);
        self
    }

    pub fn with_session_name(mut self, name: impl Into<String>) -> Self {
        self.options = self.options.with_session_name(name);
        self
    }

    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.options = self.options.with_session_ttl(ttl);
        self
    }

    pub fn with_lock_delay(mut self, delay: Duration) -> Self {
        self.options = self.options.with_lock_delay(delay);
        self
    }

    pub fn with_session_behavior(mut self, behavior: SessionBehavior) -> Self {
        self.options = self.options.with_session_behavior(behavior);
        self
    }

    pub fn with_health_checks(mut self, checks: HealthChecks) -> Self {
        self.options = self.options.with_health_checks(checks);
        self
    }

    pub fn with_check(mut self, check: impl Into<String>) -> Self {
        self.options = self.options.with_check(check);
        self
    }

    pub fn with_node_check(mut self, check: impl Into<String>) -> Self {
        self.options = self.options.with_node_check(check);
        self
    }

    pub fn with_service_check(mut self, check: ServiceCheck) -> Self {
        self.options = self.options.with_service_check(check);
        self
    }

    pub fn with_lock_wait_time(mut self, wait: Duration) -> Self {
        self.options = self.options.with_lock_wait_time(wait);
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.options = self.options.with_retry_interval(interval);
        self
    }

    pub fn with_event_buffer(mut self, capacity: usize) -> Self {
        self.options = self.options.with_event_buffer(capacity);
        self
    }

    /// Uses a Consul agent configured explicitly.
    pub fn consul(mut self, config: ConsulConfig) -> Self {
        self.coordinator = CoordinatorSource::Consul(config);
        self
    }

    /// Uses an already built coordinator.
    pub fn coordinator(mut self, coordinator: Arc<dyn Coordinator>) -> Self {
        self.coordinator = CoordinatorSource::Custom(coordinator);
        self
    }

    pub fn handler(mut self, handler: Arc<dyn TransitionHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn on_leader<F>(mut self, callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.callbacks = self.callbacks.with_on_leader(callback);
        self
    }

    pub fn on_follower<F>(mut self, callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.callbacks = self.callbacks.with_on_follower(callback);
        self
    }

    pub fn build(self) -> LeaderKeyResult<Member> {
        let options = self.options.build()?;

        let handler: Arc<dyn TransitionHandler> = match self.handler {
            Some(_) if !self.callbacks.is_empty() => {
                return Err(LeaderKeyError::config(
                    "use either a transition handler or on_leader/on_follower callbacks",
                ));
            }
            Some(handler) => handler,
            None => Arc::new(self.callbacks),
        };

        let coordinator: Arc<dyn Coordinator> = match self.coordinator {
            CoordinatorSource::Custom(coordinator) => coordinator,
            CoordinatorSource::Consul(config) => Arc::new(consul(config)?),
            CoordinatorSource::Env => Arc::new(consul(ConsulConfig::from_env())?),
        };

        Member::with_handler(coordinator, options, handler)
    }
}

fn consul(config: ConsulConfig) -> LeaderKeyResult<ConsulCoordinator> {
    ConsulCoordinator::new(config).map_err(|e| LeaderKeyError::config(e.to_string()))
}

impl fmt::Debug for MemberBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemberBuilder")
            .field("options", &self.options)
            .field("callbacks", &self.callbacks)
            .finish()
    }
}
