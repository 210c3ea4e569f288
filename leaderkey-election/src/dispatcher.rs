//! Delivery of membership transitions to user code.

use async_trait::async_trait;
use futures_util::FutureExt;
use leaderkey_core::{Membership, MembershipTransition, ShutdownLatch};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error};

/// Receives membership transitions, one at a time and in order.
///
/// Both methods default to doing nothing. A handler that panics is logged
/// and the dispatcher moves on to the next transition.
#[async_trait]
pub trait TransitionHandler: Send + Sync {
    async fn on_leader(&self, _transition: &MembershipTransition) {}

    async fn on_follower(&self, _transition: &MembershipTransition) {}
}

/// Synchronous user callback
pub type Callback = Arc<dyn Fn() + Send + Sync>;

/// Handler made of plain closures.
///
/// Closures run on the blocking pool, so a slow callback never occupies a
/// runtime worker.
#[derive(Clone, Default)]
pub struct CallbackHandler {
    on_leader: Option<Callback>,
    on_follower: Option<Callback>,
}

impl CallbackHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_on_leader<F>(mut self, callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_leader = Some(Arc::new(callback));
        self
    }

    pub fn with_on_follower<F>(mut self, callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_follower = Some(Arc::new(callback));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.on_leader.is_none() && self.on_follower.is_none()
    }

    async fn invoke(callback: &Option<Callback>, transition: &MembershipTransition) {
        let Some(callback) = callback.clone() else {
            return;
        };

        if let Err(e) = tokio::task::spawn_blocking(move || callback()).await {
            if e.is_panic() {
                error!("Callback for {} panicked", transition);
            }
        }
    }
}

impl fmt::Debug for CallbackHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackHandler")
            .field("on_leader", &self.on_leader.is_some())
            .field("on_follower", &self.on_follower.is_some())
            .finish()
    }
}

#[async_trait]
impl TransitionHandler for CallbackHandler {
    async fn on_leader(&self, transition: &MembershipTransition) {
        Self::invoke(&self.on_leader, transition).await
    }

    async fn on_follower(&self, transition: &MembershipTransition) {
        Self::invoke(&self.on_follower, transition).await
    }
}

/// Relays transitions from the election loop to a [`TransitionHandler`].
///
/// Runs until the shutdown latch fires. A callback already in progress at
/// that point runs to completion; transitions still queued are dropped.
pub struct CallbackDispatcher {
    handler: Arc<dyn TransitionHandler>,
    events: mpsc::Receiver<MembershipTransition>,
    shutdown: ShutdownLatch,
}

impl CallbackDispatcher {
    pub fn new(
        handler: Arc<dyn TransitionHandler>,
        events: mpsc::Receiver<MembershipTransition>,
        shutdown: ShutdownLatch,
    ) -> Self {
        Self {
            handler,
            events,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        debug!("Callback dispatcher started");

        loop {
            let transition = tokio::select! {
                biased;
                _ = self.shutdown.wait() => break,
                transition = self.events.recv() => match transition {
                    Some(transition) => transition,
                    None => break,
                },
            };

            self.dispatch(transition).await;
        }

        self.events.close();
        let mut discarded = 0usize;
        while let Ok(transition) = self.events.try_recv() {
            debug!("Discarding undelivered transition {}", transition);
            discarded += 1;
        }
        debug!(
            "Callback dispatcher stopped, {} transitions discarded",
            discarded
        );
    }

    async fn dispatch(&self, transition: MembershipTransition) {
        debug!("Dispatching {}", transition);

        let handler = self.handler.clone();
        let delivery = async move {
            match transition.membership {
                Membership::Leader => handler.on_leader(&transition).await,
                Membership::Follower => handler.on_follower(&transition).await,
            }
        };

        if AssertUnwindSafe(delivery).catch_unwind().await.is_err() {
            error!("Transition handler panicked on {}", transition);
        }
    }
}
