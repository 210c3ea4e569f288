use async_trait::async_trait;
use leaderkey_core::{Membership, MembershipTransition};
use leaderkey_election::TransitionHandler;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::sync::watch;

/// Handler recording every transition it receives.
#[derive(Debug)]
pub struct RecordingHandler {
    events: Mutex<Vec<MembershipTransition>>,
    count: watch::Sender<usize>,
    started: watch::Sender<usize>,
    delay: Option<Duration>,
}

impl Default for RecordingHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingHandler {
    pub fn new() -> Self {
        let (count, _) = watch::channel(0);
        let (started, _) = watch::channel(0);
        Self {
            events: Mutex::new(Vec::new()),
            count,
            started,
            delay: None,
        }
    }

    /// Sleeps `delay` inside every callback before recording.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn events(&self) -> Vec<MembershipTransition> {
        self.events.lock().clone()
    }

    pub fn memberships(&self) -> Vec<Membership> {
        self.events
            .lock()
            .iter()
            .map(|event| event.membership)
            .collect()
    }

    /// Callbacks entered so far, finished or not.
    pub fn started(&self) -> usize {
        *self.started.borrow()
    }

    /// Waits until `count` transitions were recorded.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let mut rx = self.count.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|recorded| *recorded >= count))
            .await
            .map(|seen| seen.is_ok())
            .unwrap_or(false)
    }

    /// Waits until `count` callbacks were entered.
    pub async fn wait_for_started(&self, count: usize, timeout: Duration) -> bool {
        let mut rx = self.started.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|started| *started >= count))
            .await
            .map(|seen| seen.is_ok())
            .unwrap_or(false)
    }

    async fn record(&self, transition: &MembershipTransition) {
        self.started.send_modify(|started| *started += 1);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let recorded = {
            let mut events = self.events.lock();
            events.push(*transition);
            events.len()
        };
        self.count.send_replace(recorded);
    }
}

#[async_trait]
impl TransitionHandler for RecordingHandler {
    async fn on_leader(&self, transition: &MembershipTransition) {
        self.record(transition).await
    }

    async fn on_follower(&self, transition: &MembershipTransition) {
        self.record(transition).await
    }
}

/// Checks that `events` alternate Leader, Follower, Leader, ... with
/// consecutive tenures starting at 1.
pub fn assert_alternating(events: &[MembershipTransition]) {
    for (i, event) in events.iter().enumerate() {
        let expected = if i % 2 == 0 {
            MembershipTransition::leader(i as u64 / 2 + 1)
        } else {
            MembershipTransition::follower(i as u64 / 2 + 1)
        };
        assert_eq!(*event, expected, "event {} out of order in {:?}", i, events);
    }
}
