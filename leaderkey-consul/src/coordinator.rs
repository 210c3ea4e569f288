//! Consul sessions and KV locks behind the [`Coordinator`] trait.
//!
//! Each created session gets a background task renewing it every half TTL.
//! Each acquired lock gets a monitor task that blocks on the key and fires
//! the [`LockLostNotifier`] once the key no longer belongs to the session.

use crate::client::{ConsulClient, SessionCreateRequest};
use crate::transport::HttpTransport;
use crate::{ConsulConfig, ConsulError, ConsulResult};
use async_trait::async_trait;
use dashmap::DashMap;
use leaderkey_core::{
    Coordinator, CoordinatorError, CoordinatorResult, HeldLock, LockLostNotifier, LockRequest,
    LossReason, SessionId, SessionRequest,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Flags value marking a KV entry as a lock.
pub const LOCK_FLAG_VALUE: u64 = 0x2ddccbc058a50c18;

pub const MIN_SESSION_TTL: Duration = Duration::from_secs(10);
pub const MAX_SESSION_TTL: Duration = Duration::from_secs(86400);
pub const MAX_LOCK_DELAY: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
struct SessionEntry {
    /// Cancelled when the session is destroyed or the coordinator dropped
    closed: CancellationToken,
    invalidated: Arc<AtomicBool>,
}

impl SessionEntry {
    fn new() -> Self {
        Self {
            closed: CancellationToken::new(),
            invalidated: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// [`Coordinator`] backed by a Consul agent
#[derive(Debug)]
pub struct ConsulCoordinator {
    client: Arc<ConsulClient>,
    sessions: Arc<DashMap<SessionId, SessionEntry>>,
}

impl ConsulCoordinator {
    pub fn new(config: ConsulConfig) -> ConsulResult<Self> {
        Ok(Self::with_client(ConsulClient::new(config)?))
    }

    /// Coordinator configured from `CONSUL_HTTP_*` environment variables.
    pub fn from_env() -> ConsulResult<Self> {
        Self::new(ConsulConfig::from_env())
    }

    pub fn with_transport(
        config: ConsulConfig,
        transport: Arc<dyn HttpTransport>,
    ) -> ConsulResult<Self> {
        Ok(Self::with_client(ConsulClient::with_transport(
            config, transport,
        )?))
    }

    pub fn with_client(client: ConsulClient) -> Self {
        Self {
            client: Arc::new(client),
            sessions: Arc::new(DashMap::new()),
        }
    }

    pub fn client(&self) -> &ConsulClient {
        &self.client
    }

    /// Number of sessions this coordinator is keeping alive.
    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    fn entry(&self, session: &SessionId) -> SessionEntry {
        self.sessions
            .get(session)
            .map(|entry| entry.value().clone())
            .unwrap_or_else(SessionEntry::new)
    }

    fn start_monitor(&self, request: &LockRequest, entry: SessionEntry, index: u64) -> HeldLock {
        let (held, notifier) = HeldLock::new(request.key.clone(), request.session.clone());

        let monitor = LockMonitor {
            client: self.client.clone(),
            key: request.key.clone(),
            session: request.session.clone(),
            wait: request.wait_time,
            entry,
        };
        tokio::spawn(monitor.run(notifier, index));

        held
    }
}

impl Drop for ConsulCoordinator {
    fn drop(&mut self) {
        for entry in self.sessions.iter() {
            entry.closed.cancel();
        }
    }
}

fn check_session_limits(request: &SessionRequest) -> CoordinatorResult<()> {
    if request.ttl < MIN_SESSION_TTL || request.ttl > MAX_SESSION_TTL {
        return Err(CoordinatorError::invalid_request(format!(
            "session TTL {:?} outside {:?}..={:?}",
            request.ttl, MIN_SESSION_TTL, MAX_SESSION_TTL
        )));
    }
    if request.lock_delay > MAX_LOCK_DELAY {
        return Err(CoordinatorError::invalid_request(format!(
            "lock delay {:?} exceeds {:?}",
            request.lock_delay, MAX_LOCK_DELAY
        )));
    }
    Ok(())
}

#[async_trait]
impl Coordinator for ConsulCoordinator {
    fn validate_session(&self, request: &SessionRequest) -> CoordinatorResult<()> {
        check_session_limits(request)
    }

    async fn create_session(&self, request: &SessionRequest) -> CoordinatorResult<SessionId> {
        check_session_limits(request)?;

        let body = SessionCreateRequest::from(request);
        let session = SessionId::new(self.client.create_session(&body).await?);

        let entry = SessionEntry::new();
        tokio::spawn(renew_session(
            self.client.clone(),
            session.clone(),
            request.ttl,
            entry.clone(),
        ));
        self.sessions.insert(session.clone(), entry);

        info!("Created session {} ({})", session, request.name);
        Ok(session)
    }

    async fn acquire_lock(
        &self,
        request: &LockRequest,
        cancel: &CancellationToken,
    ) -> CoordinatorResult<Option<HeldLock>> {
        let entry = self.entry(&request.session);
        let retry_time = self.client.config().lock_retry_time;
        let key = request.key.as_str();
        let session = request.session.as_str();
        let mut index = None;

        loop {
            if entry.invalidated.load(Ordering::Acquire) {
                return Err(CoordinatorError::session_invalidated(request.session.clone()));
            }

            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(None),
                read = self.client.get_key(key, index, request.wait_time) => read,
            };
            let (pair, last_index) = read?;
            let last_index = last_index.max(1);

            if let Some(pair) = &pair {
                if pair.flags != LOCK_FLAG_VALUE {
                    return Err(CoordinatorError::Conflict {
                        key: key.to_string(),
                        message: format!("unexpected flags {:#x}", pair.flags),
                    });
                }

                match pair.session.as_deref() {
                    Some(holder) if holder == session => {
                        debug!("Session {} already holds {}", session, key);
                        return Ok(Some(self.start_monitor(request, entry, last_index)));
                    }
                    Some(holder) => {
                        debug!("Lock {} held by session {}, waiting", key, holder);
                        index = Some(last_index);
                        continue;
                    }
                    None => {}
                }
            }

            let acquired = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(None),
                acquired = self.client.acquire_key(key, session, LOCK_FLAG_VALUE, request.value.as_ref()) => acquired,
            };

            match acquired {
                Ok(true) => {
                    info!("Session {} acquired lock {}", session, key);
                    return Ok(Some(self.start_monitor(request, entry, last_index)));
                }
                Ok(false) => {
                    // Lost a race or still inside the lock delay.
                    debug!("Acquire of {} refused, retrying in {:?}", key, retry_time);
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Ok(None),
                        _ = tokio::time::sleep(retry_time) => {}
                    }
                    index = None;
                }
                Err(err) if err.is_invalid_session() => {
                    entry.invalidated.store(true, Ordering::Release);
                    return Err(CoordinatorError::session_invalidated(request.session.clone()));
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn destroy_session(&self, session: &SessionId) -> CoordinatorResult<()> {
        if let Some((_, entry)) = self.sessions.remove(session) {
            entry.closed.cancel();
        }

        self.client.destroy_session(session.as_str()).await?;
        info!("Destroyed session {}", session);
        Ok(())
    }
}

/// Renews `session` every half TTL until it is closed or invalidated.
///
/// Failed renewals are retried every `monitor_retry_time`; once a full TTL
/// passes without a successful renewal the session is considered gone.
async fn renew_session(
    client: Arc<ConsulClient>,
    session: SessionId,
    ttl: Duration,
    entry: SessionEntry,
) {
    let interval = ttl / 2;
    let retry_time = client.config().monitor_retry_time;
    let mut last_renewed = Instant::now();
    let mut delay = interval;

    loop {
        let renewed = tokio::select! {
            biased;
            _ = entry.closed.cancelled() => return,
            renewed = async {
                tokio::time::sleep(delay).await;
                client.renew_session(session.as_str()).await
            } => renewed,
        };

        match renewed {
            Ok(true) => {
                last_renewed = Instant::now();
                delay = interval;
            }
            Ok(false) => {
                warn!("Session {} no longer exists", session);
                entry.invalidated.store(true, Ordering::Release);
                return;
            }
            Err(err) => {
                if last_renewed.elapsed() >= ttl {
                    warn!("Session {} expired, renewal failing: {}", session, err);
                    entry.invalidated.store(true, Ordering::Release);
                    return;
                }
                debug!("Failed to renew session {}: {}", session, err);
                delay = retry_time;
            }
        }
    }
}

struct LockMonitor {
    client: Arc<ConsulClient>,
    key: String,
    session: SessionId,
    wait: Duration,
    entry: SessionEntry,
}

enum MonitorExit {
    Lost(LossReason),
    Released,
    SessionClosed,
}

impl LockMonitor {
    async fn run(self, mut notifier: LockLostNotifier, index: u64) {
        match self.watch(&notifier, index).await {
            MonitorExit::Lost(reason) => {
                warn!("Lock {} lost: {}", self.key, reason);
                notifier.notify(reason);

                if reason == LossReason::MonitorFailed {
                    // The key may still carry our session.
                    tokio::select! {
                        _ = notifier.released() => self.release().await,
                        _ = self.entry.closed.cancelled() => {}
                    }
                }
            }
            MonitorExit::Released => self.release().await,
            MonitorExit::SessionClosed => {}
        }
    }

    async fn watch(&self, notifier: &LockLostNotifier, mut index: u64) -> MonitorExit {
        let config = self.client.config();
        let mut failures = 0u32;

        loop {
            let read = tokio::select! {
                biased;
                _ = notifier.released() => return MonitorExit::Released,
                _ = self.entry.closed.cancelled() => return MonitorExit::SessionClosed,
                read = self.client.get_key(&self.key, Some(index), self.wait) => read,
            };

            match read {
                Ok((pair, last_index)) => {
                    failures = 0;
                    index = last_index.max(1);

                    let holder = pair.as_ref().and_then(|pair| pair.session.as_deref());
                    if holder != Some(self.session.as_str()) {
                        let reason = if self.entry.invalidated.load(Ordering::Acquire) {
                            LossReason::SessionInvalidated
                        } else {
                            LossReason::LockReleased
                        };
                        return MonitorExit::Lost(reason);
                    }
                }
                Err(err) => {
                    failures += 1;
                    if failures > config.monitor_retries {
                        warn!("Giving up monitoring {}: {}", self.key, err);
                        return MonitorExit::Lost(LossReason::MonitorFailed);
                    }
                    debug!(
                        "Monitor read of {} failed ({}/{}): {}",
                        self.key, failures, config.monitor_retries, err
                    );

                    tokio::select! {
                        biased;
                        _ = notifier.released() => return MonitorExit::Released,
                        _ = self.entry.closed.cancelled() => return MonitorExit::SessionClosed,
                        _ = tokio::time::sleep(config.monitor_retry_time) => {}
                    }
                }
            }
        }
    }

    async fn release(&self) {
        let released: Result<bool, ConsulError> = self
            .client
            .release_key(&self.key, self.session.as_str(), LOCK_FLAG_VALUE)
            .await;

        match released {
            Ok(true) => debug!("Released lock {}", self.key),
            Ok(false) => debug!("Lock {} was not held on release", self.key),
            Err(err) => debug!("Failed to release lock {}: {}", self.key, err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use leaderkey_core::{HealthChecks, SessionBehavior};

    fn session_request(ttl: Duration, lock_delay: Duration) -> SessionRequest {
        SessionRequest {
            name: "test".to_string(),
            ttl,
            behavior: SessionBehavior::Release,
            lock_delay,
            checks: HealthChecks::default(),
        }
    }

    #[test]
    fn test_session_bounds() {
        assert!(check_session_limits(&session_request(Duration::from_secs(15), Duration::from_secs(15))).is_ok());
        assert!(check_session_limits(&session_request(Duration::from_secs(10), Duration::ZERO)).is_ok());

        let error = check_session_limits(&session_request(Duration::from_secs(5), Duration::ZERO)).unwrap_err();
        assert!(matches!(error, CoordinatorError::InvalidRequest { .. }));
        assert!(!error.is_retryable());

        assert!(check_session_limits(&session_request(Duration::from_secs(86401), Duration::ZERO)).is_err());
        assert!(check_session_limits(&session_request(Duration::from_secs(15), Duration::from_secs(61))).is_err());
    }

    #[test]
    fn test_coordinator_exposes_session_bounds() {
        let coordinator = ConsulCoordinator::new(ConsulConfig::default()).unwrap();

        assert!(coordinator
            .validate_session(&session_request(Duration::from_secs(15), Duration::from_secs(1)))
            .is_ok());
        assert!(matches!(
            coordinator.validate_session(&session_request(Duration::from_secs(15), Duration::from_secs(120))),
            Err(CoordinatorError::InvalidRequest { .. })
        ));
    }

    #[test]
    fn test_lock_flag_value() {
        assert_eq!(LOCK_FLAG_VALUE, 3304740253564472344);
    }
}
