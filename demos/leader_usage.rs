//! Leader election against a local Consul agent.
//!
//! Start a few copies against the same key and stop the leader with Ctrl-C
//! to watch leadership move:
//!
//! ```text
//! CONSUL_HTTP_ADDR=127.0.0.1:8500 RUST_LOG=info cargo run --bin leader_usage
//! ```
//!
//! `LEADERKEY_KEY` overrides the lock key and `LEADERKEY_HTTP_DEBUG=1`
//! dumps every Consul request and response at debug level.

use async_trait::async_trait;
use leaderkey_consul::{tracing_sink, ConsulConfig, ConsulCoordinator, DebugTransport};
use leaderkey_core::MembershipTransition;
use leaderkey_election::{Member, TransitionHandler};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_KEY: &str = "service/leaderkey-demo/leader";

struct LoggingHandler {
    node: String,
}

#[async_trait]
impl TransitionHandler for LoggingHandler {
    async fn on_leader(&self, transition: &MembershipTransition) {
        info!("{} is now the leader ({})", self.node, transition);
    }

    async fn on_follower(&self, transition: &MembershipTransition) {
        warn!("{} stepped down ({})", self.node, transition);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let key = std::env::var("LEADERKEY_KEY").unwrap_or_else(|_| DEFAULT_KEY.to_string());
    let node = format!("node-{}", std::process::id());
    let config = ConsulConfig::from_env();
    info!("Joining election for {} via {} as {}", key, config.address, node);

    let coordinator = if std::env::var("LEADERKEY_HTTP_DEBUG").is_ok() {
        let transport = DebugTransport::new(Some(tracing_sink()), None);
        ConsulCoordinator::with_transport(config, Arc::new(transport))?
    } else {
        ConsulCoordinator::new(config)?
    };

    let member = Arc::new(
        Member::builder(key)
            .coordinator(Arc::new(coordinator))
            .with_session_ttl(Duration::from_secs(10))
            .with_lock_delay(Duration::from_secs(1))
            .handler(Arc::new(LoggingHandler { node: node.clone() }))
            .build()?,
    );

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupted, leaving the election");
                cancel.cancel();
            }
        });
    }

    {
        let mut membership = member.subscribe();
        let node = node.clone();
        tokio::spawn(async move {
            while membership.changed().await.is_ok() {
                let current = *membership.borrow_and_update();
                info!("{} membership: {}", node, current);
            }
        });
    }

    member.run(cancel).await?;
    info!("{} left the election", node);
    Ok(())
}
