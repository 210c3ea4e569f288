//! Test support for LeaderKey members: a coordinator driven by a script of
//! outcomes and a handler that records what it is told.

pub mod recording;
pub mod scripted;

pub use recording::{assert_alternating, RecordingHandler};
pub use scripted::{Outcome, ScriptedCoordinator};

use leaderkey_election::{LeaderKeyResult, Member, TransitionHandler};
use std::sync::Arc;

/// Installs a test subscriber honoring `RUST_LOG`, once per process.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Member on `svc/leader` backed by `coordinator`.
pub fn scripted_member(
    coordinator: Arc<ScriptedCoordinator>,
    handler: Arc<dyn TransitionHandler>,
) -> LeaderKeyResult<Member> {
    Member::builder("svc/leader")
        .coordinator(coordinator)
        .handler(handler)
        .build()
}
