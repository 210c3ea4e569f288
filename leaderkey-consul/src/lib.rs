//! # LeaderKey Consul
//!
//! A [`Coordinator`](leaderkey_core::Coordinator) built on Consul sessions
//! and the KV lock protocol (`?acquire=` / `?release=` with the lock flags
//! value), compatible with other Consul API lock holders on the same key.
//!
//! ```rust,no_run
//! use leaderkey_consul::{ConsulConfig, ConsulCoordinator};
//!
//! let config = ConsulConfig::from_env().with_datacenter("dc1");
//! let coordinator = ConsulCoordinator::new(config).unwrap();
//! # let _ = coordinator;
//! ```

pub mod client;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod transport;

pub use client::{ConsulClient, KvPair, SessionCreateRequest};
pub use config::*;
pub use coordinator::{ConsulCoordinator, LOCK_FLAG_VALUE};
pub use error::*;
pub use transport::{
    dump_request, dump_response, tracing_sink, DebugSink, DebugTransport, HttpRequest,
    HttpResponse, HttpTransport, ReqwestTransport,
};
