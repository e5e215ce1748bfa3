//! seine-core: a multi-account IRC connection pool.
//!
//! Maintains many simultaneously logged-in connections ("sessions",
//! one or more per account), keeps each account joined to a changing
//! set of channels, and forwards received chat lines to a downstream
//! sink. Survives disconnects with saw-tooth backoff, detects dead
//! links via ping/pong keepalive, and rebalances channel membership
//! across a session pool as sessions come and go.
//!
//! Structure:
//! - [`session`] — one physical connection and its protocol state
//!   machine
//! - [`multiplexer`] — few tasks polling readiness for many sessions
//! - [`registry`] — per-account channel → session attachment map
//! - [`account`] — the per-account orchestrator (reconnect, login
//!   timeout, keepalive, join/leave dispatch, rebalancing)
//! - [`pool`] — the facade the outer controller talks to
//! - [`hooks`] — collaborator traits (config store, message sink,
//!   stats sink)

pub mod account;
pub mod config;
pub mod error;
pub mod hooks;
pub mod irc;
pub mod multiplexer;
pub mod pool;
pub mod registry;
pub mod session;
pub mod stats;

pub use account::AccountClient;
pub use config::{AccountConfig, PoolConfig, RateLimits};
pub use error::{Error, Result};
pub use hooks::{ConfigStore, LogStatsSink, MessageSink, StatsSink};
pub use pool::Pool;
pub use registry::ChannelRegistry;
pub use session::{Session, SessionListener, SessionStatus};
pub use stats::CountersSnapshot;
