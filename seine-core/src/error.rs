//! Error taxonomy for the connection pool.
//!
//! Session-internal faults never cross the multiplexer boundary as
//! errors — they become disconnect callbacks. What's left here is what
//! command callers and startup can actually see.

/// Errors returned to command callers and at account startup.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Connect or handshake failure. Retried with backoff, never fatal.
    #[error("transport: {0}")]
    Transport(String),

    /// Join requested beyond the account's channel capacity.
    #[error("channel capacity reached (limit {limit})")]
    Capacity { limit: usize },

    /// Channel is not in the registry.
    #[error("unknown channel: {0}")]
    ChannelNotFound(String),

    /// No account with this id in the pool.
    #[error("unknown account: {0}")]
    AccountNotFound(u64),

    /// An account with this id is already running.
    #[error("account already exists: {0}")]
    AccountExists(u64),

    /// Malformed account or channel data from the store.
    #[error("config: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
