//! Account and pool configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Per-category send rate limits, in actions per second.
///
/// A limit of 0 means unlimited. Over-limit sends are declined (the
/// send returns false), never queued.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimits {
    /// Channel commands (JOIN/PART/PRIVMSG to channels, raw lines).
    #[serde(default)]
    pub commands_per_sec: u32,
    /// Whispers (PRIVMSG to a nick).
    #[serde(default)]
    pub whispers_per_sec: u32,
    /// Login attempts.
    #[serde(default)]
    pub auths_per_sec: u32,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            commands_per_sec: 20,
            whispers_per_sec: 3,
            auths_per_sec: 2,
        }
    }
}

/// Immutable per-load configuration of one account.
///
/// Replaced wholesale on reload; never mutated in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    /// Numeric account id, unique within the pool.
    pub id: u64,
    /// Nickname.
    pub nick: String,
    /// Login user (ident).
    pub user: String,
    /// Credential token, sent as PASS.
    pub token: String,
    /// Maximum number of channels this account may be joined to.
    #[serde(default = "default_channel_limit")]
    pub channel_limit: usize,
    /// Desired number of physical connections.
    #[serde(default = "default_session_count")]
    pub session_count: usize,
    /// Per-category send rate limits.
    #[serde(default)]
    pub rate: RateLimits,
}

fn default_channel_limit() -> usize {
    50
}

fn default_session_count() -> usize {
    1
}

impl AccountConfig {
    /// Validate data coming out of the store. A bad account fails to
    /// start; other accounts are unaffected.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.nick.is_empty() {
            return Err(crate::error::Error::Config(format!(
                "account {}: empty nick",
                self.id
            )));
        }
        if self.channel_limit == 0 {
            return Err(crate::error::Error::Config(format!(
                "account {}: channel_limit must be > 0",
                self.id
            )));
        }
        Ok(())
    }

    /// Effective session count; at least one.
    pub fn sessions(&self) -> usize {
        self.session_count.max(1)
    }
}

/// Runtime policy knobs shared by every account in the pool.
///
/// Defaults are the reference policy. All timers are cancellable and
/// scoped to a session's lifetime.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Chat server address (host:port).
    pub server_addr: String,
    /// Number of multiplexer tasks, fixed at startup.
    pub multiplexer_count: usize,
    /// Upper bound on one readiness wait.
    pub poll_interval: Duration,
    /// Sleep when a multiplexer has no open sockets to poll.
    pub idle_sleep: Duration,
    /// A session that hasn't logged in this long after connect is
    /// forced down.
    pub login_timeout: Duration,
    /// Keepalive ping period (per logged-in session).
    pub ping_interval: Duration,
    /// Ping with no pong for this long forces a disconnect.
    pub pong_timeout: Duration,
    /// Reconnect attempt counter wraps to zero when it reaches this.
    pub connect_attempt_limit: u32,
    /// Period of the per-account stats report.
    pub stats_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            server_addr: "127.0.0.1:6667".to_string(),
            multiplexer_count: 2,
            poll_interval: Duration::from_millis(100),
            idle_sleep: Duration::from_millis(250),
            login_timeout: Duration::from_millis(3000),
            ping_interval: Duration::from_millis(2000),
            pong_timeout: Duration::from_millis(10500),
            connect_attempt_limit: 10,
            stats_interval: Duration::from_secs(10),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_config_deserializes_with_defaults() {
        let cfg: AccountConfig = serde_json::from_str(
            r#"{"id": 7, "nick": "scout", "user": "scout", "token": "oauth:abc"}"#,
        )
        .unwrap();
        assert_eq!(cfg.id, 7);
        assert_eq!(cfg.channel_limit, 50);
        assert_eq!(cfg.session_count, 1);
        assert_eq!(cfg.rate.commands_per_sec, 20);
    }

    #[test]
    fn zero_session_count_still_gets_one_session() {
        let cfg: AccountConfig = serde_json::from_str(
            r#"{"id": 1, "nick": "n", "user": "u", "token": "t", "session_count": 0}"#,
        )
        .unwrap();
        assert_eq!(cfg.sessions(), 1);
    }

    #[test]
    fn validate_rejects_empty_nick() {
        let cfg: AccountConfig =
            serde_json::from_str(r#"{"id": 1, "nick": "", "user": "u", "token": "t"}"#).unwrap();
        assert!(cfg.validate().is_err());
    }
}
