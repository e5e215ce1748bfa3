//! Collaborator interfaces.
//!
//! The pool consumes a configuration store and produces messages and
//! statistics through these narrow traits; the HTTP control surface,
//! persistence and storage layers live behind them, outside this
//! crate.

use crate::config::AccountConfig;
use crate::error::Result;
use crate::stats::CountersSnapshot;

/// Read-only account/channel configuration source. Reload re-invokes
/// these.
pub trait ConfigStore: Send + Sync {
    fn load_accounts(&self) -> Result<Vec<AccountConfig>>;
    fn load_channels_for(&self, account_id: u64) -> Result<Vec<String>>;
    fn load_account(&self, account_id: u64) -> Result<AccountConfig>;
}

/// Downstream consumer of received chat lines. One call per line,
/// fire-and-forget; implementations must not block the caller (they
/// run on a multiplexer task).
pub trait MessageSink: Send + Sync {
    fn on_message(
        &self,
        account_id: u64,
        channel: &str,
        sender: &str,
        text: &str,
        timestamp_ms: i64,
    );
}

/// Periodic statistics consumer.
pub trait StatsSink: Send + Sync {
    fn on_session_stats(&self, account_id: u64, session: usize, counters: &CountersSnapshot);
    fn on_channel_assignment_snapshot(
        &self,
        account_id: u64,
        assignments: &[(String, Option<usize>)],
    );
}

/// Stats sink that only emits tracing events. Useful as a default.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogStatsSink;

impl StatsSink for LogStatsSink {
    fn on_session_stats(&self, account_id: u64, session: usize, counters: &CountersSnapshot) {
        tracing::debug!(
            account = account_id,
            session,
            lines_in = counters.lines_in,
            lines_out = counters.lines_out,
            connects_ok = counters.connects_ok,
            connects_failed = counters.connects_failed,
            rtt_ms = counters.last_rtt_ms,
            "session stats"
        );
    }

    fn on_channel_assignment_snapshot(
        &self,
        account_id: u64,
        assignments: &[(String, Option<usize>)],
    ) {
        let unassigned = assignments.iter().filter(|(_, s)| s.is_none()).count();
        tracing::debug!(
            account = account_id,
            channels = assignments.len(),
            unassigned,
            "channel assignments"
        );
    }
}
