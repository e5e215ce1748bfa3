//! Per-session counters.
//!
//! Counters are bumped on the multiplexer task and drained from
//! whatever thread asks for a snapshot, so every field is an atomic
//! and a snapshot swaps each one with zero — no locked
//! read-modify-write, no torn reads.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Lock-free counter group owned by one session.
#[derive(Debug, Default)]
pub struct SessionCounters {
    pub connect_attempts: AtomicU64,
    pub connects_ok: AtomicU64,
    pub connects_failed: AtomicU64,
    pub logins: AtomicU64,
    pub lines_in: AtomicU64,
    pub lines_out: AtomicU64,
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
    pub commands_out: AtomicU64,
    /// Last measured ping round-trip, milliseconds. Not drained by
    /// snapshots; it is a gauge, not a counter.
    pub last_rtt_ms: AtomicU64,
}

/// One drained snapshot of a session's counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CountersSnapshot {
    pub connect_attempts: u64,
    pub connects_ok: u64,
    pub connects_failed: u64,
    pub logins: u64,
    pub lines_in: u64,
    pub lines_out: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub commands_out: u64,
    pub last_rtt_ms: u64,
}

impl SessionCounters {
    /// Drain every counter (swap with zero) into a snapshot.
    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            connect_attempts: self.connect_attempts.swap(0, Ordering::Relaxed),
            connects_ok: self.connects_ok.swap(0, Ordering::Relaxed),
            connects_failed: self.connects_failed.swap(0, Ordering::Relaxed),
            logins: self.logins.swap(0, Ordering::Relaxed),
            lines_in: self.lines_in.swap(0, Ordering::Relaxed),
            lines_out: self.lines_out.swap(0, Ordering::Relaxed),
            bytes_in: self.bytes_in.swap(0, Ordering::Relaxed),
            bytes_out: self.bytes_out.swap(0, Ordering::Relaxed),
            commands_out: self.commands_out.swap(0, Ordering::Relaxed),
            last_rtt_ms: self.last_rtt_ms.load(Ordering::Relaxed),
        }
    }

    #[inline]
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}
