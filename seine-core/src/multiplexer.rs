//! Readiness multiplexing: few tasks pumping many sessions.
//!
//! Each [`Multiplexer`] owns a dynamic set of sessions and one loop:
//! snapshot the set when it changed, wait (bounded) for any connected
//! session's socket to become readable, pump the ready ones. Protocol
//! callbacks run inline on this task. A misbehaving session never
//! stops the loop from servicing the others.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::select_all;
use parking_lot::Mutex;
use tokio::io::Interest;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::config::PoolConfig;
use crate::session::Session;

/// One polling loop over a batch of sessions.
pub struct Multiplexer {
    id: usize,
    sessions: Mutex<Vec<Arc<Session>>>,
    /// Set on add/remove; tells the loop to re-snapshot.
    dirty: AtomicBool,
}

impl Multiplexer {
    fn new(id: usize) -> Self {
        Self {
            id,
            sessions: Mutex::new(Vec::new()),
            dirty: AtomicBool::new(false),
        }
    }

    pub fn add_session(&self, session: Arc<Session>) {
        self.sessions.lock().push(session);
        self.dirty.store(true, Ordering::Release);
    }

    /// Remove by identity. Cheap no-op when the session isn't here.
    pub fn remove_session(&self, session: &Arc<Session>) {
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|s| !Arc::ptr_eq(s, session));
        if sessions.len() != before {
            self.dirty.store(true, Ordering::Release);
        }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// The polling loop. Runs until `cancel` fires.
    pub async fn run(self: Arc<Self>, config: PoolConfig, cancel: CancellationToken) {
        tracing::debug!(multiplexer = self.id, "loop started");
        let mut snapshot: Vec<Arc<Session>> = Vec::new();

        loop {
            if cancel.is_cancelled() {
                break;
            }
            if self.dirty.swap(false, Ordering::AcqRel) {
                snapshot = self.sessions.lock().clone();
            }

            // Sessions with no open socket are skipped without error.
            let open: Vec<(Arc<Session>, Arc<TcpStream>)> = snapshot
                .iter()
                .filter_map(|s| s.socket().map(|sock| (s.clone(), sock)))
                .collect();

            if open.is_empty() {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(config.idle_sleep) => {}
                }
                continue;
            }

            let readiness = open
                .iter()
                .map(|(_, sock)| Box::pin(sock.ready(Interest::READABLE)))
                .collect::<Vec<_>>();

            tokio::select! {
                _ = cancel.cancelled() => break,
                outcome = tokio::time::timeout(config.poll_interval, select_all(readiness)) => {
                    let Ok((result, idx, _rest)) = outcome else {
                        // Poll interval elapsed; re-snapshot and go again.
                        continue;
                    };
                    if let Err(e) = result {
                        // Logged and carried on; the session's own
                        // read path will surface a real failure.
                        tracing::warn!(
                            multiplexer = self.id,
                            session = open[idx].0.index(),
                            error = %e,
                            "readiness query failed"
                        );
                    }
                    // One wakeup services the whole batch: pump never
                    // blocks, so a session without buffered input
                    // returns immediately.
                    for (session, _) in &open {
                        session.pump();
                    }
                }
            }
        }
        tracing::debug!(multiplexer = self.id, "loop stopped");
    }
}

/// Fixed set of multiplexers created at startup.
///
/// New sessions are assigned round robin; removal is broadcast to all
/// members so nobody needs to remember which one owns a session.
pub struct MultiplexerPool {
    multiplexers: Vec<Arc<Multiplexer>>,
    next: AtomicUsize,
    cancel: CancellationToken,
}

impl MultiplexerPool {
    /// Build the pool and spawn one task per multiplexer.
    pub fn start(config: &PoolConfig, cancel: CancellationToken) -> Arc<Self> {
        let count = config.multiplexer_count.max(1);
        let multiplexers: Vec<Arc<Multiplexer>> =
            (0..count).map(|id| Arc::new(Multiplexer::new(id))).collect();

        for mux in &multiplexers {
            tokio::spawn(mux.clone().run(config.clone(), cancel.clone()));
        }
        tracing::info!(count, "multiplexer pool started");

        Arc::new(Self {
            multiplexers,
            next: AtomicUsize::new(0),
            cancel,
        })
    }

    pub fn add_session(&self, session: Arc<Session>) {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.multiplexers.len();
        self.multiplexers[idx].add_session(session);
    }

    pub fn remove_session(&self, session: &Arc<Session>) {
        for mux in &self.multiplexers {
            mux.remove_session(session);
        }
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}
