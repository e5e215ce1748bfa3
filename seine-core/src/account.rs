//! Per-account orchestrator.
//!
//! An [`AccountClient`] owns the account's sessions, its channel
//! registry and every timer attached to them: reconnect backoff,
//! login timeout, keepalive. It is the only component the outer
//! controller talks to for this account.
//!
//! Session callbacks arrive inline on multiplexer tasks; everything
//! they touch is behind a lock or an atomic, and lock scopes never
//! span a network call. Timers are tokio tasks guarded by the owning
//! session's cancellation token, so tearing a session down (reload,
//! removal) cancels them before the session is dropped.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::{AccountConfig, PoolConfig};
use crate::error::{Error, Result};
use crate::hooks::{ConfigStore, MessageSink};
use crate::irc;
use crate::multiplexer::MultiplexerPool;
use crate::registry::ChannelRegistry;
use crate::session::{Session, SessionListener};
use crate::stats::CountersSnapshot;

/// Orchestrator for one account's sessions and channel state.
pub struct AccountClient {
    inner: Arc<AccountInner>,
}

struct AccountInner {
    policy: PoolConfig,
    config: Mutex<AccountConfig>,
    sessions: Mutex<Vec<Arc<Session>>>,
    registry: ChannelRegistry,
    /// Round-robin cursor over the session list.
    cursor: Mutex<usize>,
    mux: Arc<MultiplexerPool>,
    store: Arc<dyn ConfigStore>,
    message_sink: Arc<dyn MessageSink>,
    /// Account lifetime token, child of the pool's.
    cancel: CancellationToken,
    self_weak: Weak<AccountInner>,
}

impl AccountClient {
    /// Create the client, load its channel list from the store and
    /// start `max(1, session_count)` sessions connecting.
    pub fn start(
        config: AccountConfig,
        policy: PoolConfig,
        mux: Arc<MultiplexerPool>,
        store: Arc<dyn ConfigStore>,
        message_sink: Arc<dyn MessageSink>,
        parent_cancel: &CancellationToken,
    ) -> Result<Self> {
        config.validate()?;
        let channels = store.load_channels_for(config.id)?;
        let id = config.id;

        let inner = Arc::new_cyclic(|weak| AccountInner {
            policy,
            config: Mutex::new(config),
            sessions: Mutex::new(Vec::new()),
            registry: ChannelRegistry::new(),
            cursor: Mutex::new(0),
            mux,
            store,
            message_sink,
            cancel: parent_cancel.child_token(),
            self_weak: weak.clone(),
        });

        inner.registry.load(channels);
        tracing::info!(
            account = id,
            channels = inner.registry.len(),
            "account starting"
        );
        inner.spawn_sessions();
        Ok(Self { inner })
    }

    pub fn id(&self) -> u64 {
        self.inner.config.lock().id
    }

    /// Register a channel and join it on the next connected session.
    /// No-op when already registered; rejected synchronously when the
    /// account is at capacity.
    pub fn join_channel(&self, name: &str) -> Result<()> {
        self.inner.join_channel(name)
    }

    /// Best-effort leave: the registry entry is removed whether or not
    /// the PART transmit succeeds.
    pub fn leave_channel(&self, name: &str) -> Result<()> {
        self.inner.leave_channel(name)
    }

    pub fn has_channel(&self, name: &str) -> bool {
        self.inner.registry.contains(name)
    }

    /// Send a chat line, preferring the session attached to the
    /// channel and falling back to round robin.
    pub fn send_message(&self, channel: &str, text: &str) -> Result<()> {
        self.inner.send_message(channel, text)
    }

    /// PRIVMSG straight to a nick, on any connected session.
    pub fn send_whisper(&self, nick: &str, text: &str) -> Result<()> {
        self.inner.send_whisper(nick, text)
    }

    pub fn send_raw(&self, line: &str) -> Result<()> {
        self.inner.send_raw(line)
    }

    /// Drain every session's counters.
    pub fn snapshot_stats(&self) -> Vec<(usize, CountersSnapshot)> {
        self.inner
            .sessions
            .lock()
            .iter()
            .map(|s| (s.index(), s.counters.snapshot()))
            .collect()
    }

    pub fn snapshot_channels(&self) -> Vec<String> {
        self.inner.registry.names()
    }

    pub fn assignment_snapshot(&self) -> Vec<(String, Option<usize>)> {
        self.inner.registry.assignment_snapshot()
    }

    pub fn logged_in_sessions(&self) -> usize {
        self.inner
            .sessions
            .lock()
            .iter()
            .filter(|s| s.logged_in())
            .count()
    }

    /// Replace the configuration wholesale: tear every session down,
    /// reload the channel list from the store and start over with the
    /// new session count.
    pub fn reload(&self, new_config: AccountConfig) -> Result<()> {
        new_config.validate()?;
        let id = new_config.id;
        tracing::info!(account = id, "reloading account");

        self.inner.teardown_sessions();
        *self.inner.config.lock() = new_config;
        let channels = self.inner.store.load_channels_for(id)?;
        self.inner.registry.load(channels);
        self.inner.spawn_sessions();
        Ok(())
    }

    /// Tear everything down for good; the client must not be reused.
    pub fn shutdown(&self) {
        tracing::info!(account = self.id(), "account shutting down");
        self.inner.cancel.cancel();
        self.inner.teardown_sessions();
    }
}

impl AccountInner {
    /// Build the session set from the current config, register each
    /// with the multiplexer pool and kick off async connects.
    fn spawn_sessions(&self) {
        let config = self.config.lock().clone();
        let listener: Weak<dyn SessionListener> = self.self_weak.clone();

        let mut created = Vec::new();
        for index in 0..config.sessions() {
            let session = Arc::new(Session::new(
                index,
                &config,
                &self.policy.server_addr,
                listener.clone(),
                self.cancel.child_token(),
            ));
            self.mux.add_session(session.clone());
            created.push(session);
        }
        *self.sessions.lock() = created.clone();
        *self.cursor.lock() = 0;

        for session in created {
            self.spawn_connect(session, Duration::ZERO);
        }
    }

    /// Cancel timers, unregister and disconnect every session, and
    /// empty the list first so disconnect callbacks can't schedule a
    /// reconnect against a session being destroyed.
    fn teardown_sessions(&self) {
        let old: Vec<Arc<Session>> = std::mem::take(&mut *self.sessions.lock());
        for session in old {
            session.cancel.cancel();
            self.mux.remove_session(&session);
            session.send_quit();
            session.disconnect("teardown");
        }
    }

    /// One async connect attempt after `delay`; a failure goes back
    /// through the backoff schedule, success arms the login timeout.
    fn spawn_connect(&self, session: Arc<Session>, delay: Duration) {
        let Some(inner) = self.self_weak.upgrade() else {
            return;
        };
        let token = session.cancel.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            if token.is_cancelled() {
                return;
            }
            match session.connect().await {
                Ok(()) => inner.spawn_login_timeout(&session),
                Err(e) => {
                    tracing::warn!(
                        account = inner.config.lock().id,
                        session = session.index(),
                        error = %e,
                        "connect failed"
                    );
                    inner.schedule_reconnect(session);
                }
            }
        });
    }

    /// Saw-tooth backoff: the attempt counter resets to zero exactly
    /// when it reaches the limit, so the delay sequence
    /// 2, 4, …, 2·(L−1), 0 repeats instead of growing unbounded.
    fn schedule_reconnect(&self, session: Arc<Session>) {
        let limit = self.policy.connect_attempt_limit.max(1);
        let (attempt, delay) = next_backoff(&session.reconnect_attempts, limit);
        tracing::debug!(
            session = session.index(),
            attempt,
            delay_secs = delay.as_secs(),
            "reconnect scheduled"
        );
        self.spawn_connect(session, delay);
    }

    /// One-shot check: a session that connected but never reached
    /// LoggedIn within the login timeout is forced down, which routes
    /// it through the normal reconnect path.
    fn spawn_login_timeout(&self, session: &Arc<Session>) {
        let session = session.clone();
        let token = session.cancel.clone();
        let timeout = self.policy.login_timeout;
        let generation = session.generation();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(timeout) => {}
            }
            if session.generation() == generation && session.connected() && !session.logged_in() {
                tracing::warn!(session = session.index(), "login timeout");
                session.disconnect("login timeout");
            }
        });
    }

    /// Periodic keepalive for one logged-in connection generation.
    /// Checks the ping/pong gap before sending; a silent link is
    /// forced down instead of pinged again. Each tick also re-issues
    /// JOINs for attached channels the server has not confirmed —
    /// a JOIN declined earlier (rate gate, stalled link) is retried
    /// until it lands.
    fn spawn_keepalive(&self, session: Arc<Session>) {
        let token = session.cancel.clone();
        let interval = self.policy.ping_interval;
        let timeout_ms = self.policy.pong_timeout.as_millis() as i64;
        let generation = session.generation();
        let weak = self.self_weak.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
                if session.generation() != generation || !session.logged_in() {
                    return;
                }
                let ping = session.last_ping_ms();
                let pong = session.last_pong_ms();
                if ping > 0 && ping.saturating_sub(pong) > timeout_ms {
                    tracing::warn!(
                        session = session.index(),
                        gap_ms = ping.saturating_sub(pong),
                        "keepalive timeout"
                    );
                    session.disconnect("keepalive timeout");
                    return;
                }
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                for name in inner.registry.unjoined_for_session(session.index()) {
                    if !session.send_join(&name) {
                        // Rate gate still closed; next tick retries.
                        break;
                    }
                }
                session.send_ping();
            }
        });
    }

    fn session_by_index(&self, index: usize) -> Option<Arc<Session>> {
        self.sessions
            .lock()
            .iter()
            .find(|s| s.index() == index)
            .cloned()
    }

    /// Advance the cursor and return the first connected session
    /// within one full rotation, otherwise the last one visited —
    /// callers always get *a* session to fail on, never a hang.
    fn next_connected_session(&self) -> Option<Arc<Session>> {
        let sessions = self.sessions.lock();
        if sessions.is_empty() {
            return None;
        }
        let mut cursor = self.cursor.lock();
        let mut last = None;
        for _ in 0..sessions.len() {
            *cursor = (*cursor + 1) % sessions.len();
            let s = sessions[*cursor].clone();
            let connected = s.connected();
            last = Some(s);
            if connected {
                break;
            }
        }
        last
    }

    fn join_channel(&self, name: &str) -> Result<()> {
        let name = irc::normalize_channel(name);
        if self.registry.contains(&name) {
            return Ok(());
        }
        let limit = self.config.lock().channel_limit;
        if self.registry.len() >= limit {
            return Err(Error::Capacity { limit });
        }
        let session = self
            .next_connected_session()
            .ok_or_else(|| Error::Transport("account has no sessions".into()))?;
        if !session.send_join(&name) {
            return Err(Error::Transport(format!("JOIN {name} transmit failed")));
        }
        self.registry.add_channel(&name, Some(session.index()));
        Ok(())
    }

    fn leave_channel(&self, name: &str) -> Result<()> {
        let channel = self
            .registry
            .extract_channel(name)
            .ok_or_else(|| Error::ChannelNotFound(name.to_string()))?;
        if let Some(session) = channel.session.and_then(|i| self.session_by_index(i)) {
            // Best effort; the entry is already gone either way.
            session.send_part(&channel.name);
        }
        Ok(())
    }

    fn send_message(&self, channel: &str, text: &str) -> Result<()> {
        let session = self
            .registry
            .session_for(channel)
            .and_then(|i| self.session_by_index(i))
            .or_else(|| self.next_connected_session())
            .ok_or_else(|| Error::Transport("account has no sessions".into()))?;
        if session.send_privmsg(channel, text) {
            Ok(())
        } else {
            Err(Error::Transport(format!("PRIVMSG {channel} transmit failed")))
        }
    }

    fn send_whisper(&self, nick: &str, text: &str) -> Result<()> {
        let session = self
            .next_connected_session()
            .ok_or_else(|| Error::Transport("account has no sessions".into()))?;
        if session.send_whisper(nick, text) {
            Ok(())
        } else {
            Err(Error::Transport(format!("whisper to {nick} transmit failed")))
        }
    }

    fn send_raw(&self, line: &str) -> Result<()> {
        let session = self
            .next_connected_session()
            .ok_or_else(|| Error::Transport("account has no sessions".into()))?;
        if session.send_raw(line) {
            Ok(())
        } else {
            Err(Error::Transport("raw transmit failed".into()))
        }
    }
}

/// Advance the backoff counter one step and return the attempt number
/// with its delay. The counter resets to zero exactly when it reaches
/// `limit` (not when it exceeds it), so the delay sequence
/// 2, 4, …, 2·(limit−1), 0 saw-tooths instead of growing unbounded.
fn next_backoff(attempts: &std::sync::atomic::AtomicU32, limit: u32) -> (u32, Duration) {
    use std::sync::atomic::Ordering;

    let mut attempt = attempts.fetch_add(1, Ordering::AcqRel) + 1;
    if attempt >= limit {
        attempts.store(0, Ordering::Release);
        attempt = 0;
    }
    (attempt, Duration::from_secs(2 * u64::from(attempt)))
}

impl SessionListener for AccountInner {
    /// Runs on the multiplexer task that parsed the login numeric:
    /// claim this session's fair share of unattached channels and
    /// fire JOINs for them. Fast and non-blocking.
    fn on_logged_in(&self, index: usize) {
        let Some(session) = self.session_by_index(index) else {
            return;
        };
        let session_count = self.config.lock().sessions();
        let claimed = self.registry.attach_to_session(index, session_count);
        tracing::info!(
            account = self.config.lock().id,
            session = index,
            claimed = claimed.len(),
            "session logged in, claiming channels"
        );
        for name in &claimed {
            session.send_join(name);
        }
        self.spawn_keepalive(session);
    }

    /// Detach this session's channels so the next login elsewhere can
    /// claim them, then schedule the reconnect. Channels are not
    /// proactively reassigned to already-logged-in sessions.
    fn on_disconnected(&self, index: usize, reason: &str) {
        let freed = self.registry.detach_from_session(index);
        tracing::info!(
            account = self.config.lock().id,
            session = index,
            reason,
            freed_channels = freed,
            "session disconnected"
        );
        if self.cancel.is_cancelled() {
            return;
        }
        if let Some(session) = self.session_by_index(index) {
            if !session.cancel.is_cancelled() {
                self.schedule_reconnect(session);
            }
        }
    }

    fn on_message(&self, _index: usize, target: &str, sender: &str, text: &str, action: bool) {
        let id = self.config.lock().id;
        let text = if action {
            // Present CTCP ACTION the way a reader would see it.
            format!("* {text}")
        } else {
            text.to_string()
        };
        self.message_sink
            .on_message(id, target, sender, &text, crate::session::now_ms());
    }

    fn on_join_confirmed(&self, index: usize, channel: &str) {
        tracing::debug!(session = index, channel, "join confirmed");
        self.registry.mark_joined(channel);
    }

    fn on_part(&self, index: usize, channel: &str) {
        tracing::debug!(session = index, channel, "parted");
        self.registry.mark_parted(channel);
    }
}
