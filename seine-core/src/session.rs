//! One physical connection to the chat server.
//!
//! A [`Session`] owns the socket and the line-protocol state machine:
//! login, JOIN/PART, PRIVMSG, PING/PONG, numeric replies. It exposes
//! imperative send operations and reports inbound events to a
//! [`SessionListener`] (the owning account client). Event delivery is
//! synchronous on whichever multiplexer task is pumping the session,
//! so listeners must not block.
//!
//! Retry policy lives in the owner: a failed [`Session::connect`] is
//! reported, never retried here. A mid-session socket error fires the
//! disconnect callback exactly once per connection generation; the
//! owner then recycles the session with a fresh `connect()`.

use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::config::AccountConfig;
use crate::error::{Error, Result};
use crate::irc::{self, Message, CTCP_MARKER};
use crate::stats::SessionCounters;

/// Protocol state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionStatus {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    LoggedIn = 3,
}

impl SessionStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => SessionStatus::Connecting,
            2 => SessionStatus::Connected,
            3 => SessionStatus::LoggedIn,
            _ => SessionStatus::Disconnected,
        }
    }
}

/// Inbound protocol events, delivered inline on a multiplexer task.
///
/// Implementations only touch lock-protected structures or spawn
/// tasks; they never do their own blocking I/O.
pub trait SessionListener: Send + Sync {
    fn on_logged_in(&self, session: usize);
    fn on_disconnected(&self, session: usize, reason: &str);
    /// A chat line (PRIVMSG/NOTICE). `action` marks CTCP ACTION.
    fn on_message(&self, session: usize, target: &str, sender: &str, text: &str, action: bool);
    fn on_join_confirmed(&self, session: usize, channel: &str) {
        let _ = (session, channel);
    }
    fn on_part(&self, session: usize, channel: &str) {
        let _ = (session, channel);
    }
    fn on_pong(&self, session: usize, rtt_ms: u64) {
        let _ = (session, rtt_ms);
    }
}

/// Fixed-window send budget for one rate category. Over-limit sends
/// are declined, not queued.
struct RateGate {
    limit: u32,
    window: Mutex<(Instant, u32)>,
}

impl RateGate {
    fn new(limit: u32) -> Self {
        Self {
            limit,
            window: Mutex::new((Instant::now(), 0)),
        }
    }

    fn allow(&self) -> bool {
        if self.limit == 0 {
            return true;
        }
        let mut w = self.window.lock();
        if w.0.elapsed() >= Duration::from_secs(1) {
            *w = (Instant::now(), 0);
        }
        if w.1 < self.limit {
            w.1 += 1;
            true
        } else {
            false
        }
    }
}

/// One physical connection and its login/keepalive state.
pub struct Session {
    index: usize,
    nick: String,
    user: String,
    pass: String,
    server_addr: String,
    listener: Weak<dyn SessionListener>,
    /// Lifecycle token; cancelled by the owner on reload/removal
    /// before the session is dropped, so no timer fires afterwards.
    pub(crate) cancel: CancellationToken,

    sock: Mutex<Option<Arc<TcpStream>>>,
    recv_buf: Mutex<Vec<u8>>,
    status: AtomicU8,
    /// Bumped on every successful connect; lets stale keepalive tasks
    /// notice the session was recycled underneath them.
    generation: AtomicU64,
    disconnect_fired: AtomicBool,

    last_ping_ms: AtomicI64,
    last_pong_ms: AtomicI64,

    pub counters: SessionCounters,
    /// Reconnect backoff counter (saw-tooth, owned by the account
    /// client's policy). Not part of the drained stats.
    pub(crate) reconnect_attempts: AtomicU32,

    gate_commands: RateGate,
    gate_whispers: RateGate,
    gate_auth: RateGate,
}

impl Session {
    pub fn new(
        index: usize,
        config: &AccountConfig,
        server_addr: &str,
        listener: Weak<dyn SessionListener>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            index,
            nick: config.nick.clone(),
            user: config.user.clone(),
            pass: config.token.clone(),
            server_addr: server_addr.to_string(),
            listener,
            cancel,
            sock: Mutex::new(None),
            recv_buf: Mutex::new(Vec::new()),
            status: AtomicU8::new(SessionStatus::Disconnected as u8),
            generation: AtomicU64::new(0),
            // No live connection yet, so there is nothing to report.
            disconnect_fired: AtomicBool::new(true),
            last_ping_ms: AtomicI64::new(0),
            last_pong_ms: AtomicI64::new(0),
            counters: SessionCounters::default(),
            reconnect_attempts: AtomicU32::new(0),
            gate_commands: RateGate::new(config.rate.commands_per_sec),
            gate_whispers: RateGate::new(config.rate.whispers_per_sec),
            gate_auth: RateGate::new(config.rate.auths_per_sec),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    fn set_status(&self, s: SessionStatus) {
        self.status.store(s as u8, Ordering::Release);
    }

    /// Socket open and login sequence sent.
    pub fn connected(&self) -> bool {
        matches!(
            self.status(),
            SessionStatus::Connected | SessionStatus::LoggedIn
        )
    }

    pub fn logged_in(&self) -> bool {
        self.status() == SessionStatus::LoggedIn
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn last_ping_ms(&self) -> i64 {
        self.last_ping_ms.load(Ordering::Acquire)
    }

    pub fn last_pong_ms(&self) -> i64 {
        self.last_pong_ms.load(Ordering::Acquire)
    }

    /// Establish the transport and send the login sequence.
    ///
    /// Success means the socket is open and PASS/NICK/USER are on the
    /// wire; the session is `Connected` and waiting for the login
    /// numeric. Failures are returned to the caller — the reconnect
    /// policy lives in the account client.
    pub async fn connect(&self) -> Result<()> {
        SessionCounters::bump(&self.counters.connect_attempts);
        if !self.gate_auth.allow() {
            SessionCounters::bump(&self.counters.connects_failed);
            return Err(Error::Transport("login rate limit exceeded".into()));
        }
        self.set_status(SessionStatus::Connecting);

        let mut stream = match TcpStream::connect(&self.server_addr).await {
            Ok(s) => s,
            Err(e) => {
                SessionCounters::bump(&self.counters.connects_failed);
                self.set_status(SessionStatus::Disconnected);
                return Err(Error::Transport(format!(
                    "connect to {} failed: {e}",
                    self.server_addr
                )));
            }
        };

        let login = format!(
            "PASS {}\r\nNICK {}\r\nUSER {} 8 * :{}\r\n",
            self.pass, self.nick, self.user, self.user
        );
        if let Err(e) = stream.write_all(login.as_bytes()).await {
            SessionCounters::bump(&self.counters.connects_failed);
            self.set_status(SessionStatus::Disconnected);
            return Err(Error::Transport(format!("login write failed: {e}")));
        }
        SessionCounters::add(&self.counters.bytes_out, login.len() as u64);
        SessionCounters::add(&self.counters.lines_out, 3);

        self.recv_buf.lock().clear();
        self.last_ping_ms.store(0, Ordering::Release);
        // Baseline for the keepalive gap check; a link that never
        // pongs at all still times out relative to this.
        self.last_pong_ms.store(now_ms(), Ordering::Release);
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.disconnect_fired.store(false, Ordering::Release);
        *self.sock.lock() = Some(Arc::new(stream));
        self.set_status(SessionStatus::Connected);
        SessionCounters::bump(&self.counters.connects_ok);

        tracing::debug!(
            session = self.index,
            server = %self.server_addr,
            "connected, login sent"
        );
        Ok(())
    }

    /// Close the socket and fire the disconnect callback (once per
    /// connection generation). Safe to call from any thread and safe
    /// to call repeatedly.
    pub fn disconnect(&self, reason: &str) {
        let had_sock = self.sock.lock().take().is_some();
        self.set_status(SessionStatus::Disconnected);
        if !self.disconnect_fired.swap(true, Ordering::AcqRel) {
            tracing::debug!(session = self.index, reason, "disconnected");
            if let Some(listener) = self.listener.upgrade() {
                listener.on_disconnected(self.index, reason);
            }
        } else if had_sock {
            tracing::trace!(session = self.index, reason, "socket dropped");
        }
    }

    /// Current socket, for readiness polling. `None` while down.
    pub(crate) fn socket(&self) -> Option<Arc<TcpStream>> {
        self.sock.lock().clone()
    }

    // ── Send operations ──
    //
    // Each formats one protocol command, transmits it non-blockingly
    // and reports whether the transmit succeeded. Outbound counters
    // are bumped on success only.

    pub fn send_join(&self, channel: &str) -> bool {
        let channel = irc::normalize_channel(channel);
        self.send_command(&format!("JOIN {channel}"))
    }

    pub fn send_part(&self, channel: &str) -> bool {
        let channel = irc::normalize_channel(channel);
        self.send_command(&format!("PART {channel}"))
    }

    pub fn send_privmsg(&self, channel: &str, text: &str) -> bool {
        let channel = irc::normalize_channel(channel);
        self.send_command(&format!("PRIVMSG {channel} :{text}"))
    }

    pub fn send_notice(&self, target: &str, text: &str) -> bool {
        self.send_command(&format!("NOTICE {target} :{text}"))
    }

    /// PRIVMSG straight to a nick; separately rate-limited.
    pub fn send_whisper(&self, nick: &str, text: &str) -> bool {
        if !self.gate_whispers.allow() {
            tracing::debug!(session = self.index, nick, "whisper rate limited");
            return false;
        }
        if self.send_line(&format!("PRIVMSG {nick} :{text}")) {
            SessionCounters::bump(&self.counters.commands_out);
            true
        } else {
            false
        }
    }

    /// Send a keepalive PING stamped with the current time.
    pub fn send_ping(&self) -> bool {
        let now = now_ms();
        if self.send_line(&format!("PING :{now}")) {
            self.last_ping_ms.store(now, Ordering::Release);
            true
        } else {
            false
        }
    }

    fn send_pong(&self, payload: &str) -> bool {
        self.send_line(&format!("PONG :{payload}"))
    }

    pub fn send_raw(&self, line: &str) -> bool {
        self.send_command(line.trim_end_matches(['\r', '\n']))
    }

    pub fn send_quit(&self) -> bool {
        self.send_line("QUIT :bye")
    }

    fn send_command(&self, line: &str) -> bool {
        if !self.gate_commands.allow() {
            tracing::debug!(session = self.index, "command rate limited");
            return false;
        }
        if self.send_line(line) {
            SessionCounters::bump(&self.counters.commands_out);
            true
        } else {
            false
        }
    }

    /// Write one CRLF-terminated line without blocking. Protocol lines
    /// are short; a kernel buffer that cannot take a whole one means
    /// the link is stalled, and a partially written line would corrupt
    /// the stream, so that case tears the connection down.
    fn send_line(&self, line: &str) -> bool {
        let Some(sock) = self.socket() else {
            return false;
        };
        let mut buf = Vec::with_capacity(line.len() + 2);
        buf.extend_from_slice(line.as_bytes());
        buf.extend_from_slice(b"\r\n");

        let mut written = 0;
        while written < buf.len() {
            match sock.try_write(&buf[written..]) {
                Ok(0) => {
                    self.disconnect("write returned 0");
                    return false;
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if written == 0 {
                        return false;
                    }
                    self.disconnect("write stalled mid-line");
                    return false;
                }
                Err(e) => {
                    self.disconnect(&format!("write error: {e}"));
                    return false;
                }
            }
        }
        SessionCounters::add(&self.counters.bytes_out, buf.len() as u64);
        SessionCounters::bump(&self.counters.lines_out);
        true
    }

    // ── Inbound processing ──

    /// Drain whatever the socket has ready and dispatch complete
    /// lines. Called by the multiplexer when readiness was reported;
    /// never blocks.
    pub fn pump(&self) {
        let Some(sock) = self.socket() else {
            return;
        };

        let mut chunk = [0u8; 4096];
        loop {
            match sock.try_read(&mut chunk) {
                Ok(0) => {
                    self.disconnect("connection closed by server");
                    return;
                }
                Ok(n) => {
                    SessionCounters::add(&self.counters.bytes_in, n as u64);
                    self.recv_buf.lock().extend_from_slice(&chunk[..n]);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    self.disconnect(&format!("read error: {e}"));
                    return;
                }
            }
        }

        loop {
            let line = {
                let mut rb = self.recv_buf.lock();
                match rb.iter().position(|&b| b == b'\n') {
                    Some(pos) => rb.drain(..=pos).collect::<Vec<u8>>(),
                    None => break,
                }
            };
            SessionCounters::bump(&self.counters.lines_in);
            let line = String::from_utf8_lossy(&line);
            self.handle_line(line.trim_end_matches(['\r', '\n']));
        }
    }

    /// Dispatch one parsed server line. Runs on the multiplexer task;
    /// listener callbacks happen inline, in byte order.
    fn handle_line(&self, raw: &str) {
        let Some(msg) = Message::parse(raw) else {
            if !raw.is_empty() {
                tracing::trace!(session = self.index, raw, "unparseable line");
            }
            return;
        };

        match msg.command.as_str() {
            "PING" => {
                let payload = msg.params.first().map(String::as_str).unwrap_or("");
                self.send_pong(payload);
            }
            "PONG" => {
                let now = now_ms();
                self.last_pong_ms.store(now, Ordering::Release);
                // Our pings carry a millisecond timestamp as payload.
                let rtt = msg
                    .params
                    .last()
                    .and_then(|p| p.parse::<i64>().ok())
                    .map(|sent| now.saturating_sub(sent))
                    .unwrap_or_else(|| now.saturating_sub(self.last_ping_ms()))
                    .max(0) as u64;
                self.counters.last_rtt_ms.store(rtt, Ordering::Relaxed);
                if let Some(listener) = self.listener.upgrade() {
                    listener.on_pong(self.index, rtt);
                }
            }
            "001" => {
                // A disconnect racing this parse wins: a torn-down
                // session must not climb back to LoggedIn and start
                // claiming channels with no socket to JOIN them on.
                if self.disconnect_fired.load(Ordering::Acquire) {
                    return;
                }
                self.set_status(SessionStatus::LoggedIn);
                SessionCounters::bump(&self.counters.logins);
                tracing::info!(session = self.index, nick = %self.nick, "logged in");
                if let Some(listener) = self.listener.upgrade() {
                    listener.on_logged_in(self.index);
                }
            }
            "JOIN" if self.is_self(&msg) => {
                if let Some(channel) = msg.params.first() {
                    if let Some(listener) = self.listener.upgrade() {
                        listener.on_join_confirmed(self.index, channel);
                    }
                }
            }
            "PART" if self.is_self(&msg) => {
                if let Some(channel) = msg.params.first() {
                    if let Some(listener) = self.listener.upgrade() {
                        listener.on_part(self.index, channel);
                    }
                }
            }
            "PRIVMSG" | "NOTICE" => self.handle_chat(&msg),
            "ERROR" => {
                let reason = msg.params.last().cloned().unwrap_or_default();
                self.disconnect(&format!("server error: {reason}"));
            }
            _ if msg.is_numeric() => {
                tracing::trace!(session = self.index, code = %msg.command, "numeric reply");
            }
            _ => {
                tracing::trace!(session = self.index, command = %msg.command, "ignored");
            }
        }
    }

    fn handle_chat(&self, msg: &Message) {
        let target = msg.params.first().map(String::as_str).unwrap_or("");
        let text = msg.params.get(1).map(String::as_str).unwrap_or("");
        let sender = msg.sender_nick().unwrap_or("server");

        if let Some((keyword, body)) = irc::parse_ctcp(text) {
            match keyword {
                "ACTION" => self.deliver(target, sender, body, true),
                "VERSION" => {
                    self.send_notice(sender, &format!("{CTCP_MARKER}VERSION seine{CTCP_MARKER}"));
                }
                other => {
                    tracing::trace!(session = self.index, ctcp = other, "ignored CTCP");
                }
            }
            return;
        }
        self.deliver(target, sender, text, false);
    }

    fn deliver(&self, target: &str, sender: &str, text: &str, action: bool) {
        if let Some(listener) = self.listener.upgrade() {
            listener.on_message(self.index, target, sender, text, action);
        }
    }

    fn is_self(&self, msg: &Message) -> bool {
        msg.sender_nick()
            .is_some_and(|n| n.eq_ignore_ascii_case(&self.nick))
    }
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
