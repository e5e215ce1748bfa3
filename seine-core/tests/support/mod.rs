//! Shared test fixtures: a scripted in-process IRC server, an
//! in-memory config store and collecting sinks.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};

use seine_core::{AccountConfig, ConfigStore, CountersSnapshot, MessageSink, PoolConfig, StatsSink};

/// Minimal scripted IRC server. Accepts any number of connections,
/// answers the login sequence with 001, echoes JOIN/PART, and records
/// every received line tagged with its connection number.
pub struct ScriptedServer {
    pub addr: String,
    inner: Arc<ServerInner>,
}

struct ServerInner {
    lines: Mutex<Vec<(usize, String)>>,
    writers: tokio::sync::Mutex<HashMap<usize, OwnedWriteHalf>>,
    answer_pings: AtomicBool,
    connections: AtomicUsize,
}

impl ScriptedServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let inner = Arc::new(ServerInner {
            lines: Mutex::new(Vec::new()),
            writers: tokio::sync::Mutex::new(HashMap::new()),
            answer_pings: AtomicBool::new(true),
            connections: AtomicUsize::new(0),
        });

        let accept_inner = inner.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let conn = accept_inner.connections.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(handle_connection(accept_inner.clone(), stream, conn));
            }
        });

        Self { addr, inner }
    }

    /// Every line received so far, as `(connection, line)`.
    pub fn received(&self) -> Vec<(usize, String)> {
        self.inner.lines.lock().clone()
    }

    pub fn lines_matching(&self, prefix: &str) -> Vec<(usize, String)> {
        self.received()
            .into_iter()
            .filter(|(_, l)| l.starts_with(prefix))
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.load(Ordering::SeqCst)
    }

    /// Stop answering client keepalive PINGs.
    pub fn mute_pongs(&self) {
        self.inner.answer_pings.store(false, Ordering::SeqCst);
    }

    /// Push a raw line to one client connection.
    pub async fn send_to(&self, conn: usize, line: &str) {
        self.inner.write(conn, line).await;
    }

    /// Close the server side of every open connection.
    pub async fn drop_all(&self) {
        let mut writers = self.inner.writers.lock().await;
        for (_, mut w) in writers.drain() {
            let _ = w.shutdown().await;
        }
    }
}

impl ServerInner {
    async fn write(&self, conn: usize, line: &str) {
        let mut writers = self.writers.lock().await;
        if let Some(w) = writers.get_mut(&conn) {
            let _ = w.write_all(format!("{line}\r\n").as_bytes()).await;
        }
    }
}

async fn handle_connection(inner: Arc<ServerInner>, stream: TcpStream, conn: usize) {
    let (read, write) = stream.into_split();
    inner.writers.lock().await.insert(conn, write);

    let mut lines = BufReader::new(read).lines();
    let mut nick = String::from("user");
    while let Ok(Some(line)) = lines.next_line().await {
        inner.lines.lock().push((conn, line.clone()));

        if let Some(n) = line.strip_prefix("NICK ") {
            nick = n.trim().to_string();
        } else if line.starts_with("USER ") {
            inner
                .write(conn, &format!(":seine.test 001 {nick} :Welcome"))
                .await;
        } else if let Some(rest) = line.strip_prefix("JOIN ") {
            let chan = rest.split_whitespace().next().unwrap_or(rest);
            inner
                .write(conn, &format!(":{nick}!{nick}@seine.test JOIN {chan}"))
                .await;
        } else if let Some(rest) = line.strip_prefix("PART ") {
            let chan = rest.split_whitespace().next().unwrap_or(rest);
            inner
                .write(conn, &format!(":{nick}!{nick}@seine.test PART {chan}"))
                .await;
        } else if let Some(payload) = line.strip_prefix("PING ") {
            if inner.answer_pings.load(Ordering::SeqCst) {
                let payload = payload.trim_start_matches(':');
                inner
                    .write(conn, &format!(":seine.test PONG seine.test :{payload}"))
                    .await;
            }
        }
    }
    inner.writers.lock().await.remove(&conn);
}

/// In-memory config store.
#[derive(Default)]
pub struct MemStore {
    pub accounts: Mutex<Vec<AccountConfig>>,
    pub channels: Mutex<HashMap<u64, Vec<String>>>,
}

impl MemStore {
    pub fn with_account(config: AccountConfig, channels: Vec<String>) -> Arc<Self> {
        let store = Self::default();
        store.channels.lock().insert(config.id, channels);
        store.accounts.lock().push(config);
        Arc::new(store)
    }

    pub fn set_channels(&self, account_id: u64, channels: Vec<String>) {
        self.channels.lock().insert(account_id, channels);
    }
}

impl ConfigStore for MemStore {
    fn load_accounts(&self) -> seine_core::Result<Vec<AccountConfig>> {
        Ok(self.accounts.lock().clone())
    }

    fn load_channels_for(&self, account_id: u64) -> seine_core::Result<Vec<String>> {
        Ok(self
            .channels
            .lock()
            .get(&account_id)
            .cloned()
            .unwrap_or_default())
    }

    fn load_account(&self, account_id: u64) -> seine_core::Result<AccountConfig> {
        self.accounts
            .lock()
            .iter()
            .find(|a| a.id == account_id)
            .cloned()
            .ok_or_else(|| seine_core::Error::Config(format!("no account {account_id}")))
    }
}

/// Message sink that collects everything it is handed.
#[derive(Default)]
pub struct CollectSink {
    pub messages: Mutex<Vec<(u64, String, String, String)>>,
}

impl MessageSink for CollectSink {
    fn on_message(&self, account_id: u64, channel: &str, sender: &str, text: &str, _ts: i64) {
        self.messages.lock().push((
            account_id,
            channel.to_string(),
            sender.to_string(),
            text.to_string(),
        ));
    }
}

/// Stats sink that remembers the last snapshot per session.
#[derive(Default)]
pub struct CollectStats {
    pub sessions: Mutex<HashMap<(u64, usize), CountersSnapshot>>,
    pub assignments: Mutex<Vec<(String, Option<usize>)>>,
}

impl StatsSink for CollectStats {
    fn on_session_stats(&self, account_id: u64, session: usize, counters: &CountersSnapshot) {
        self.sessions
            .lock()
            .insert((account_id, session), counters.clone());
    }

    fn on_channel_assignment_snapshot(
        &self,
        _account_id: u64,
        assignments: &[(String, Option<usize>)],
    ) {
        *self.assignments.lock() = assignments.to_vec();
    }
}

pub fn account(id: u64, nick: &str, sessions: usize) -> AccountConfig {
    serde_json::from_value(serde_json::json!({
        "id": id,
        "nick": nick,
        "user": nick,
        "token": "oauth:test",
        "session_count": sessions,
        "channel_limit": 50,
        "rate": { "commands_per_sec": 0, "whispers_per_sec": 0, "auths_per_sec": 0 },
    }))
    .unwrap()
}

/// Policy tuned for tests: short polls, quick keepalive.
pub fn fast_policy(server_addr: &str) -> PoolConfig {
    PoolConfig {
        server_addr: server_addr.to_string(),
        multiplexer_count: 2,
        poll_interval: Duration::from_millis(20),
        idle_sleep: Duration::from_millis(20),
        login_timeout: Duration::from_millis(1500),
        ping_interval: Duration::from_millis(100),
        pong_timeout: Duration::from_millis(400),
        connect_attempt_limit: 10,
        // Long enough that the periodic report never races a test's
        // own counter snapshots.
        stats_interval: Duration::from_secs(3600),
    }
}

/// Poll `predicate` until it holds or `timeout` elapses.
pub async fn wait_for(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
