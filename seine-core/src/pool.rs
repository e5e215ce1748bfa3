//! The pool facade the outer account controller talks to.
//!
//! Owns the multiplexer pool and one [`AccountClient`] per account.
//! Accounts can be added, removed and reloaded at runtime; a bad
//! account fails to start on its own and never takes the others down.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use crate::account::AccountClient;
use crate::config::{AccountConfig, PoolConfig};
use crate::error::{Error, Result};
use crate::hooks::{ConfigStore, MessageSink, StatsSink};
use crate::multiplexer::MultiplexerPool;
use crate::stats::CountersSnapshot;

/// Connection pool over many accounts.
pub struct Pool {
    policy: PoolConfig,
    mux: Arc<MultiplexerPool>,
    accounts: RwLock<HashMap<u64, Arc<AccountClient>>>,
    store: Arc<dyn ConfigStore>,
    message_sink: Arc<dyn MessageSink>,
    stats_sink: Arc<dyn StatsSink>,
    cancel: CancellationToken,
}

impl Pool {
    /// Build the pool and start its multiplexer tasks. No accounts
    /// are running yet; call [`Pool::start_from_store`] or
    /// [`Pool::add_account`].
    pub fn new(
        policy: PoolConfig,
        store: Arc<dyn ConfigStore>,
        message_sink: Arc<dyn MessageSink>,
        stats_sink: Arc<dyn StatsSink>,
    ) -> Arc<Self> {
        let cancel = CancellationToken::new();
        let mux = MultiplexerPool::start(&policy, cancel.child_token());
        Arc::new(Self {
            policy,
            mux,
            accounts: RwLock::new(HashMap::new()),
            store,
            message_sink,
            stats_sink,
            cancel,
        })
    }

    /// Load and start every account in the store. An account that
    /// fails to start is logged and skipped. Returns how many started.
    pub fn start_from_store(&self) -> Result<usize> {
        let configs = self.store.load_accounts()?;
        let mut started = 0;
        for config in configs {
            let id = config.id;
            match self.add_account(config) {
                Ok(()) => started += 1,
                Err(e) => {
                    tracing::error!(account = id, error = %e, "account failed to start");
                }
            }
        }
        Ok(started)
    }

    pub fn add_account(&self, config: AccountConfig) -> Result<()> {
        let id = config.id;
        let mut accounts = self.accounts.write();
        if accounts.contains_key(&id) {
            return Err(Error::AccountExists(id));
        }
        let client = Arc::new(AccountClient::start(
            config,
            self.policy.clone(),
            self.mux.clone(),
            self.store.clone(),
            self.message_sink.clone(),
            &self.cancel,
        )?);
        self.spawn_stats_task(id, &client);
        accounts.insert(id, client);
        Ok(())
    }

    pub fn remove_account(&self, id: u64) -> Result<()> {
        let client = self
            .accounts
            .write()
            .remove(&id)
            .ok_or(Error::AccountNotFound(id))?;
        client.shutdown();
        Ok(())
    }

    /// Reload an account's configuration. `new_config: None` fetches
    /// the current config from the store.
    pub fn reload_account(&self, id: u64, new_config: Option<AccountConfig>) -> Result<()> {
        let client = self.account(id)?;
        let config = match new_config {
            Some(c) => c,
            None => self.store.load_account(id)?,
        };
        if config.id != id {
            return Err(Error::Config(format!(
                "reload for account {id} carries id {}",
                config.id
            )));
        }
        client.reload(config)
    }

    pub fn join_channel(&self, account_id: u64, channel: &str) -> Result<()> {
        self.account(account_id)?.join_channel(channel)
    }

    /// Leave a channel on every account that has it registered. Every
    /// account is visited even when one fails; the first real failure
    /// is reported if no account succeeded.
    pub fn leave_channel(&self, channel: &str) -> Result<()> {
        let clients: Vec<Arc<AccountClient>> =
            self.accounts.read().values().cloned().collect();
        let mut found = false;
        let mut first_err = None;
        for client in clients {
            match client.leave_channel(channel) {
                Ok(()) => found = true,
                Err(Error::ChannelNotFound(_)) => {}
                Err(e) => {
                    tracing::warn!(account = client.id(), channel, error = %e, "leave failed");
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
        }
        if found {
            Ok(())
        } else if let Some(e) = first_err {
            Err(e)
        } else {
            Err(Error::ChannelNotFound(channel.to_string()))
        }
    }

    pub fn send_message(&self, account_id: u64, channel: &str, text: &str) -> Result<()> {
        self.account(account_id)?.send_message(channel, text)
    }

    pub fn send_whisper(&self, account_id: u64, nick: &str, text: &str) -> Result<()> {
        self.account(account_id)?.send_whisper(nick, text)
    }

    pub fn send_raw(&self, account_id: u64, line: &str) -> Result<()> {
        self.account(account_id)?.send_raw(line)
    }

    pub fn snapshot_stats(&self, account_id: u64) -> Result<Vec<(usize, CountersSnapshot)>> {
        Ok(self.account(account_id)?.snapshot_stats())
    }

    pub fn snapshot_channels(&self, account_id: u64) -> Result<Vec<String>> {
        Ok(self.account(account_id)?.snapshot_channels())
    }

    pub fn account_ids(&self) -> Vec<u64> {
        self.accounts.read().keys().copied().collect()
    }

    pub fn account(&self, id: u64) -> Result<Arc<AccountClient>> {
        self.accounts
            .read()
            .get(&id)
            .cloned()
            .ok_or(Error::AccountNotFound(id))
    }

    /// Stop everything: accounts, their sessions, the multiplexers.
    pub fn shutdown(&self) {
        tracing::info!("pool shutting down");
        self.cancel.cancel();
        let clients: Vec<Arc<AccountClient>> = {
            let mut accounts = self.accounts.write();
            accounts.drain().map(|(_, c)| c).collect()
        };
        for client in clients {
            client.shutdown();
        }
        self.mux.shutdown();
    }

    /// Periodic stats report for one account. Exits when the account
    /// is removed (the weak ref dies) or the pool shuts down.
    fn spawn_stats_task(&self, id: u64, client: &Arc<AccountClient>) {
        let weak = Arc::downgrade(client);
        let sink = self.stats_sink.clone();
        let interval = self.policy.stats_interval;
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
                let Some(client) = weak.upgrade() else {
                    return;
                };
                for (index, counters) in client.snapshot_stats() {
                    sink.on_session_stats(id, index, &counters);
                }
                let assignments = client.assignment_snapshot();
                sink.on_channel_assignment_snapshot(id, &assignments);
            }
        });
    }
}
