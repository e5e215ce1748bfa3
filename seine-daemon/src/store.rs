//! JSON-file configuration store.
//!
//! The file is re-read on every load, so an account reload picks up
//! edits without restarting the daemon. Schema:
//!
//! ```json
//! {
//!   "accounts": [
//!     {
//!       "id": 1,
//!       "nick": "scout",
//!       "user": "scout",
//!       "token": "oauth:...",
//!       "session_count": 2,
//!       "channels": ["#lobby", "#dev"]
//!     }
//!   ]
//! }
//! ```

use std::path::PathBuf;

use serde::Deserialize;

use seine_core::{AccountConfig, ConfigStore, Error};

#[derive(Debug, Deserialize)]
struct StoreFile {
    accounts: Vec<StoredAccount>,
}

#[derive(Debug, Deserialize)]
struct StoredAccount {
    #[serde(flatten)]
    config: AccountConfig,
    #[serde(default)]
    channels: Vec<String>,
}

/// [`ConfigStore`] backed by one JSON file.
pub struct JsonStore {
    path: PathBuf,
}

impl JsonStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn read(&self) -> seine_core::Result<StoreFile> {
        let raw = std::fs::read_to_string(&self.path)
            .map_err(|e| Error::Config(format!("read {}: {e}", self.path.display())))?;
        serde_json::from_str(&raw)
            .map_err(|e| Error::Config(format!("parse {}: {e}", self.path.display())))
    }
}

impl ConfigStore for JsonStore {
    fn load_accounts(&self) -> seine_core::Result<Vec<AccountConfig>> {
        Ok(self.read()?.accounts.into_iter().map(|a| a.config).collect())
    }

    fn load_channels_for(&self, account_id: u64) -> seine_core::Result<Vec<String>> {
        Ok(self
            .read()?
            .accounts
            .into_iter()
            .find(|a| a.config.id == account_id)
            .map(|a| a.channels)
            .unwrap_or_default())
    }

    fn load_account(&self, account_id: u64) -> seine_core::Result<AccountConfig> {
        self.read()?
            .accounts
            .into_iter()
            .map(|a| a.config)
            .find(|c| c.id == account_id)
            .ok_or_else(|| Error::Config(format!("no account {account_id} in store")))
    }
}
