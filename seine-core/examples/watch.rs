//! Watch example — one account, a few channels, messages printed to
//! the log.
//!
//! Usage:
//!   cargo run --example watch -- --server 127.0.0.1:6667 \
//!     --nick scout --token oauth:... --channel "#lobby" --channel "#dev"

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;

use seine_core::{
    AccountConfig, ConfigStore, LogStatsSink, MessageSink, Pool, PoolConfig,
};

#[derive(Parser)]
#[command(name = "watch", about = "seine-core watch example")]
struct Args {
    #[arg(long, default_value = "127.0.0.1:6667")]
    server: String,
    #[arg(long, default_value = "scout")]
    nick: String,
    #[arg(long, default_value = "")]
    token: String,
    #[arg(long = "channel")]
    channels: Vec<String>,
    #[arg(long, default_value_t = 1)]
    sessions: usize,
}

struct OneAccount {
    config: AccountConfig,
    channels: Vec<String>,
}

impl ConfigStore for OneAccount {
    fn load_accounts(&self) -> seine_core::Result<Vec<AccountConfig>> {
        Ok(vec![self.config.clone()])
    }

    fn load_channels_for(&self, _id: u64) -> seine_core::Result<Vec<String>> {
        Ok(self.channels.clone())
    }

    fn load_account(&self, _id: u64) -> seine_core::Result<AccountConfig> {
        Ok(self.config.clone())
    }
}

struct PrintSink;

impl MessageSink for PrintSink {
    fn on_message(&self, _id: u64, channel: &str, sender: &str, text: &str, _ts: i64) {
        println!("[{channel}] <{sender}> {text}");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let store = Arc::new(OneAccount {
        config: AccountConfig {
            id: 1,
            nick: args.nick.clone(),
            user: args.nick.clone(),
            token: args.token.clone(),
            channel_limit: 50,
            session_count: args.sessions,
            rate: Default::default(),
        },
        channels: args.channels.clone(),
    });

    let policy = PoolConfig {
        server_addr: args.server.clone(),
        ..PoolConfig::default()
    };

    let pool = Pool::new(policy, store, Arc::new(PrintSink), Arc::new(LogStatsSink));
    pool.start_from_store()?;

    tokio::signal::ctrl_c().await?;
    pool.shutdown();
    Ok(())
}
