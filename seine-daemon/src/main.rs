//! seine-daemon: run a connection pool from a JSON account file.
//!
//! Connects every configured account to the chat server, keeps them
//! joined to their channels, and writes received chat lines to the
//! log. Edit the account file and send an account reload (or restart)
//! to pick up changes.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;

use seine_core::{LogStatsSink, MessageSink, Pool, PoolConfig};

mod store;
use store::JsonStore;

#[derive(Parser)]
#[command(name = "seine-daemon", about = "Multi-account IRC connection pool")]
struct Args {
    /// Chat server address (host:port)
    #[arg(long, default_value = "127.0.0.1:6667")]
    server: String,

    /// Path to the JSON account file
    #[arg(long)]
    config: PathBuf,

    /// Number of multiplexer tasks
    #[arg(long, default_value_t = 2)]
    multiplexers: usize,

    /// Stats report period in seconds
    #[arg(long, default_value_t = 10)]
    stats_secs: u64,
}

/// Sink that writes every received chat line to the log.
struct TraceSink;

impl MessageSink for TraceSink {
    fn on_message(
        &self,
        account_id: u64,
        channel: &str,
        sender: &str,
        text: &str,
        _timestamp_ms: i64,
    ) {
        tracing::info!(account = account_id, channel, sender, text, "message");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "seine_daemon=info,seine_core=info".into()),
        )
        .init();

    let args = Args::parse();

    let policy = PoolConfig {
        server_addr: args.server.clone(),
        multiplexer_count: args.multiplexers,
        stats_interval: Duration::from_secs(args.stats_secs.max(1)),
        ..PoolConfig::default()
    };

    tracing::info!(
        server = %args.server,
        config = %args.config.display(),
        multiplexers = args.multiplexers,
        "starting seine-daemon"
    );

    let store = Arc::new(JsonStore::new(args.config));
    let pool = Pool::new(policy, store, Arc::new(TraceSink), Arc::new(LogStatsSink));

    let started = pool.start_from_store()?;
    if started == 0 {
        tracing::warn!("no accounts started; check the account file");
    }
    tracing::info!(accounts = started, "pool running. Ctrl+C to stop.");

    tokio::signal::ctrl_c().await?;
    pool.shutdown();
    Ok(())
}
