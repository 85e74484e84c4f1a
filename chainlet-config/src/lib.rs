//! Shared CLI flag surfaces and logging setup for the two binaries, kept in
//! one crate so the `--listen-host`/`--listen-port`/`--remote-host`/
//! `--remote-port` quartet isn't declared twice.

use clap::Parser;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Flags for the miner daemon: binds a full node, optionally bootstraps
/// against a remote peer, and mines under the given difficulty.
#[derive(Debug, Parser)]
#[command(about = "Mini proof-of-work ledger full node and miner")]
pub struct NodeArgs {
    /// Base58 public key the coinbase reward is paid to.
    #[arg(long)]
    pub pubkey: String,

    #[arg(long, default_value = "0.0.0.0")]
    pub listen_host: String,

    #[arg(long)]
    pub listen_port: u16,

    #[arg(long)]
    pub remote_host: Option<String>,

    #[arg(long)]
    pub remote_port: Option<u16>,

    #[arg(long, default_value_t = 10)]
    pub max_nodes: usize,

    #[arg(long, default_value_t = 3)]
    pub block_size: usize,

    #[arg(long, default_value_t = 5)]
    pub difficulty: usize,
}

impl NodeArgs {
    pub fn bootstrap(&self) -> Option<(String, u16)> {
        match (&self.remote_host, self.remote_port) {
            (Some(host), Some(port)) => Some((host.clone(), port)),
            _ => None,
        }
    }
}

/// Flags for the wallet REPL.
#[derive(Debug, Parser)]
#[command(about = "Mini proof-of-work ledger wallet")]
pub struct WalletArgs {
    /// Path to the binary key file. Prompts interactively if omitted.
    #[arg(short = 'w', long = "wallet-file")]
    pub wallet_file: Option<String>,

    #[arg(short = 'l', long = "listen-host", default_value = "localhost")]
    pub listen_host: String,

    #[arg(long = "listen-port", default_value_t = 8000)]
    pub listen_port: u16,

    #[arg(short = 'r', long = "remote-host", default_value = "localhost")]
    pub remote_host: String,

    #[arg(long = "remote-port")]
    pub remote_port: u16,
}

/// Installs a process-wide `tracing` subscriber at `level`, matching the
/// teacher's `FmtSubscriber`-at-startup convention.
pub fn init_logging(level: Level) {
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}
