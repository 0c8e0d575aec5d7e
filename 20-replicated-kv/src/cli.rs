use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueHint};

use crate::config::{self, QuorumRule, ReplicaConfig};

pub const DEFAULT_LOG_PATH: &str = "/tmp/replicated-kv.log";

#[derive(Parser, Debug)]
#[command(author, version, about = "Run one replica of the replicated key-value store", long_about = None)]
pub struct Cli {
    /// Address peers and clients use to reach this replica, e.g. 10.0.0.1:40404
    #[arg(long, value_hint = ValueHint::Hostname)]
    pub addr: String,

    /// Address to bind the HTTP server to. Defaults to --addr.
    #[arg(long)]
    pub listen: Option<String>,

    /// File listing every replica, one host:port per line
    #[arg(long, value_hint = ValueHint::FilePath)]
    pub peers: PathBuf,

    /// Durable write-ahead log
    #[arg(long, default_value = DEFAULT_LOG_PATH, value_hint = ValueHint::FilePath)]
    pub log: PathBuf,

    /// Key-value data file
    #[arg(long, value_hint = ValueHint::FilePath)]
    pub db: PathBuf,

    #[arg(long, default_value_t = 2000)]
    pub heartbeat_ms: u64,

    #[arg(long, default_value_t = 5000)]
    pub election_timeout_ms: u64,

    /// Timeout for requests to peers. Defaults to the election timeout.
    #[arg(long)]
    pub rpc_timeout_ms: Option<u64>,

    /// Give up on writes that do not reach quorum in time. Unbounded if unset.
    #[arg(long)]
    pub write_timeout_ms: Option<u64>,

    #[arg(long, value_enum, default_value_t = QuorumRule::Majority)]
    pub quorum: QuorumRule,
}

impl Cli {
    pub fn listen_addr(&self) -> &str {
        self.listen.as_deref().unwrap_or(&self.addr)
    }

    pub fn replica_config(&self) -> Result<ReplicaConfig> {
        let peers = config::load_peers(&self.peers, &self.addr)
            .with_context(|| format!("loading peers from {}", self.peers.display()))?;

        let mut config = ReplicaConfig::new(self.addr.clone(), peers)
            .with_timeouts(
                Duration::from_millis(self.heartbeat_ms),
                Duration::from_millis(self.election_timeout_ms),
            )
            .with_write_timeout(self.write_timeout_ms.map(Duration::from_millis))
            .with_quorum(self.quorum);
        if let Some(ms) = self.rpc_timeout_ms {
            config = config.with_rpc_timeout(Duration::from_millis(ms));
        }
        config.validate().context("invalid replica configuration")?;
        Ok(config)
    }
}
