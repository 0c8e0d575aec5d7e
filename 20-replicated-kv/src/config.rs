//! Replica configuration and peer-list loading.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(2000);
pub const DEFAULT_ELECTION_TIMEOUT: Duration = Duration::from_millis(5000);
pub const DEFAULT_APPLY_RETRIES: u32 = 3;

/// How the leader decides an entry has reached enough replicas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuorumRule {
    /// Leader plus acknowledging peers form a strict majority of the cluster.
    #[default]
    Majority,
    /// The upper median of the peers' sent lengths has reached the entry.
    Median,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("replica address must not be empty")]
    EmptyAddr,
    #[error("heartbeat interval {heartbeat:?} must be shorter than election timeout {election:?}")]
    HeartbeatTooSlow {
        heartbeat: Duration,
        election: Duration,
    },
    #[error("peer list contains this replica's own address {0}")]
    SelfInPeers(String),
    #[error("peer {0} listed more than once")]
    DuplicatePeer(String),
    #[error("failed to read peer file {path}: {source}")]
    PeerFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    /// host:port other replicas and clients use to reach this replica.
    pub addr: String,
    /// Every other replica in the cluster. Fixed for the process lifetime.
    pub peers: Vec<String>,
    pub heartbeat_interval: Duration,
    pub election_timeout: Duration,
    /// Per-request timeout for outbound replica RPCs.
    pub rpc_timeout: Duration,
    /// Upper bound on how long a write waits for quorum. `None` waits until
    /// leadership is lost.
    pub write_timeout: Option<Duration>,
    pub quorum: QuorumRule,
    /// Extra attempts at applying a committed entry before giving up.
    pub apply_retries: u32,
}

impl ReplicaConfig {
    pub fn new(addr: impl Into<String>, peers: Vec<String>) -> Self {
        Self {
            addr: addr.into(),
            peers,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            election_timeout: DEFAULT_ELECTION_TIMEOUT,
            rpc_timeout: DEFAULT_ELECTION_TIMEOUT,
            write_timeout: None,
            quorum: QuorumRule::default(),
            apply_retries: DEFAULT_APPLY_RETRIES,
        }
    }

    /// Sets both timers; the RPC timeout follows the election timeout.
    pub fn with_timeouts(mut self, heartbeat: Duration, election: Duration) -> Self {
        self.heartbeat_interval = heartbeat;
        self.election_timeout = election;
        self.rpc_timeout = election;
        self
    }

    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn with_quorum(mut self, quorum: QuorumRule) -> Self {
        self.quorum = quorum;
        self
    }

    pub fn with_apply_retries(mut self, retries: u32) -> Self {
        self.apply_retries = retries;
        self
    }

    pub fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }

    /// Votes (self included) needed to win an election.
    pub fn majority(&self) -> usize {
        self.cluster_size() / 2 + 1
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.addr.trim().is_empty() {
            return Err(ConfigError::EmptyAddr);
        }
        if self.heartbeat_interval >= self.election_timeout {
            return Err(ConfigError::HeartbeatTooSlow {
                heartbeat: self.heartbeat_interval,
                election: self.election_timeout,
            });
        }
        let mut seen = HashSet::new();
        for peer in &self.peers {
            if peer == &self.addr {
                return Err(ConfigError::SelfInPeers(peer.clone()));
            }
            if !seen.insert(peer.as_str()) {
                return Err(ConfigError::DuplicatePeer(peer.clone()));
            }
        }
        Ok(())
    }
}

/// Parses a peer list: one host:port per line, `#` starts a comment.
///
/// The replica's own address is skipped so every member can share one file.
pub fn parse_peers(text: &str, self_addr: &str) -> Vec<String> {
    text.lines()
        .map(|line| line.split('#').next().unwrap_or_default().trim())
        .filter(|line| !line.is_empty() && *line != self_addr)
        .map(str::to_owned)
        .collect()
}

pub fn load_peers(path: &Path, self_addr: &str) -> Result<Vec<String>, ConfigError> {
    let text = fs::read_to_string(path).map_err(|source| ConfigError::PeerFile {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(parse_peers(&text, self_addr))
}
