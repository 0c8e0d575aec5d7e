//! Messages exchanged between replicas.
//!
//! Field names on the wire are fixed; existing deployments speak this JSON.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::wal::LogEntry;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRequest {
    /// Address of the candidate asking for the vote.
    #[serde(default)]
    pub candidate: String,
    /// Candidate's committed log length.
    #[serde(rename = "log_len")]
    pub log_len: u64,
    /// Term of the candidate's last committed entry.
    #[serde(rename = "log_term")]
    pub log_term: u64,
    #[serde(rename = "election_term")]
    pub term: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: u64,
    #[serde(rename = "answer")]
    pub granted: bool,
}

/// Kind of replicate message, carried in the URL path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReplicateKind {
    #[serde(rename = "heartbeat")]
    Heartbeat,
    #[serde(rename = "logappend")]
    Append,
    #[serde(rename = "logcommit")]
    Commit,
}

impl ReplicateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplicateKind::Heartbeat => "heartbeat",
            ReplicateKind::Append => "logappend",
            ReplicateKind::Commit => "logcommit",
        }
    }
}

impl fmt::Display for ReplicateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown replicate kind {0:?}")]
pub struct UnknownKind(pub String);

impl FromStr for ReplicateKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "heartbeat" => Ok(ReplicateKind::Heartbeat),
            "logappend" => Ok(ReplicateKind::Append),
            "logcommit" => Ok(ReplicateKind::Commit),
            other => Err(UnknownKind(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicateRequest {
    pub term: u64,
    /// Address of the sending leader.
    #[serde(default)]
    pub leader: String,
    #[serde(rename = "log_entry")]
    pub entry: LogEntry,
}

/// A follower's view of its log after handling a replicate message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicateAck {
    /// Follower's uncommitted length.
    #[serde(rename = "len")]
    pub len: u64,
    /// Whether the follower has nothing staged beyond its committed tail.
    pub committed: bool,
}
