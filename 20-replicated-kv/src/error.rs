use std::time::Duration;

use crate::kv::KvError;
use crate::wal::{Op, WalError};

/// Everything a replica operation can fail with.
#[derive(Debug, thiserror::Error)]
pub enum ReplicaError {
    #[error("not the leader (current leader: {})", .leader.as_deref().unwrap_or("unknown"))]
    NotLeader { leader: Option<String> },

    #[error("key {0} already exists")]
    KeyExists(String),

    #[error("key {0} does not exist")]
    KeyNotFound(String),

    #[error("compare-and-swap on {key} failed: expected {expected:?}, found {actual:?}")]
    CasMismatch {
        key: String,
        expected: String,
        actual: String,
    },

    #[error("{0} operations cannot be submitted to the log")]
    Unsupported(Op),

    #[error("message from term {remote} is older than local term {local}")]
    StaleTerm { local: u64, remote: u64 },

    #[error("replicate message for term {term} sent to the leader of that term")]
    Rejected { term: u64 },

    #[error("write was not replicated to a quorum within {0:?}")]
    Timeout(Duration),

    #[error("write-ahead log failure: {0}")]
    Log(#[from] WalError),

    #[error("key-value store failure: {0}")]
    Storage(#[source] KvError),

    /// The replica can no longer guarantee its log matches the cluster.
    #[error("consistency fault: {0}")]
    Consistency(String),

    #[error("role driver failed: {0}")]
    Driver(String),
}

impl ReplicaError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ReplicaError::Consistency(_))
    }
}

impl From<KvError> for ReplicaError {
    fn from(err: KvError) -> Self {
        match err {
            KvError::NotFound(key) => ReplicaError::KeyNotFound(key),
            other => ReplicaError::Storage(other),
        }
    }
}
