//! The replica: owns the state, the key-value store and the transport, and
//! runs whichever role driver the current role calls for.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::{ConfigError, ReplicaConfig};
use crate::error::ReplicaError;
use crate::kv::{self, KeyValueStore};
use crate::state::{ReplicaState, Role};
use crate::transport::Transport;
use crate::wal::{LogEntry, WriteAheadLog};

const APPLY_BACKOFF: Duration = Duration::from_millis(50);

/// Aborts the driver task when the loop moves on or is itself dropped.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Point-in-time view of a replica, served on `/status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaStatus {
    pub addr: String,
    pub role: Role,
    pub term: u64,
    pub leader: Option<String>,
    pub committed: u64,
    pub uncommitted: u64,
}

pub struct Replica {
    pub(crate) config: ReplicaConfig,
    pub(crate) state: ReplicaState,
    pub(crate) kv: Arc<dyn KeyValueStore>,
    pub(crate) transport: Arc<dyn Transport>,
    /// Serializes client writes; at most one entry waits for quorum.
    pub(crate) write_lock: Mutex<()>,
    fault: watch::Sender<Option<String>>,
}

impl Replica {
    pub fn new(
        config: ReplicaConfig,
        wal: WriteAheadLog,
        kv: Arc<dyn KeyValueStore>,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;
        let state = ReplicaState::new(wal, &config.peers, config.election_timeout);
        let (fault, _) = watch::channel(None);
        Ok(Arc::new(Self {
            config,
            state,
            kv,
            transport,
            write_lock: Mutex::new(()),
            fault,
        }))
    }

    pub fn addr(&self) -> &str {
        &self.config.addr
    }

    pub fn config(&self) -> &ReplicaConfig {
        &self.config
    }

    pub fn current_role(&self) -> Role {
        self.state.role()
    }

    pub fn current_term(&self) -> u64 {
        self.state.term()
    }

    pub async fn leader_address(&self) -> Option<String> {
        self.state.lock().await.leader.clone()
    }

    /// The most recently committed entry.
    pub async fn last_op(&self) -> LogEntry {
        self.state.lock().await.wal.last_op()
    }

    /// Every committed entry, oldest first. Reads the whole durable log.
    pub async fn committed_entries(&self) -> Result<Vec<LogEntry>, ReplicaError> {
        let g = self.state.lock().await;
        let mut entries = g.wal.suffix(0)?;
        entries.reverse();
        Ok(entries)
    }

    pub async fn status(&self) -> ReplicaStatus {
        let g = self.state.lock().await;
        ReplicaStatus {
            addr: self.config.addr.clone(),
            role: self.state.role(),
            term: self.state.term(),
            leader: g.leader.clone(),
            committed: g.wal.len_committed(),
            uncommitted: g.wal.len_uncommitted(),
        }
    }

    /// Reason for the consistency fault that stopped this replica, if any.
    pub fn fault_reason(&self) -> Option<String> {
        self.fault.borrow().clone()
    }

    /// Records an unrecoverable fault. [`Replica::run`] returns with it.
    pub(crate) fn raise_fault(&self, reason: String) -> ReplicaError {
        error!(addr = %self.config.addr, %reason, "consistency fault");
        self.fault.send_replace(Some(reason.clone()));
        ReplicaError::Consistency(reason)
    }

    /// Applies a committed entry, retrying a bounded number of times. An
    /// entry that stays unapplicable is a consistency fault: the log says it
    /// happened and the store disagrees.
    pub(crate) async fn apply_committed(&self, entry: &LogEntry) -> Result<String, ReplicaError> {
        let mut attempt = 0;
        loop {
            match kv::apply(self.kv.as_ref(), entry) {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.config.apply_retries => {
                    attempt += 1;
                    warn!(index = entry.index, attempt, error = %err, "apply failed, retrying");
                    tokio::time::sleep(APPLY_BACKOFF * attempt).await;
                }
                Err(err) => {
                    return Err(self.raise_fault(format!(
                        "entry {} is committed but could not be applied: {err}",
                        entry.index
                    )))
                }
            }
        }
    }

    /// Runs role drivers until a consistency fault occurs.
    pub async fn run(self: Arc<Self>) -> Result<(), ReplicaError> {
        self.run_until(std::future::pending()).await
    }

    /// Runs role drivers until `shutdown` resolves or a consistency fault
    /// occurs.
    pub async fn run_until<F>(self: Arc<Self>, shutdown: F) -> Result<(), ReplicaError>
    where
        F: Future<Output = ()> + Send,
    {
        tokio::pin!(shutdown);
        let mut faults = self.fault.subscribe();

        loop {
            if let Some(reason) = faults.borrow_and_update().clone() {
                return Err(ReplicaError::Consistency(reason));
            }

            let epoch = self.state.epoch();
            let role = self.state.role();
            info!(addr = %self.config.addr, role = %role, term = self.state.term(), "role driver starting");

            let this = Arc::clone(&self);
            let mut driver = AbortOnDrop(match role {
                Role::Follower => tokio::spawn(this.run_follower(epoch)),
                Role::Candidate => tokio::spawn(this.run_election(epoch)),
                Role::Leader => tokio::spawn(this.run_leader(epoch)),
            });

            tokio::select! {
                joined = &mut driver.0 => match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) if err.is_fatal() => return Err(err),
                    Ok(Err(err)) => {
                        warn!(role = %role, error = %err, "role driver failed");
                        tokio::time::sleep(self.config.heartbeat_interval).await;
                    }
                    Err(err) => return Err(ReplicaError::Driver(err.to_string())),
                },
                _ = faults.changed() => {}
                _ = &mut shutdown => {
                    info!(addr = %self.config.addr, "replica shutting down");
                    return Ok(());
                }
            }
        }
    }

    /// Waits out the heartbeat timeout, then stands for election.
    async fn run_follower(self: Arc<Self>, epoch: u64) -> Result<(), ReplicaError> {
        tokio::select! {
            _ = self.state.timer.expired() => {}
            _ = self.state.epoch_changed(epoch) => return Ok(()),
        }

        let mut g = self.state.lock().await;
        // A message may have re-armed the timer while we waited for the guard.
        if self.state.epoch() != epoch || !self.state.timer.is_expired() {
            return Ok(());
        }
        info!(term = self.state.term(), "no word from a leader, starting election");
        g.leader = None;
        self.state.transition(&mut g, Role::Candidate);
        Ok(())
    }
}
