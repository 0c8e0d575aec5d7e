//! The client write path.
//!
//! A write is checked against the current store, appended to the leader's
//! staging buffer and held until enough peers acknowledge it. It is then
//! committed to the durable log and applied to the store. Writes are
//! serialized; only one entry is ever waiting for quorum.

use std::time::Duration;

use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::error::ReplicaError;
use crate::kv::KvError;
use crate::replica::Replica;
use crate::state::{Guarded, Role};
use crate::wal::{LogEntry, Op};

impl Replica {
    /// Submits a create, update or delete and returns once it is applied.
    ///
    /// Create and update return the stored value, delete returns the value
    /// that was removed. `value` is ignored for deletes.
    pub async fn submit(&self, op: Op, key: &str, value: &str) -> Result<String, ReplicaError> {
        match op {
            Op::Create | Op::Update | Op::Delete => {
                self.submit_entry(LogEntry::new(op, key, value, "", 0)).await
            }
            Op::Read | Op::Cas => Err(ReplicaError::Unsupported(op)),
        }
    }

    /// Replaces the value of `key` with `new` only if it currently equals
    /// `expected`.
    pub async fn compare_and_swap(
        &self,
        key: &str,
        expected: &str,
        new: &str,
    ) -> Result<String, ReplicaError> {
        self.submit_entry(LogEntry::new(Op::Cas, key, expected, new, 0)).await
    }

    /// Reads this replica's store directly, without going through the log.
    pub fn read_local(&self, key: &str) -> Result<String, ReplicaError> {
        Ok(self.kv.read(key)?)
    }

    async fn submit_entry(&self, mut entry: LogEntry) -> Result<String, ReplicaError> {
        let _serialized = self.write_lock.lock().await;
        let mut g = self.state.lock().await;
        let epoch = self.state.epoch();
        if self.state.role() != Role::Leader {
            return Err(ReplicaError::NotLeader {
                leader: g.leader.clone(),
            });
        }

        let previous = self.check_precondition(&entry)?;
        let op = entry.op;
        let key = entry.operand.clone();
        entry.term = self.state.term();
        let index = g.wal.append(entry);
        let required = g.wal.len_uncommitted();
        self.state.timer.reset(Duration::ZERO);
        debug!(index, key = %key, "entry staged, waiting for quorum");

        let deadline = self.config.write_timeout.map(|timeout| Instant::now() + timeout);
        while !g.progress.replicated(self.config.quorum, required) {
            let progressed = self.state.progress.notified();
            tokio::pin!(progressed);
            progressed.as_mut().enable();
            drop(g);

            let abort = tokio::select! {
                _ = &mut progressed => None,
                _ = self.state.epoch_changed(epoch) => Some(ReplicaError::NotLeader { leader: None }),
                _ = expire(deadline) => self.config.write_timeout.map(ReplicaError::Timeout),
            };

            g = self.state.lock().await;
            let abort = match abort {
                None if self.state.epoch() != epoch => Some(ReplicaError::NotLeader { leader: None }),
                other => other,
            };
            if let Some(err) = abort {
                self.abandon(&mut g, epoch, index);
                let err = match err {
                    ReplicaError::NotLeader { .. } => ReplicaError::NotLeader {
                        leader: g.leader.clone(),
                    },
                    other => other,
                };
                warn!(index, key = %key, error = %err, "write abandoned");
                return Err(err);
            }
        }

        let flushed = g.wal.commit().map(|_| ());
        if let Err(err) = flushed {
            self.abandon(&mut g, epoch, index);
            return Err(err.into());
        }
        let committed = g.wal.last_op();
        let applied = self.apply_committed(&committed).await?;
        drop(g);

        info!(index, key = %key, op = ?op, "write committed");
        Ok(match op {
            Some(Op::Delete) => previous.unwrap_or_default(),
            _ => applied,
        })
    }

    /// Validates a write against the current store. Returns the current
    /// value, if any.
    fn check_precondition(&self, entry: &LogEntry) -> Result<Option<String>, ReplicaError> {
        let key = &entry.operand;
        let current = match self.kv.read(key) {
            Ok(value) => Some(value),
            Err(KvError::NotFound(_)) => None,
            Err(err) => return Err(err.into()),
        };

        match (entry.op, current) {
            (Some(Op::Create), Some(_)) => Err(ReplicaError::KeyExists(key.clone())),
            (Some(Op::Update | Op::Delete | Op::Cas), None) => {
                Err(ReplicaError::KeyNotFound(key.clone()))
            }
            (Some(Op::Cas), Some(actual)) if actual != entry.value1 => {
                Err(ReplicaError::CasMismatch {
                    key: key.clone(),
                    expected: entry.value1.clone(),
                    actual,
                })
            }
            (_, current) => Ok(current),
        }
    }

    /// Drops a write that will not complete. If leadership was lost the new
    /// role has already cleared the staging buffer.
    fn abandon(&self, g: &mut Guarded, epoch: u64, index: u64) {
        if self.state.epoch() != epoch {
            return;
        }
        let dropped = g.wal.discard_uncommitted();
        let committed = g.wal.len_committed();
        g.progress.clamp_sent(committed);
        debug!(index, dropped, committed, "staged write discarded");
    }
}

async fn expire(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
